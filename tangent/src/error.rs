/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Error handling.

use nix::unistd::Pid;
pub use syscalls::Errno;
use thiserror::Error;

/// An error that ends an experiment. Conditions that only affect the tracee
/// (unhandled syscalls, short memory reads) are never reported through this
/// type.
#[derive(Error, Debug)]
pub enum Error {
    /// A low-level errno.
    #[error(transparent)]
    Errno(#[from] Errno),

    /// An I/O error on the tracer side.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The debugger client went away.
    #[error("debugger channel disconnected")]
    Disconnected,

    /// Only one experiment may be live in a process.
    #[error("an experiment session is already active")]
    ExperimentActive,

    /// The session has no task with this id.
    #[error("unknown task {0}")]
    UnknownTask(Pid),

    /// The task exited or was killed while it was being controlled.
    #[error("task {0} is gone")]
    TaskExited(Pid),

    /// A generic error produced by a collaborator.
    #[error(transparent)]
    Tool(#[from] anyhow::Error),
}

impl Error {
    /// Extracts the errno from the error. If this is not an `Error::Errno`, then
    /// returns `Err(Error)`. Useful for turning a failed debugger request into
    /// an error reply while propagating everything else.
    pub fn into_errno(self) -> Result<Errno, Self> {
        match self {
            Self::Errno(err) => Ok(err),
            Self::UnknownTask(_) | Self::TaskExited(_) => Ok(Errno::ESRCH),
            err => Err(err),
        }
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(err: nix::errno::Errno) -> Self {
        Self::Errno(Errno::new(err as i32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn into_errno() {
        assert_eq!(
            Error::from(nix::errno::Errno::EFAULT).into_errno().ok(),
            Some(Errno::EFAULT)
        );
        assert_eq!(
            Error::UnknownTask(Pid::from_raw(7)).into_errno().ok(),
            Some(Errno::ESRCH)
        );
        assert!(Error::Disconnected.into_errno().is_err());
    }
}
