/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use nix::sys::signal::Signal;

use crate::emulate::Disposition;
use crate::emulate::SyscallTable;
use crate::regs::RegAccess;
use crate::DebugRequest;
use crate::Error;
use crate::Task;

/// How a resume ended.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Advance {
    /// A signal stopped the task. It is still pending.
    Interrupted(Signal),
    /// The task reached a syscall, which has been dealt with.
    SyscallHandled(Disposition),
}

impl Advance {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Advance::Interrupted(_))
    }
}

/// Resumes `task` as `req` asks until the next syscall-entry or signal stop,
/// then handles the syscall if there is one.
///
/// # Panics
///
/// If `req` doesn't resume, or if the task still has a signal pending from
/// its previous stop.
pub fn advance<T: Task>(
    task: &mut T,
    req: &DebugRequest,
    syscalls: &mut SyscallTable<T>,
) -> Result<Advance, Error> {
    assert!(
        task.pending_sig().is_none(),
        "(tid {}) advancing with pending signal {:?}",
        task.tid(),
        task.pending_sig()
    );

    match req {
        DebugRequest::Continue { .. } => task.cont_sysemu()?,
        DebugRequest::Step { .. } => task.cont_sysemu_singlestep()?,
        req => panic!("Illegal debug request {:?}", req),
    }

    if let Some(sig) = task.pending_sig() {
        tracing::debug!("(tid {}) interrupted by {}", task.tid(), sig);
        return Ok(Advance::Interrupted(sig));
    }

    let syscallno = task.regs()?.orig_syscall();
    let disposition = syscalls.dispatch(task, syscallno)?;

    // Finishing or forwarding the syscall resumes the task, and a signal can
    // arrive while it runs.
    if let Some(sig) = task.pending_sig() {
        tracing::debug!(
            "(tid {}) interrupted by {} after {:?}",
            task.tid(),
            sig,
            disposition
        );
        return Ok(Advance::Interrupted(sig));
    }
    Ok(Advance::SyscallHandled(disposition))
}
