/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use syscalls::Errno;

use crate::regs::Reg;
use crate::regs::Regs;
use crate::ThreadId;

/// A command from the debugger client.
#[derive(Clone, PartialEq, Debug)]
pub enum DebugRequest {
    /// Resume until the next syscall or signal.
    Continue { thread: Option<ThreadId> },
    /// Resume for a single instruction or until the next syscall.
    Step { thread: Option<ThreadId> },
    /// The client restarted the replay.
    Restart,
    /// Read `len` bytes of siginfo for the current stop.
    ReadSiginfo { len: usize },
    /// Overwrite the siginfo of the current stop.
    WriteSiginfo,
    /// Select the thread subsequent queries and resumes apply to (`Hg`).
    SetQueryThread { thread: ThreadId },
    /// Inspection and breakpoint commands.
    Other(GenericRequest),
}

impl DebugRequest {
    /// Fulfilling the request requires running tracee instructions.
    pub fn is_resume(&self) -> bool {
        matches!(
            self,
            DebugRequest::Continue { .. } | DebugRequest::Step { .. }
        )
    }
}

/// Requests the experiment driver has no special handling for.
#[derive(Clone, PartialEq, Debug)]
pub enum GenericRequest {
    ReadRegisters,
    WriteRegisters(Regs),
    /// Read inferior memory. The reply may be shorter than `len`.
    ReadMemory { addr: Reg, len: usize },
    WriteMemory { addr: Reg, data: Vec<u8> },
    SetBreakpoint(Reg),
    RemoveBreakpoint(Reg),
    ThreadList,
    CurrentThread,
}

/// Reply sent back to the debugger client.
#[derive(Clone, PartialEq, Debug)]
pub enum DebugReply {
    Siginfo(Vec<u8>),
    SiginfoWritten,
    /// The thread stopped with `signal` after a resume.
    Stopped { thread: ThreadId, signal: i32 },
    Registers(Regs),
    Memory(Vec<u8>),
    Threads(Vec<ThreadId>),
    Thread(ThreadId),
    Ok,
    Error(Errno),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_class() {
        assert!(DebugRequest::Continue { thread: None }.is_resume());
        assert!(DebugRequest::Step { thread: None }.is_resume());
        assert!(!DebugRequest::Restart.is_resume());
        assert!(!DebugRequest::ReadSiginfo { len: 128 }.is_resume());
        assert!(!DebugRequest::Other(GenericRequest::ThreadList).is_resume());
    }
}
