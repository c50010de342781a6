/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::fmt;
use std::os::unix::io::RawFd;

pub use nix::sys::signal::Signal;
pub use nix::unistd::Pid;
use syscalls::Errno;
use syscalls::SyscallArgs;
use syscalls::Sysno;

use crate::regs::Reg;
use crate::regs::RegAccess;
use crate::regs::Regs;
use crate::Error;

/// Thread id and pid used to identify a stopped thread to the debugger.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ThreadId {
    pub pid: Pid,
    pub tid: Pid,
}

impl ThreadId {
    pub fn new(pid: Pid, tid: Pid) -> Self {
        ThreadId { pid, tid }
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}.{}", self.pid, self.tid)
    }
}

/// Who placed a breakpoint.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BreakpointKind {
    /// Placed by the replay machinery for its own bookkeeping.
    Internal,
    /// Requested by the debugger client.
    User,
}

/// A traced thread that can be driven through an experiment.
///
/// Every method that touches the tracee assumes it is in a ptrace-stop. The
/// resume methods block until the tracee stops again.
pub trait Task {
    /// Thread id of the live task.
    fn tid(&self) -> Pid;

    /// Thread group id (i.e. the pid).
    fn tgid(&self) -> Pid;

    /// The tid this thread had in the recording. This is what the debugger
    /// knows the thread as.
    fn rec_tid(&self) -> Pid {
        self.tid()
    }

    /// Identity reported to the debugger.
    fn thread_id(&self) -> ThreadId {
        ThreadId::new(self.tgid(), self.rec_tid())
    }

    /// Snapshot of the general purpose registers.
    fn regs(&self) -> Result<Regs, Error>;

    /// Replaces the general purpose registers.
    fn set_regs(&mut self, regs: Regs) -> Result<(), Error>;

    /// Current instruction pointer.
    fn ip(&self) -> Result<Reg, Error> {
        Ok(self.regs()?.ip())
    }

    /// Completes a syscall that was intercepted at its entry stop without the
    /// kernel running it. The return value must already be in the registers.
    /// A signal that stops the task on the way out is left pending.
    fn finish_emulated_syscall(&mut self) -> Result<(), Error>;

    /// Resumes until the next syscall-entry stop or signal, never running the
    /// syscall (`PTRACE_SYSEMU`).
    fn cont_sysemu(&mut self) -> Result<(), Error>;

    /// Like [`Task::cont_sysemu`], but stops after at most one instruction
    /// (`PTRACE_SYSEMU_SINGLESTEP`).
    fn cont_sysemu_singlestep(&mut self) -> Result<(), Error>;

    /// The signal that interrupted the last resume, if any.
    fn pending_sig(&self) -> Option<Signal>;

    /// Consumes the pending signal without delivering it to the tracee.
    fn take_pending_sig(&mut self) -> Option<Signal>;

    /// Reads tracee memory into `buf`. Returns the number of bytes read, which
    /// is less than `buf.len()` if the range is only partially mapped. Fails
    /// if nothing at `addr` could be read.
    fn read_bytes_fallible(&self, addr: Reg, buf: &mut [u8]) -> Result<usize, Errno>;

    /// Writes `buf` into tracee memory.
    fn write_bytes(&mut self, addr: Reg, buf: &[u8]) -> Result<(), Error>;

    /// Kind of breakpoint placed at `addr`, if any.
    fn breakpoint_at(&self, addr: Reg) -> Option<BreakpointKind>;

    fn set_breakpoint(&mut self, addr: Reg, kind: BreakpointKind) -> Result<(), Error>;

    fn remove_breakpoint(&mut self, addr: Reg) -> Result<(), Error>;

    /// The perf event fd whose enable/disable ioctls arm and disarm the
    /// desched notification of the in-tracee preload library.
    fn desched_fd(&self) -> Option<RawFd> {
        None
    }

    /// Runs `nr` with `args` for real on behalf of the task and returns the
    /// raw kernel result. The task's registers are restored afterwards.
    ///
    /// If a signal stops the task first, the result is `-EINTR` and the
    /// signal is left pending.
    fn inject_syscall(&mut self, nr: Sysno, args: SyscallArgs) -> Result<Reg, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_id_display() {
        let id = ThreadId::new(Pid::from_raw(10), Pid::from_raw(12));
        assert_eq!(id.to_string(), "p10.12");
    }
}
