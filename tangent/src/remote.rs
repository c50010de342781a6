/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Running real syscalls on behalf of a task.

use syscalls::SyscallArgs;
use syscalls::Sysno;

use crate::regs::Reg;
use crate::regs::RegAccess;
use crate::regs::Regs;
use crate::Errno;
use crate::Error;
use crate::Task;

/// Register context saved around one or more injected syscalls.
///
/// `finish` puts the saved registers back with the chosen return value.
/// Dropping the context without finishing leaves whatever registers the last
/// injection produced.
pub struct RemoteSyscalls<'a, T: Task> {
    task: &'a mut T,
    regs: Regs,
}

impl<'a, T: Task> RemoteSyscalls<'a, T> {
    pub fn prepare(task: &'a mut T) -> Result<Self, Error> {
        let regs = task.regs()?;
        Ok(RemoteSyscalls { task, regs })
    }

    /// The registers as they were when the context was prepared.
    pub fn regs(&self) -> &Regs {
        &self.regs
    }

    pub fn syscall6(&mut self, nr: Sysno, args: SyscallArgs) -> Result<Reg, Error> {
        tracing::trace!(
            "(tid {}) remote syscall {} with {:?}",
            self.task.tid(),
            nr,
            args
        );
        self.task.inject_syscall(nr, args)
    }

    /// Restores the saved registers with `ret` as the syscall result.
    pub fn finish(mut self, ret: Reg) -> Result<(), Error> {
        *self.regs.ret_mut() = ret;
        self.task.set_regs(self.regs)
    }
}

/// Executes the syscall the task is parked on, exactly as the tracee set it
/// up, and makes the real kernel result the tracee's return value.
pub fn execute_syscall<T: Task>(task: &mut T) -> Result<i64, Error> {
    task.finish_emulated_syscall()?;

    let mut remote = RemoteSyscalls::prepare(task)?;
    let regs = *remote.regs();
    let nr = Sysno::new(regs.orig_syscall() as usize).ok_or(Errno::ENOSYS)?;
    let (a0, a1, a2, a3, a4, a5) = regs.args();
    let ret = remote.syscall6(
        nr,
        SyscallArgs::new(
            a0 as usize,
            a1 as usize,
            a2 as usize,
            a3 as usize,
            a4 as usize,
            a5 as usize,
        ),
    )?;
    remote.finish(ret)?;
    Ok(ret as i64)
}

#[cfg(test)]
mod tests {
    use nix::unistd::Pid;

    use super::*;
    use crate::testing::syscall_regs;
    use crate::testing::FakeTask;

    #[test]
    fn forwards_parked_syscall_verbatim() {
        let mut task = FakeTask::new(Pid::from_raw(5))
            .with_regs(syscall_regs(Sysno::munmap, [0x7000_0000, 0x2000, 0, 0, 0, 0]))
            .with_inject_result(0);
        let before = task.regs().unwrap();

        assert_eq!(execute_syscall(&mut task).unwrap(), 0);

        let log = task.log();
        assert_eq!(
            log.injected,
            vec![(
                Sysno::munmap,
                SyscallArgs::new(0x7000_0000, 0x2000, 0, 0, 0, 0)
            )]
        );
        assert_eq!(log.finished, 1);

        let after = task.regs().unwrap();
        assert_eq!(after.rax, 0);
        assert_eq!(after.rip, before.rip);
        assert_eq!(after.args(), before.args());
    }

    #[test]
    fn failure_is_returned_bit_for_bit() {
        let enomem = -(Errno::ENOMEM.into_raw() as i64) as Reg;
        let mut task = FakeTask::new(Pid::from_raw(5))
            .with_regs(syscall_regs(Sysno::mmap, [0, 1 << 40, 3, 0x22, !0, 0]))
            .with_inject_result(enomem);

        assert_eq!(
            execute_syscall(&mut task).unwrap(),
            -(Errno::ENOMEM.into_raw() as i64)
        );
        assert_eq!(task.regs().unwrap().rax, enomem);
    }
}
