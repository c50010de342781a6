/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Scripted stand-ins for tasks and sessions, for testing code that drives
//! experiments without a live tracee.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use syscalls::Errno;
use syscalls::SyscallArgs;
use syscalls::Sysno;

use crate::regs;
use crate::regs::Reg;
use crate::regs::RegAccess;
use crate::regs::Regs;
use crate::BreakpointKind;
use crate::Error;
use crate::ExperimentSession;
use crate::ReplaySession;
use crate::Task;

/// Where a fake task sits after its syscall instruction.
pub const SYSCALL_IP: Reg = 0x40_1000;

/// Install a tracing collector in the way that we like. Safe to call from
/// every test.
pub fn init_tracing() {
    let collector = tracing_subscriber::fmt()
        .with_env_filter("tangent=trace")
        .with_test_writer()
        .finish();

    // Tests run in parallel and we don't care who "wins".
    tracing::subscriber::set_global_default(collector).unwrap_or(());
}

static SERIAL: Mutex<()> = Mutex::new(());

/// Only one experiment can be live per process, so tests that start one hold
/// this guard.
pub fn serial() -> MutexGuard<'static, ()> {
    // A failed test poisons the lock. That's no reason to fail the others.
    SERIAL.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An in-memory writer whose clones share a buffer.
#[derive(Clone, Default, Debug)]
pub struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl io::Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Registers of a task parked at the entry of syscall `nr`, as left by
/// `PTRACE_SYSEMU`.
pub fn syscall_regs(nr: Sysno, args: [Reg; 6]) -> Regs {
    let mut regs = regs::zeroed();
    *regs.ip_mut() = SYSCALL_IP;
    *regs.orig_syscall_mut() = nr.id() as Reg;
    *regs.ret_mut() = -(libc::ENOSYS as i64) as Reg;
    regs.set_args((args[0], args[1], args[2], args[3], args[4], args[5]));
    regs
}

/// A scripted stop: the registers and pending signal a resume ends with.
#[derive(Clone, Debug)]
pub struct Stop {
    pub regs: Regs,
    pub signal: Option<Signal>,
}

/// How a fake task was resumed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Resume {
    Continue,
    Step,
}

/// What was done to a fake task, shared between all clones of it.
#[derive(Clone, Default, Debug)]
pub struct TaskLog {
    pub injected: Vec<(Sysno, SyscallArgs)>,
    pub finished: usize,
    pub resumes: Vec<Resume>,
}

/// A task that replays a script of stops instead of running anything.
///
/// Resuming pops the next [`Stop`]. Once the script runs out the task behaves
/// as if it had exited.
#[derive(Clone, Debug)]
pub struct FakeTask {
    tid: Pid,
    tgid: Pid,
    rec_tid: Option<Pid>,
    regs: Regs,
    pending: Option<Signal>,
    stops: VecDeque<Stop>,
    memory: Vec<(Reg, Vec<u8>)>,
    breakpoints: HashMap<Reg, BreakpointKind>,
    desched_fd: Option<RawFd>,
    inject_results: VecDeque<Reg>,
    finish_signal: Option<Signal>,
    inject_signal: Option<Signal>,
    log: Arc<Mutex<TaskLog>>,
}

impl FakeTask {
    pub fn new(tid: Pid) -> Self {
        FakeTask {
            tid,
            tgid: tid,
            rec_tid: None,
            regs: regs::zeroed(),
            pending: None,
            stops: VecDeque::new(),
            memory: Vec::new(),
            breakpoints: HashMap::new(),
            desched_fd: None,
            inject_results: VecDeque::new(),
            finish_signal: None,
            inject_signal: None,
            log: Default::default(),
        }
    }

    pub fn with_tgid(mut self, tgid: Pid) -> Self {
        self.tgid = tgid;
        self
    }

    pub fn with_rec_tid(mut self, rec_tid: Pid) -> Self {
        self.rec_tid = Some(rec_tid);
        self
    }

    pub fn with_regs(mut self, regs: Regs) -> Self {
        self.regs = regs;
        self
    }

    /// Maps `bytes` at `addr`. Regions must not overlap.
    pub fn with_memory(mut self, addr: Reg, bytes: &[u8]) -> Self {
        self.memory.push((addr, bytes.to_vec()));
        self
    }

    pub fn with_desched_fd(mut self, fd: RawFd) -> Self {
        self.desched_fd = Some(fd);
        self
    }

    /// Queues the raw result of the next injected syscall. Injections without
    /// a queued result return 0.
    pub fn with_inject_result(mut self, ret: Reg) -> Self {
        self.inject_results.push_back(ret);
        self
    }

    /// The next emulated syscall is finished, but `sig` stops the task on
    /// the way out.
    pub fn with_signal_during_finish(mut self, sig: Signal) -> Self {
        self.finish_signal = Some(sig);
        self
    }

    /// `sig` interrupts the next injected syscall before it runs.
    pub fn with_signal_during_inject(mut self, sig: Signal) -> Self {
        self.inject_signal = Some(sig);
        self
    }

    pub fn with_breakpoint(mut self, addr: Reg, kind: BreakpointKind) -> Self {
        self.breakpoints.insert(addr, kind);
        self
    }

    pub fn then_stop(mut self, stop: Stop) -> Self {
        self.stops.push_back(stop);
        self
    }

    /// The next resume stops at the entry of `nr`.
    pub fn then_syscall(self, nr: Sysno, args: [Reg; 6]) -> Self {
        self.then_stop(Stop {
            regs: syscall_regs(nr, args),
            signal: None,
        })
    }

    /// The next resume is interrupted by `sig` with the ip at `ip`.
    pub fn then_signal(self, sig: Signal, ip: Reg) -> Self {
        let mut regs = regs::zeroed();
        *regs.ip_mut() = ip;
        self.then_stop(Stop {
            regs,
            signal: Some(sig),
        })
    }

    pub fn log(&self) -> TaskLog {
        self.log_mut().clone()
    }

    fn log_mut(&self) -> MutexGuard<'_, TaskLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resume(&mut self, how: Resume) -> Result<(), Error> {
        self.log_mut().resumes.push(how);
        let stop = self.stops.pop_front().ok_or(Error::TaskExited(self.tid))?;
        self.regs = stop.regs;
        self.pending = stop.signal;
        Ok(())
    }

    fn region(&self, addr: Reg) -> Option<(usize, usize)> {
        self.memory.iter().enumerate().find_map(|(i, (start, bytes))| {
            let offset = addr.checked_sub(*start)?;
            (offset < bytes.len() as Reg).then_some((i, offset as usize))
        })
    }
}

impl Task for FakeTask {
    fn tid(&self) -> Pid {
        self.tid
    }

    fn tgid(&self) -> Pid {
        self.tgid
    }

    fn rec_tid(&self) -> Pid {
        self.rec_tid.unwrap_or(self.tid)
    }

    fn regs(&self) -> Result<Regs, Error> {
        Ok(self.regs)
    }

    fn set_regs(&mut self, regs: Regs) -> Result<(), Error> {
        self.regs = regs;
        Ok(())
    }

    fn finish_emulated_syscall(&mut self) -> Result<(), Error> {
        self.log_mut().finished += 1;
        if let Some(sig) = self.finish_signal.take() {
            self.pending = Some(sig);
        }
        Ok(())
    }

    fn cont_sysemu(&mut self) -> Result<(), Error> {
        self.resume(Resume::Continue)
    }

    fn cont_sysemu_singlestep(&mut self) -> Result<(), Error> {
        self.resume(Resume::Step)
    }

    fn pending_sig(&self) -> Option<Signal> {
        self.pending
    }

    fn take_pending_sig(&mut self) -> Option<Signal> {
        self.pending.take()
    }

    fn read_bytes_fallible(&self, addr: Reg, buf: &mut [u8]) -> Result<usize, Errno> {
        if buf.is_empty() {
            return Ok(0);
        }
        let (i, offset) = self.region(addr).ok_or(Errno::EFAULT)?;
        let src = &self.memory[i].1[offset..];
        let n = src.len().min(buf.len());
        buf[..n].copy_from_slice(&src[..n]);
        Ok(n)
    }

    fn write_bytes(&mut self, addr: Reg, buf: &[u8]) -> Result<(), Error> {
        if buf.is_empty() {
            return Ok(());
        }
        let (i, offset) = self.region(addr).ok_or(Errno::EFAULT)?;
        let dst = &mut self.memory[i].1[offset..];
        if dst.len() < buf.len() {
            return Err(Errno::EFAULT.into());
        }
        dst[..buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn breakpoint_at(&self, addr: Reg) -> Option<BreakpointKind> {
        self.breakpoints.get(&addr).copied()
    }

    fn set_breakpoint(&mut self, addr: Reg, kind: BreakpointKind) -> Result<(), Error> {
        self.breakpoints.insert(addr, kind);
        Ok(())
    }

    fn remove_breakpoint(&mut self, addr: Reg) -> Result<(), Error> {
        self.breakpoints.remove(&addr);
        Ok(())
    }

    fn desched_fd(&self) -> Option<RawFd> {
        self.desched_fd
    }

    fn inject_syscall(&mut self, nr: Sysno, args: SyscallArgs) -> Result<Reg, Error> {
        if let Some(sig) = self.inject_signal.take() {
            self.pending = Some(sig);
            return Ok(-(libc::EINTR as i64) as Reg);
        }
        self.log_mut().injected.push((nr, args));
        Ok(self.inject_results.pop_front().unwrap_or(0))
    }
}

/// A session of [`FakeTask`]s.
#[derive(Debug, Default)]
pub struct FakeSession {
    tasks: BTreeMap<Pid, FakeTask>,
    kills: Arc<AtomicUsize>,
}

impl FakeSession {
    pub fn new(tasks: Vec<FakeTask>) -> Self {
        FakeSession {
            tasks: tasks.into_iter().map(|t| (t.tid(), t)).collect(),
            kills: Default::default(),
        }
    }
}

impl ExperimentSession for FakeSession {
    type Task = FakeTask;

    fn find_task(&self, tid: Pid) -> Option<&FakeTask> {
        self.tasks.get(&tid)
    }

    fn find_task_mut(&mut self, tid: Pid) -> Option<&mut FakeTask> {
        self.tasks.get_mut(&tid)
    }

    fn task_ids(&self) -> Vec<Pid> {
        self.tasks.keys().copied().collect()
    }

    fn kill_all_tasks(&mut self) {
        self.tasks.clear();
        self.kills.fetch_add(1, Ordering::SeqCst);
    }
}

/// A replay whose experiments start from clones of a fixed set of tasks.
#[derive(Debug)]
pub struct FakeReplay {
    tasks: Vec<FakeTask>,
    kills: Arc<AtomicUsize>,
}

impl FakeReplay {
    pub fn new(tasks: Vec<FakeTask>) -> Self {
        FakeReplay {
            tasks,
            kills: Default::default(),
        }
    }

    /// How many experiment sessions were torn down.
    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }
}

impl ReplaySession for FakeReplay {
    type Experiment = FakeSession;

    fn clone_experiment(&self) -> Result<FakeSession, Error> {
        let mut session = FakeSession::new(self.tasks.clone());
        session.kills = self.kills.clone();
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_runs_out() {
        let mut task = FakeTask::new(Pid::from_raw(1))
            .then_syscall(Sysno::getpid, [0; 6])
            .then_signal(Signal::SIGSEGV, 0x1234);

        task.cont_sysemu().unwrap();
        assert_eq!(task.regs().unwrap().orig_rax, Sysno::getpid.id() as Reg);
        assert_eq!(task.pending_sig(), None);

        task.cont_sysemu_singlestep().unwrap();
        assert_eq!(task.ip().unwrap(), 0x1234);
        assert_eq!(task.take_pending_sig(), Some(Signal::SIGSEGV));
        assert_eq!(task.pending_sig(), None);

        assert!(matches!(task.cont_sysemu(), Err(Error::TaskExited(_))));
        assert_eq!(
            task.log().resumes,
            [Resume::Continue, Resume::Step, Resume::Continue]
        );
    }

    #[test]
    fn memory_regions() {
        let mut task = FakeTask::new(Pid::from_raw(1)).with_memory(0x100, b"abcd");
        let mut buf = [0u8; 8];
        assert_eq!(task.read_bytes_fallible(0x102, &mut buf), Ok(2));
        assert_eq!(&buf[..2], b"cd");
        assert_eq!(task.read_bytes_fallible(0x104, &mut buf), Err(Errno::EFAULT));

        task.write_bytes(0x101, b"XY").unwrap();
        assert_eq!(task.read_bytes_fallible(0x100, &mut buf), Ok(4));
        assert_eq!(&buf[..4], b"aXYd");
        assert!(task.write_bytes(0x103, b"XY").is_err());
    }
}
