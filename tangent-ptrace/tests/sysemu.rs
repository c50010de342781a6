/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! An experiment on a real forked child.

use std::cell::RefCell;

use nix::sys::ptrace;
use nix::sys::signal;
use nix::sys::signal::Signal;
use nix::sys::wait::waitpid;
use nix::sys::wait::WaitStatus;
use nix::unistd::fork;
use nix::unistd::ForkResult;
use nix::unistd::Pid;
use syscalls::SyscallArgs;
use syscalls::Sysno;
use tangent::emulate::HostIo;
use tangent::regs::Reg;
use tangent::testing::init_tracing;
use tangent::testing::SharedBuf;
use tangent::Config;
use tangent::DebugReply;
use tangent::DebugRequest;
use tangent::Errno;
use tangent::Error;
use tangent::Experimenter;
use tangent::GenericRequest;
use tangent::RemoteDebugger;
use tangent::ReplaySession;
use tangent::Task;
use tangent_ptrace::PtraceTask;
use tangent_ptrace::TaskGroup;

/// Hands out an already attached group once.
struct Attached(RefCell<Option<TaskGroup>>);

impl ReplaySession for Attached {
    type Experiment = TaskGroup;

    fn clone_experiment(&self) -> Result<TaskGroup, Error> {
        self.0.borrow_mut().take().ok_or(Error::Errno(Errno::EAGAIN))
    }
}

// Only raw syscalls after the fork.
fn tracee_main() -> ! {
    const MSG: &[u8] = b"hello";
    unsafe {
        libc::kill(libc::getpid(), libc::SIGSTOP);
        libc::write(1, MSG.as_ptr() as *const libc::c_void, MSG.len());
        libc::mmap(
            core::ptr::null_mut(),
            4096,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        loop {
            libc::sched_yield();
        }
    }
}

fn spawn_stopped() -> Pid {
    match unsafe { fork() }.unwrap() {
        ForkResult::Parent { child } => {
            assert_eq!(
                waitpid(child, None).unwrap(),
                WaitStatus::Stopped(child, Signal::SIGSTOP)
            );
            child
        }
        ForkResult::Child => {
            if ptrace::traceme().is_err() {
                unsafe { libc::_exit(1) };
            }
            tracee_main()
        }
    }
}

fn registers(replies: &mut tokio::sync::mpsc::Receiver<DebugReply>) -> libc::user_regs_struct {
    match replies.try_recv() {
        Ok(DebugReply::Registers(regs)) => regs,
        reply => panic!("expected registers, got {:?}", reply),
    }
}

#[test]
fn write_is_emulated_and_mmap_is_real() {
    init_tracing();

    let pid = spawn_stopped();
    let task = match PtraceTask::new(pid, pid) {
        Ok(task) => task,
        Err(err) => {
            let _ = signal::kill(pid, Signal::SIGKILL);
            panic!("failed to take over {}: {}", pid, err);
        }
    };
    let replay = Attached(RefCell::new(Some([task].into_iter().collect())));

    let (mut dbg, client) = RemoteDebugger::channel(16);
    let mut replies = client.replies;
    for req in [
        DebugRequest::Continue { thread: None },
        DebugRequest::Other(GenericRequest::ReadRegisters),
        DebugRequest::Continue { thread: None },
        DebugRequest::Other(GenericRequest::ReadRegisters),
        DebugRequest::Restart,
    ] {
        client.requests.blocking_send(req).unwrap();
    }

    let stdout = SharedBuf::default();
    let mut experimenter = Experimenter::new(Config::default())
        .with_host_io(HostIo::with_writers(stdout.clone(), SharedBuf::default(), 2));
    let mut req = DebugRequest::Restart;
    experimenter.run(&replay, &mut dbg, pid, &mut req).unwrap();

    assert_eq!(stdout.contents(), b"hello");

    let regs = registers(&mut replies);
    assert_eq!(regs.orig_rax, libc::SYS_write as Reg);
    assert_eq!(regs.rax, 5);

    let regs = registers(&mut replies);
    assert_eq!(regs.orig_rax, libc::SYS_mmap as Reg);
    assert_eq!(regs.rax % 4096, 0);
    assert!((regs.rax as i64) > 0);

    // The experiment killed and reaped the child.
    assert_eq!(
        waitpid(pid, None),
        Err(nix::errno::Errno::ECHILD)
    );
}

#[test]
fn queued_signal_interrupts_injected_syscall() {
    init_tracing();

    let pid = spawn_stopped();
    let mut task = PtraceTask::new(pid, pid).unwrap();

    // Parks at the entry of the write.
    task.cont_sysemu().unwrap();
    assert_eq!(task.pending_sig(), None);
    let saved = task.regs().unwrap();
    assert_eq!(saved.orig_rax, libc::SYS_write as Reg);

    signal::kill(pid, Signal::SIGUSR1).unwrap();
    let ret = task
        .inject_syscall(Sysno::getpid, SyscallArgs::new(0, 0, 0, 0, 0, 0))
        .unwrap();

    assert_eq!(ret as i64, -(libc::EINTR as i64));
    assert_eq!(task.pending_sig(), Some(Signal::SIGUSR1));
    let regs = task.regs().unwrap();
    assert_eq!(regs.rip, saved.rip);
    assert_eq!(regs.orig_rax, saved.orig_rax);

    signal::kill(pid, Signal::SIGKILL).unwrap();
    let _ = waitpid(pid, None);
}
