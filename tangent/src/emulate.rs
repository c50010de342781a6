/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! What happens to a syscall made inside an experiment.
//!
//! Each intercepted syscall is looked up in a [`SyscallTable`]. A syscall can
//! be emulated (finished with a result made up by the tracer), executed for
//! real through an injected syscall, or left alone. Syscalls that are left
//! alone are skipped by `PTRACE_SYSEMU`, so the tracee sees the `-ENOSYS` the
//! kernel put in the return register.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::io::Write;
use std::os::unix::io::RawFd;

use perf_event_open_sys::bindings as perf;
use syscalls::SyscallArgs;
use syscalls::Sysno;

use crate::config::Config;
use crate::regs::Reg;
use crate::regs::RegAccess;
use crate::regs::Regs;
use crate::remote::execute_syscall;
use crate::Error;
use crate::Task;

/// A syscall captured at its entry stop.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct SyscallEvent {
    pub nr: Sysno,
    pub args: SyscallArgs,
}

impl SyscallEvent {
    pub fn new(nr: Sysno, regs: &Regs) -> Self {
        let (a0, a1, a2, a3, a4, a5) = regs.args();
        SyscallEvent {
            nr,
            args: SyscallArgs::new(
                a0 as usize,
                a1 as usize,
                a2 as usize,
                a3 as usize,
                a4 as usize,
                a5 as usize,
            ),
        }
    }
}

/// The tracer's own stdout and stderr, which the tracee's stdio writes are
/// copied to.
pub struct HostIo {
    stdout: Box<dyn Write + Send>,
    stderr: Box<dyn Write + Send>,
    chunk_size: usize,
}

impl HostIo {
    pub fn new(chunk_size: usize) -> Self {
        Self::with_writers(io::stdout(), io::stderr(), chunk_size)
    }

    pub fn with_writers<O, E>(stdout: O, stderr: E, chunk_size: usize) -> Self
    where
        O: Write + Send + 'static,
        E: Write + Send + 'static,
    {
        HostIo {
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            chunk_size: chunk_size.max(1),
        }
    }

    fn write(&mut self, fd: RawFd, bytes: &[u8]) -> io::Result<()> {
        let out = match fd {
            libc::STDOUT_FILENO => &mut self.stdout,
            _ => &mut self.stderr,
        };
        out.write_all(bytes)?;
        out.flush()
    }
}

impl Default for HostIo {
    fn default() -> Self {
        Self::new(Config::default().io_chunk_size)
    }
}

/// Makes up the result of a syscall. Returns `None` when this particular call
/// is not one the emulator deals with, in which case the syscall is left
/// unhandled.
pub type Emulator<T> = fn(&mut T, &SyscallEvent, &mut HostIo) -> Result<Option<i64>, Error>;

/// How a syscall is treated inside an experiment.
pub enum Policy<T> {
    /// Finish the syscall with a synthesized result.
    Emulate(Emulator<T>),
    /// Run the syscall for real and hand the kernel's result to the tracee.
    Execute,
}

impl<T> Clone for Policy<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Policy<T> {}

impl<T> fmt::Debug for Policy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Policy::Emulate(_) => f.write_str("Emulate"),
            Policy::Execute => f.write_str("Execute"),
        }
    }
}

/// What was done with a syscall.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Disposition {
    Emulated(i64),
    Executed(i64),
    Ignored,
}

/// Syscalls that need their real side effects for the experiment to behave
/// plausibly.
const EXECUTED_FOR_REAL: &[Sysno] = &[
    Sysno::mmap,
    Sysno::munmap,
    Sysno::mprotect,
    Sysno::mremap,
    Sysno::brk,
];

/// Maps syscall numbers to their [`Policy`].
pub struct SyscallTable<T> {
    policies: HashMap<Sysno, Policy<T>>,
    io: HostIo,
}

impl<T: Task> SyscallTable<T> {
    pub fn new(config: &Config) -> Self {
        let mut policies = HashMap::new();
        policies.insert(Sysno::ioctl, Policy::Emulate(emulate_desched_ioctl::<T>));
        policies.insert(Sysno::write, Policy::Emulate(emulate_stdio_write::<T>));
        for nr in EXECUTED_FOR_REAL.iter().chain(&config.forward_syscalls) {
            policies.insert(*nr, Policy::Execute);
        }
        SyscallTable {
            policies,
            io: HostIo::new(config.io_chunk_size),
        }
    }

    pub fn with_host_io(mut self, io: HostIo) -> Self {
        self.io = io;
        self
    }

    /// Adds or replaces the policy of `nr`.
    pub fn insert(&mut self, nr: Sysno, policy: Policy<T>) -> Option<Policy<T>> {
        self.policies.insert(nr, policy)
    }

    pub fn policy(&self, nr: Sysno) -> Option<Policy<T>> {
        self.policies.get(&nr).copied()
    }

    /// Handles the syscall `task` is parked on at its entry stop.
    pub fn dispatch(&mut self, task: &mut T, syscallno: Reg) -> Result<Disposition, Error> {
        let nr = match Sysno::new(syscallno as usize) {
            Some(nr) => nr,
            None => {
                tracing::warn!(
                    "Unknown syscall #{} not handled during experimental session",
                    syscallno as i64
                );
                return Ok(Disposition::Ignored);
            }
        };
        tracing::debug!("Processing {}", nr);

        match self.policy(nr) {
            Some(Policy::Emulate(emulate)) => {
                let event = SyscallEvent::new(nr, &task.regs()?);
                if let Some(ret) = emulate(task, &event, &mut self.io)? {
                    finish_emulated_syscall_with_ret(task, ret)?;
                    return Ok(Disposition::Emulated(ret));
                }
            }
            Some(Policy::Execute) => return execute_syscall(task).map(Disposition::Executed),
            None => {}
        }

        // The tracee entered with SYSEMU, so skipping the syscall leaves the
        // kernel's -ENOSYS as its result.
        tracing::warn!("Syscall `{}` not handled during experimental session", nr);
        Ok(Disposition::Ignored)
    }
}

/// Sets the syscall return value and finishes the intercepted syscall.
pub fn finish_emulated_syscall_with_ret<T: Task>(task: &mut T, ret: i64) -> Result<(), Error> {
    let mut regs = task.regs()?;
    *regs.ret_mut() = ret as Reg;
    task.set_regs(regs)?;
    task.finish_emulated_syscall()
}

/// The ioctl that arms or disarms the desched notification of the preload
/// library running in the tracee.
pub fn is_desched_event_syscall<T: Task>(task: &T, event: &SyscallEvent) -> bool {
    let request = event.args.arg1 as u64;
    event.nr == Sysno::ioctl
        && task.desched_fd() == Some(event.args.arg0 as RawFd)
        && (request == perf::ENABLE as u64
            || request == perf::DISABLE as u64)
}

// The preload library aborts the tracee if arming fails, so this always
// succeeds without running.
fn emulate_desched_ioctl<T: Task>(
    task: &mut T,
    event: &SyscallEvent,
    _io: &mut HostIo,
) -> Result<Option<i64>, Error> {
    Ok(is_desched_event_syscall(task, event).then_some(0))
}

fn emulate_stdio_write<T: Task>(
    task: &mut T,
    event: &SyscallEvent,
    io: &mut HostIo,
) -> Result<Option<i64>, Error> {
    let fd = event.args.arg0 as RawFd;
    if fd != libc::STDOUT_FILENO && fd != libc::STDERR_FILENO {
        return Ok(None);
    }
    let addr = event.args.arg1 as Reg;
    let len = event.args.arg2;

    let mut buf = vec![0u8; len.min(io.chunk_size)];
    let mut nread = 0usize;
    while nread < len {
        let want = (len - nread).min(buf.len());
        let chunk = &mut buf[..want];
        match task.read_bytes_fallible(addr.wrapping_add(nread as Reg), chunk) {
            Ok(0) => break,
            Ok(n) => {
                if let Err(err) = io.write(fd, &chunk[..n]) {
                    tracing::warn!("Failed to copy tracee write to fd {}: {}", fd, err);
                }
                nread += n;
                if n < want {
                    break;
                }
            }
            Err(errno) if nread == 0 => return Ok(Some(-(errno.into_raw() as i64))),
            Err(_) => break,
        }
    }
    Ok(Some(nread as i64))
}
