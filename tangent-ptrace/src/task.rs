/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::collections::HashMap;
use std::os::unix::io::RawFd;

use nix::errno::Errno as NixErrno;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::waitpid;
use nix::sys::wait::WaitPidFlag;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use syscalls::Errno;
use syscalls::SyscallArgs;
use syscalls::Sysno;
use tangent::regs::Reg;
use tangent::regs::RegAccess;
use tangent::regs::Regs;
use tangent::BreakpointKind;
use tangent::Error;
use tangent::Task;

const INT3: u8 = 0xcc;

/// `syscall` is `0f 05`, little endian.
const SYSCALL_INSN: u16 = 0x050f;

const WORD: Reg = core::mem::size_of::<libc::c_long>() as Reg;

#[derive(Clone, Copy, Debug)]
struct Breakpoint {
    kind: BreakpointKind,
    saved: u8,
}

/// How a resume ended, as reported by `waitpid`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Stop {
    Syscall,
    Signal(Signal),
}

/// A ptraced thread, resumed with `PTRACE_SYSEMU`.
#[derive(Debug)]
pub struct PtraceTask {
    tid: Pid,
    tgid: Pid,
    rec_tid: Option<Pid>,
    pending: Option<Signal>,
    breakpoints: HashMap<Reg, Breakpoint>,
    desched_fd: Option<RawFd>,
}

impl PtraceTask {
    /// Takes over `tid`, which must be in a ptrace-stop.
    pub fn new(tid: Pid, tgid: Pid) -> Result<Self, Error> {
        let task = PtraceTask {
            tid,
            tgid,
            rec_tid: None,
            pending: None,
            breakpoints: HashMap::new(),
            desched_fd: None,
        };
        ptrace::setoptions(tid, ptrace::Options::PTRACE_O_TRACESYSGOOD)
            .map_err(|err| task.map_err(err))?;
        Ok(task)
    }

    pub fn with_rec_tid(mut self, rec_tid: Pid) -> Self {
        self.rec_tid = Some(rec_tid);
        self
    }

    pub fn with_desched_fd(mut self, fd: RawFd) -> Self {
        self.desched_fd = Some(fd);
        self
    }

    fn map_err(&self, err: NixErrno) -> Error {
        if err == NixErrno::ESRCH {
            Error::TaskExited(self.tid)
        } else {
            Error::from(err)
        }
    }

    fn wait_stop(&self) -> Result<Stop, Error> {
        loop {
            match waitpid(self.tid, Some(WaitPidFlag::__WALL)) {
                Ok(WaitStatus::PtraceSyscall(_)) => return Ok(Stop::Syscall),
                Ok(WaitStatus::Stopped(_, sig)) | Ok(WaitStatus::PtraceEvent(_, sig, _)) => {
                    return Ok(Stop::Signal(sig));
                }
                Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => {
                    return Err(Error::TaskExited(self.tid));
                }
                Ok(status) => {
                    tracing::trace!("(tid {}) ignoring wait status {:?}", self.tid, status);
                }
                Err(NixErrno::EINTR) => {}
                Err(err) => return Err(self.map_err(err)),
            }
        }
    }

    fn sysemu(&self, step: bool) -> Result<Stop, Error> {
        let resumed = if step {
            ptrace::sysemu_step(self.tid, None)
        } else {
            ptrace::sysemu(self.tid, None)
        };
        resumed.map_err(|err| self.map_err(err))?;
        self.wait_stop()
    }

    fn resume(&mut self, step: bool) -> Result<(), Error> {
        assert!(self.pending.is_none());

        let ip = self.ip()?;
        let stop = match self.breakpoints.get(&ip).copied() {
            Some(bp) => {
                // Step over the breakpoint with the original byte in place.
                self.poke_byte(ip, bp.saved)?;
                let stop = self.sysemu(true);
                self.poke_byte(ip, INT3)?;
                match stop? {
                    Stop::Signal(Signal::SIGTRAP) if !step => self.sysemu(false)?,
                    stop => stop,
                }
            }
            None => self.sysemu(step)?,
        };

        self.pending = match stop {
            Stop::Syscall => None,
            Stop::Signal(sig) => Some(sig),
        };
        if self.pending == Some(Signal::SIGTRAP) {
            self.rewind_breakpoint_hit()?;
        }
        Ok(())
    }

    /// An `int3` leaves the ip just past the breakpoint. Put it back on the
    /// breakpoint address.
    fn rewind_breakpoint_hit(&mut self) -> Result<(), Error> {
        let mut regs = self.regs()?;
        let addr = regs.ip().wrapping_sub(1);
        if !self.breakpoints.contains_key(&addr) {
            return Ok(());
        }
        let siginfo = ptrace::getsiginfo(self.tid).map_err(|err| self.map_err(err))?;
        if siginfo.si_code == libc::SI_KERNEL {
            *regs.ip_mut() = addr;
            self.set_regs(regs)?;
        }
        Ok(())
    }

    fn peek(&self, addr: Reg) -> Result<u64, Error> {
        ptrace::read(self.tid, addr as ptrace::AddressType)
            .map(|word| word as u64)
            .map_err(|err| self.map_err(err))
    }

    fn poke(&self, addr: Reg, word: u64) -> Result<(), Error> {
        ptrace::write(self.tid, addr as ptrace::AddressType, word as libc::c_long)
            .map_err(|err| self.map_err(err))
    }

    fn poke_byte(&self, addr: Reg, byte: u8) -> Result<(), Error> {
        self.write_words(addr, &[byte])
    }

    /// Read-modify-write of whole words. Unlike `process_vm_writev` this works
    /// on read-only mappings such as program text.
    fn write_words(&self, addr: Reg, buf: &[u8]) -> Result<(), Error> {
        let mut done = 0;
        while done < buf.len() {
            let at = addr + done as Reg;
            let aligned = at & !(WORD - 1);
            let offset = (at - aligned) as usize;
            let n = (WORD as usize - offset).min(buf.len() - done);

            let mut bytes = self.peek(aligned)?.to_ne_bytes();
            bytes[offset..offset + n].copy_from_slice(&buf[done..done + n]);
            self.poke(aligned, u64::from_ne_bytes(bytes))?;
            done += n;
        }
        Ok(())
    }
}

impl Task for PtraceTask {
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
        ptrace::getregs(self.tid).map_err(|err| self.map_err(err))
    }

    fn set_regs(&mut self, regs: Regs) -> Result<(), Error> {
        ptrace::setregs(self.tid, regs).map_err(|err| self.map_err(err))
    }

    fn finish_emulated_syscall(&mut self) -> Result<(), Error> {
        // Single-step out of the syscall-entry stop. The kernel skips the
        // syscall and traps at the next instruction, which an int3 catches in
        // case the step doesn't.
        let regs = self.regs()?;
        let ip = regs.ip();
        let mut saved = [0u8; 1];
        self.read_bytes_fallible(ip, &mut saved)?;
        self.poke_byte(ip, INT3)?;

        let stop = self.sysemu(true);
        self.poke_byte(ip, saved[0])?;
        match stop? {
            Stop::Signal(Signal::SIGTRAP) | Stop::Syscall => {}
            Stop::Signal(sig) => {
                tracing::debug!(
                    "(tid {}) {} while finishing emulated syscall",
                    self.tid,
                    sig
                );
                self.pending = Some(sig);
            }
        }
        self.set_regs(regs)
    }

    fn cont_sysemu(&mut self) -> Result<(), Error> {
        self.resume(false)
    }

    fn cont_sysemu_singlestep(&mut self) -> Result<(), Error> {
        self.resume(true)
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
        let local = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let remote = libc::iovec {
            iov_base: addr as *mut libc::c_void,
            iov_len: buf.len(),
        };
        // Stops at the first unmapped page, so a partial read is normal.
        Errno::result(unsafe { libc::process_vm_readv(self.tid.as_raw(), &local, 1, &remote, 1, 0) })
            .map(|n| n as usize)
    }

    fn write_bytes(&mut self, addr: Reg, buf: &[u8]) -> Result<(), Error> {
        self.write_words(addr, buf)
    }

    fn breakpoint_at(&self, addr: Reg) -> Option<BreakpointKind> {
        self.breakpoints.get(&addr).map(|bp| bp.kind)
    }

    fn set_breakpoint(&mut self, addr: Reg, kind: BreakpointKind) -> Result<(), Error> {
        if let Some(bp) = self.breakpoints.get_mut(&addr) {
            bp.kind = kind;
            return Ok(());
        }
        let mut saved = [0u8; 1];
        self.read_bytes_fallible(addr, &mut saved)?;
        self.poke_byte(addr, INT3)?;
        self.breakpoints.insert(
            addr,
            Breakpoint {
                kind,
                saved: saved[0],
            },
        );
        Ok(())
    }

    fn remove_breakpoint(&mut self, addr: Reg) -> Result<(), Error> {
        match self.breakpoints.remove(&addr) {
            Some(bp) => self.poke_byte(addr, bp.saved),
            None => Ok(()),
        }
    }

    fn desched_fd(&self) -> Option<RawFd> {
        self.desched_fd
    }

    fn inject_syscall(&mut self, nr: Sysno, args: SyscallArgs) -> Result<Reg, Error> {
        let saved = self.regs()?;

        // Reuse the syscall instruction the task last stopped after.
        let insn_addr = saved.ip().wrapping_sub(2);
        let mut insn = [0u8; 2];
        self.read_bytes_fallible(insn_addr, &mut insn)?;
        if u16::from_le_bytes(insn) != SYSCALL_INSN {
            tracing::warn!(
                "(tid {}) no syscall instruction at {:#x} to inject {}",
                self.tid,
                insn_addr,
                nr
            );
            return Err(Errno::EINVAL.into());
        }

        let mut regs = saved;
        *regs.ip_mut() = insn_addr;
        *regs.orig_syscall_mut() = nr.id() as Reg;
        *regs.ret_mut() = nr.id() as Reg;
        regs.set_args((
            args.arg0 as Reg,
            args.arg1 as Reg,
            args.arg2 as Reg,
            args.arg3 as Reg,
            args.arg4 as Reg,
            args.arg5 as Reg,
        ));
        self.set_regs(regs)?;

        // Entry, then exit.
        for _ in 0..2 {
            ptrace::syscall(self.tid, None).map_err(|err| self.map_err(err))?;
            match self.wait_stop()? {
                Stop::Syscall => {}
                Stop::Signal(sig) => {
                    tracing::debug!(
                        "(tid {}) {} interrupted injected {}",
                        self.tid,
                        sig,
                        nr
                    );
                    // Left pending for the caller to report.
                    self.pending = Some(sig);
                    self.set_regs(saved)?;
                    return Ok(Errno::EINTR.into_raw().wrapping_neg() as Reg);
                }
            }
        }

        let ret = self.regs()?.ret();
        self.set_regs(saved)?;
        Ok(ret)
    }
}
