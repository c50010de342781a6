/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

/// A single register.
pub type Reg = u64;

/// The general purpose register snapshot of a task.
pub type Regs = libc::user_regs_struct;

/// The arguments to a syscall.
pub type ArgRegs = (Reg, Reg, Reg, Reg, Reg, Reg);

/// Syscall-centric access to a register snapshot.
pub trait RegAccess {
    /// Returns the value of the instruction pointer.
    fn ip(&self) -> Reg;

    /// Mutable access to the instruction pointer.
    fn ip_mut(&mut self) -> &mut Reg;

    /// The syscall number the task entered with. Unlike `rax` this survives
    /// the syscall itself.
    fn orig_syscall(&self) -> Reg;

    /// Mutable access to the original syscall number.
    fn orig_syscall_mut(&mut self) -> &mut Reg;

    /// Returns the value of the register where the syscall return value is
    /// stored.
    fn ret(&self) -> Reg;

    /// Mutable access to the register where the syscall return value is stored.
    fn ret_mut(&mut self) -> &mut Reg;

    /// Returns the set of 6 arguments that are used by the syscall instruction.
    fn args(&self) -> ArgRegs;

    /// Sets the registers used for the syscall arguments.
    fn set_args(&mut self, args: ArgRegs);
}

impl RegAccess for libc::user_regs_struct {
    fn ip(&self) -> Reg {
        self.rip
    }

    fn ip_mut(&mut self) -> &mut Reg {
        &mut self.rip
    }

    fn orig_syscall(&self) -> Reg {
        self.orig_rax
    }

    fn orig_syscall_mut(&mut self) -> &mut Reg {
        &mut self.orig_rax
    }

    fn ret(&self) -> Reg {
        self.rax
    }

    fn ret_mut(&mut self) -> &mut Reg {
        &mut self.rax
    }

    fn args(&self) -> ArgRegs {
        (self.rdi, self.rsi, self.rdx, self.r10, self.r8, self.r9)
    }

    fn set_args(&mut self, args: ArgRegs) {
        self.rdi = args.0;
        self.rsi = args.1;
        self.rdx = args.2;
        self.r10 = args.3;
        self.r8 = args.4;
        self.r9 = args.5;
    }
}

/// An all-zero register snapshot.
pub fn zeroed() -> Regs {
    // SAFETY: `user_regs_struct` is plain integers.
    unsafe { core::mem::MaybeUninit::<Regs>::zeroed().assume_init() }
}
