/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Disposable experimental branches off a deterministic replay.
//!
//! While replaying, a debugger client may want to do things the recording
//! never did: call a function, poke memory, run past the end of the trace. An
//! experiment clones the replay session into a throwaway copy and lets the
//! client drive the copy with `PTRACE_SYSEMU`, interposing on every syscall it
//! makes. See [`experiment()`].

// PTRACE_SYSEMU only exists on x86.
#![cfg(all(target_os = "linux", target_arch = "x86_64"))]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod advance;
mod channel;
pub mod config;
pub mod debugger;
pub mod dispatch;
pub mod emulate;
mod error;
pub mod experiment;
pub mod regs;
pub mod remote;
mod request;
mod session;
mod task;
pub mod testing;

pub use channel::*;
pub use config::Config;
pub use error::*;
pub use experiment::experiment;
pub use experiment::Experimenter;
pub use request::*;
pub use session::*;
pub use task::*;
