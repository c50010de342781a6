/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Experiments on live threads, driven with ptrace.
//!
//! Threads must already be attached and sitting in a ptrace-stop when they
//! are handed to [`PtraceTask::new`].

#![cfg(all(target_os = "linux", target_arch = "x86_64"))]

mod group;
mod task;

pub use group::TaskGroup;
pub use task::PtraceTask;
