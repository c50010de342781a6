/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use serde::Deserialize;
use serde::Serialize;
use syscalls::Sysno;

/// Largest siginfo or memory buffer handed back to the debugger. Don't trust
/// client-supplied lengths blindly.
pub const MAX_REPLY_LEN: usize = 0x8000;

/// Experiment settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Syscalls executed for real in addition to the built-in memory-mapping
    /// set.
    pub forward_syscalls: Vec<Sysno>,

    /// Upper bound on the zero-filled siginfo returned to the debugger.
    pub max_siginfo_len: usize,

    /// Size of the buffer used to copy stdio writes out of the tracee.
    pub io_chunk_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            forward_syscalls: Vec::new(),
            max_siginfo_len: MAX_REPLY_LEN,
            io_chunk_size: 0x8000,
        }
    }
}
