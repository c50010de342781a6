/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The experiment driver.
//!
//! An experiment branches a disposable session off a replay and lets the
//! debugger run it like a live process. Syscalls the tracee makes along the
//! way are emulated, executed or ignored according to a [`SyscallTable`].

use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::advance::advance;
use crate::advance::Advance;
use crate::config::Config;
use crate::debugger::process_debugger_requests;
use crate::emulate::HostIo;
use crate::emulate::SyscallTable;
use crate::session::Experiment;
use crate::BreakpointKind;
use crate::DebugRequest;
use crate::DebuggerChannel;
use crate::Error;
use crate::ExperimentSession;
use crate::ReplaySession;
use crate::Task;

/// Runs experiments with a fixed configuration and syscall table.
pub struct Experimenter<T> {
    config: Config,
    syscalls: SyscallTable<T>,
}

impl<T: Task> Experimenter<T> {
    pub fn new(config: Config) -> Self {
        Experimenter {
            syscalls: SyscallTable::new(&config),
            config,
        }
    }

    /// Sends the tracee's stdio writes somewhere other than our own stdio.
    pub fn with_host_io(mut self, io: HostIo) -> Self {
        self.syscalls = self.syscalls.with_host_io(io);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// For installing extra syscall policies.
    pub fn syscalls_mut(&mut self) -> &mut SyscallTable<T> {
        &mut self.syscalls
    }

    /// Branches an experiment off `replay` and lets `dbg` drive it, starting
    /// with `target` as the current thread.
    ///
    /// Returns once the client resumes a dying experiment or restarts. `req`
    /// holds the request that ended the experiment. Every task of the
    /// experiment is killed before this returns, whether or not it fails.
    pub fn run<R, D>(
        &mut self,
        replay: &R,
        dbg: &mut D,
        target: Pid,
        req: &mut DebugRequest,
    ) -> Result<(), Error>
    where
        R: ReplaySession,
        R::Experiment: ExperimentSession<Task = T>,
        D: DebuggerChannel,
    {
        tracing::debug!("Starting experimental session at tid {}", target);

        let mut exp = Experiment::start(replay)?;
        if exp.session().find_task(target).is_none() {
            return Err(Error::UnknownTask(target));
        }

        let mut target = target;
        while let Some(tid) = process_debugger_requests(&mut exp, dbg, target, req, &self.config)? {
            target = tid;
            let task = exp
                .session_mut()
                .find_task_mut(tid)
                .ok_or(Error::UnknownTask(tid))?;

            if let Advance::Interrupted(sig) = advance(task, req, &mut self.syscalls)? {
                let thread = task.thread_id();
                task.take_pending_sig();
                let sig = reported_signal(task, sig)?;
                tracing::debug!("Experiment stopped {} with {}", thread, sig);
                dbg.notify_stop(thread, sig)?;
            }
        }

        tracing::debug!("Ending experimental session at tid {}", target);
        Ok(())
    }
}

/// Runs one experiment with a default syscall table.
pub fn experiment<R, D>(
    replay: &R,
    dbg: &mut D,
    target: Pid,
    req: &mut DebugRequest,
    config: Config,
) -> Result<(), Error>
where
    R: ReplaySession,
    D: DebuggerChannel,
{
    Experimenter::<<R::Experiment as ExperimentSession>::Task>::new(config).run(
        replay, dbg, target, req,
    )
}

/// The signal shown to the debugger. A stop at one of the client's
/// breakpoints always looks like a breakpoint hit.
fn reported_signal<T: Task>(task: &T, sig: Signal) -> Result<Signal, Error> {
    if sig != Signal::SIGTRAP && task.breakpoint_at(task.ip()?) == Some(BreakpointKind::User) {
        return Ok(Signal::SIGTRAP);
    }
    Ok(sig)
}
