/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Experiment sessions and their lifecycle.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use nix::unistd::Pid;

use crate::Error;
use crate::Task;

/// A replay session that can be branched into an experiment.
pub trait ReplaySession {
    type Experiment: ExperimentSession;

    /// Clones the full process/thread state into a new mutable session.
    fn clone_experiment(&self) -> Result<Self::Experiment, Error>;
}

/// The mutable copy of a replay that an experiment runs in.
pub trait ExperimentSession {
    type Task: Task;

    fn find_task(&self, tid: Pid) -> Option<&Self::Task>;

    fn find_task_mut(&mut self, tid: Pid) -> Option<&mut Self::Task>;

    /// Ids of all member tasks.
    fn task_ids(&self) -> Vec<Pid>;

    /// Forcibly terminates every member task.
    fn kill_all_tasks(&mut self);
}

/// Whether the experiment may still be resumed.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Lifecycle {
    #[default]
    Live,
    /// Terminate at the next resume request.
    Dying,
}

impl Lifecycle {
    pub fn is_dying(self) -> bool {
        self == Lifecycle::Dying
    }
}

static EXPERIMENT_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Proof that the caller holds the one experiment slot of this process.
#[derive(Debug)]
struct Slot(());

impl Slot {
    fn claim() -> Result<Self, Error> {
        EXPERIMENT_ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| Slot(()))
            .map_err(|_| Error::ExperimentActive)
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        EXPERIMENT_ACTIVE.store(false, Ordering::Release);
    }
}

/// An experiment session owned by the driver.
///
/// Dropping it kills every task of the session and frees the process-wide
/// slot, so a new experiment can start.
pub struct Experiment<S: ExperimentSession> {
    session: S,
    lifecycle: Lifecycle,
    // Must drop after `session` has been torn down.
    _slot: Slot,
}

impl<S: ExperimentSession> Experiment<S> {
    /// Claims the experiment slot and branches `replay` into a new session.
    pub fn start<R>(replay: &R) -> Result<Self, Error>
    where
        R: ReplaySession<Experiment = S>,
    {
        let slot = Slot::claim()?;
        let session = replay.clone_experiment()?;
        Ok(Experiment {
            session,
            lifecycle: Lifecycle::Live,
            _slot: slot,
        })
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn is_dying(&self) -> bool {
        self.lifecycle.is_dying()
    }

    /// Cancels a previous `start_dying`.
    pub fn revive(&mut self) {
        self.lifecycle = Lifecycle::Live;
    }

    pub fn start_dying(&mut self) {
        tracing::debug!("Experimental session dying at next continue request ...");
        self.lifecycle = Lifecycle::Dying;
    }
}

/// Whether an experiment is live anywhere in this process.
pub fn experiment_active() -> bool {
    EXPERIMENT_ACTIVE.load(Ordering::Acquire)
}

impl<S: ExperimentSession> Drop for Experiment<S> {
    fn drop(&mut self) {
        self.session.kill_all_tasks();
    }
}
