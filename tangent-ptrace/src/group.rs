/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::collections::BTreeMap;

use nix::errno::Errno;
use nix::sys::signal;
use nix::sys::signal::Signal;
use nix::sys::wait::waitpid;
use nix::sys::wait::WaitPidFlag;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use tangent::ExperimentSession;
use tangent::Task;

use crate::PtraceTask;

/// The ptraced threads an experiment runs in. The threads are killed when
/// the experiment ends.
#[derive(Debug, Default)]
pub struct TaskGroup {
    tasks: BTreeMap<Pid, PtraceTask>,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, task: PtraceTask) -> Option<PtraceTask> {
        self.tasks.insert(task.tid(), task)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl FromIterator<PtraceTask> for TaskGroup {
    fn from_iter<I: IntoIterator<Item = PtraceTask>>(iter: I) -> Self {
        TaskGroup {
            tasks: iter.into_iter().map(|task| (task.tid(), task)).collect(),
        }
    }
}

impl ExperimentSession for TaskGroup {
    type Task = PtraceTask;

    fn find_task(&self, tid: Pid) -> Option<&PtraceTask> {
        self.tasks.get(&tid)
    }

    fn find_task_mut(&mut self, tid: Pid) -> Option<&mut PtraceTask> {
        self.tasks.get_mut(&tid)
    }

    fn task_ids(&self) -> Vec<Pid> {
        self.tasks.keys().copied().collect()
    }

    fn kill_all_tasks(&mut self) {
        for tid in std::mem::take(&mut self.tasks).into_keys() {
            tracing::debug!("Killing experiment task {}", tid);
            if let Err(err) = signal::kill(tid, Signal::SIGKILL) {
                tracing::warn!("Failed to kill {}: {}", tid, err);
                continue;
            }
            reap(tid);
        }
    }
}

/// Waits until `tid` is gone. A SIGKILLed tracee may still report a stop or
/// two on its way out.
fn reap(tid: Pid) {
    loop {
        match waitpid(tid, Some(WaitPidFlag::__WALL)) {
            Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) | Err(Errno::ECHILD) => {
                return;
            }
            Ok(_) | Err(Errno::EINTR) => {}
            Err(err) => {
                tracing::warn!("Failed to reap {}: {}", tid, err);
                return;
            }
        }
    }
}
