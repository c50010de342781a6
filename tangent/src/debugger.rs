/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Handling debugger requests between two resumes of the experiment.
//!
//! What a request does to the loop is decided by [`transition`], which never
//! touches the channel or the tracee. [`process_debugger_requests`] carries
//! out the decisions.

use nix::unistd::Pid;

use crate::config::Config;
use crate::dispatch::dispatch_debugger_request;
use crate::session::Experiment;
use crate::session::Lifecycle;
use crate::DebugRequest;
use crate::DebuggerChannel;
use crate::Error;
use crate::ExperimentSession;

/// Where the request loop is.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum State {
    /// Waiting for the first request.
    Listening,
    /// A request was answered, waiting for the next one.
    RepliedAndLooping,
    /// The client asked to resume this task.
    ReturningTarget(Pid),
    /// The experiment is over.
    ReturningNone,
}

impl State {
    /// The loop is done and has an answer for the driver.
    pub fn is_final(self) -> bool {
        matches!(self, State::ReturningTarget(_) | State::ReturningNone)
    }
}

/// Side effect on the debugger channel required by a transition.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Action {
    Nothing,
    /// Reply with this many zero bytes of siginfo.
    ReplyReadSiginfo(usize),
    ReplyWriteSiginfo,
    /// Hand the request to the generic dispatcher.
    Dispatch,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Transition {
    pub next: State,
    pub lifecycle: Lifecycle,
    pub target: Pid,
    pub action: Action,
}

/// Decides what `req` does to the request loop. `has_task` tells whether the
/// session has a task with the given tid.
pub fn transition(
    req: &DebugRequest,
    lifecycle: Lifecycle,
    target: Pid,
    max_siginfo_len: usize,
    has_task: impl FnOnce(Pid) -> bool,
) -> Transition {
    let looping = |action| Transition {
        next: State::RepliedAndLooping,
        lifecycle,
        target,
        action,
    };

    match req {
        req if req.is_resume() => Transition {
            next: if lifecycle.is_dying() {
                State::ReturningNone
            } else {
                State::ReturningTarget(target)
            },
            lifecycle,
            target,
            action: Action::Nothing,
        },
        DebugRequest::Restart => Transition {
            next: State::ReturningNone,
            lifecycle,
            target,
            action: Action::Nothing,
        },
        DebugRequest::ReadSiginfo { len } => Transition {
            lifecycle: Lifecycle::Live,
            ..looping(Action::ReplyReadSiginfo((*len).min(max_siginfo_len)))
        },
        DebugRequest::WriteSiginfo => Transition {
            lifecycle: Lifecycle::Dying,
            ..looping(Action::ReplyWriteSiginfo)
        },
        DebugRequest::SetQueryThread { thread } => Transition {
            target: if has_task(thread.tid) {
                thread.tid
            } else {
                target
            },
            ..looping(Action::Dispatch)
        },
        // Generic requests.
        _ => looping(Action::Dispatch),
    }
}

/// Serves debugger requests until the client resumes or ends the experiment.
///
/// Returns the task to advance, or `None` when the experiment should end.
/// The request that ended the loop is left in `req`.
pub fn process_debugger_requests<S, D>(
    exp: &mut Experiment<S>,
    dbg: &mut D,
    target: Pid,
    req: &mut DebugRequest,
    config: &Config,
) -> Result<Option<Pid>, Error>
where
    S: ExperimentSession,
    D: DebuggerChannel,
{
    let mut target = target;
    let mut state = State::Listening;

    while !state.is_final() {
        *req = dbg.get_request()?;

        let t = transition(
            req,
            exp.lifecycle(),
            target,
            config.max_siginfo_len,
            |tid| exp.session().find_task(tid).is_some(),
        );

        if t.lifecycle != exp.lifecycle() {
            match t.lifecycle {
                Lifecycle::Live => exp.revive(),
                Lifecycle::Dying => exp.start_dying(),
            }
        }
        target = t.target;

        match t.action {
            Action::Nothing => {}
            Action::ReplyReadSiginfo(len) => dbg.reply_read_siginfo(&vec![0; len])?,
            Action::ReplyWriteSiginfo => dbg.reply_write_siginfo()?,
            Action::Dispatch => dispatch_debugger_request(exp.session_mut(), dbg, target, req)?,
        }
        state = t.next;
    }

    Ok(match state {
        State::ReturningTarget(tid) => Some(tid),
        _ => None,
    })
}
