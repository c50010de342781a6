/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Debugger requests that don't affect the experiment's control flow.

use nix::unistd::Pid;

use crate::config::MAX_REPLY_LEN;
use crate::BreakpointKind;
use crate::DebugReply;
use crate::DebugRequest;
use crate::DebuggerChannel;
use crate::Errno;
use crate::Error;
use crate::ExperimentSession;
use crate::GenericRequest;
use crate::Task;

/// Answers `req` against the session, with `target` as the current thread.
///
/// Failures of the request itself are replied to the client as errors; only
/// channel failures are returned.
pub fn dispatch_debugger_request<S, D>(
    session: &mut S,
    dbg: &mut D,
    target: Pid,
    req: &DebugRequest,
) -> Result<(), Error>
where
    S: ExperimentSession,
    D: DebuggerChannel,
{
    let result = match req {
        // The experiment already switched targets if it could.
        DebugRequest::SetQueryThread { .. } => Ok(DebugReply::Ok),
        DebugRequest::Other(GenericRequest::ThreadList) => Ok(DebugReply::Threads(
            session
                .task_ids()
                .into_iter()
                .filter_map(|tid| session.find_task(tid))
                .map(Task::thread_id)
                .collect(),
        )),
        DebugRequest::Other(req) => match session.find_task_mut(target) {
            Some(task) => handle_task_request(task, req),
            None => Err(Error::UnknownTask(target)),
        },
        req => {
            tracing::warn!("Not a generic debugger request: {:?}", req);
            Err(Errno::EINVAL.into())
        }
    };

    let reply = match result {
        Ok(reply) => reply,
        Err(err) => DebugReply::Error(err.into_errno()?),
    };
    dbg.reply(reply)
}

fn handle_task_request<T: Task>(task: &mut T, req: &GenericRequest) -> Result<DebugReply, Error> {
    Ok(match req {
        GenericRequest::ReadRegisters => DebugReply::Registers(task.regs()?),
        GenericRequest::WriteRegisters(regs) => {
            task.set_regs(*regs)?;
            DebugReply::Ok
        }
        GenericRequest::ReadMemory { addr, len } => {
            let mut buf = vec![0; (*len).min(MAX_REPLY_LEN)];
            let nb = task.read_bytes_fallible(*addr, &mut buf)?;
            buf.truncate(nb);
            DebugReply::Memory(buf)
        }
        GenericRequest::WriteMemory { addr, data } => {
            task.write_bytes(*addr, data)?;
            DebugReply::Ok
        }
        GenericRequest::SetBreakpoint(addr) => {
            task.set_breakpoint(*addr, BreakpointKind::User)?;
            DebugReply::Ok
        }
        GenericRequest::RemoveBreakpoint(addr) => {
            task.remove_breakpoint(*addr)?;
            DebugReply::Ok
        }
        GenericRequest::CurrentThread => DebugReply::Thread(task.thread_id()),
        GenericRequest::ThreadList => DebugReply::Threads(vec![task.thread_id()]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeSession;
    use crate::testing::FakeTask;
    use crate::RemoteDebugger;
    use crate::ThreadId;

    fn dispatch(session: &mut FakeSession, target: i32, req: DebugRequest) -> DebugReply {
        let (mut dbg, mut client) = RemoteDebugger::channel(1);
        dispatch_debugger_request(session, &mut dbg, Pid::from_raw(target), &req).unwrap();
        client.replies.blocking_recv().unwrap()
    }

    fn session() -> FakeSession {
        FakeSession::new(vec![
            FakeTask::new(Pid::from_raw(10)).with_memory(0x4000, b"\x55\x48\x89\xe5"),
            FakeTask::new(Pid::from_raw(11)).with_tgid(Pid::from_raw(10)),
        ])
    }

    #[test]
    fn memory_reads_are_truncated_to_what_is_mapped() {
        let mut session = session();
        assert_eq!(
            dispatch(
                &mut session,
                10,
                DebugRequest::Other(GenericRequest::ReadMemory {
                    addr: 0x4001,
                    len: 16
                })
            ),
            DebugReply::Memory(vec![0x48, 0x89, 0xe5])
        );
        assert_eq!(
            dispatch(
                &mut session,
                10,
                DebugRequest::Other(GenericRequest::ReadMemory { addr: 0x10, len: 1 })
            ),
            DebugReply::Error(Errno::EFAULT)
        );
    }

    #[test]
    fn breakpoints_from_the_client_are_user_breakpoints() {
        let mut session = session();
        assert_eq!(
            dispatch(
                &mut session,
                10,
                DebugRequest::Other(GenericRequest::SetBreakpoint(0x4000))
            ),
            DebugReply::Ok
        );
        let task = session.find_task(Pid::from_raw(10)).unwrap();
        assert_eq!(task.breakpoint_at(0x4000), Some(BreakpointKind::User));

        dispatch(
            &mut session,
            10,
            DebugRequest::Other(GenericRequest::RemoveBreakpoint(0x4000)),
        );
        let task = session.find_task(Pid::from_raw(10)).unwrap();
        assert_eq!(task.breakpoint_at(0x4000), None);
    }

    #[test]
    fn thread_queries() {
        let mut session = session();
        assert_eq!(
            dispatch(
                &mut session,
                11,
                DebugRequest::Other(GenericRequest::ThreadList)
            ),
            DebugReply::Threads(vec![
                ThreadId::new(Pid::from_raw(10), Pid::from_raw(10)),
                ThreadId::new(Pid::from_raw(10), Pid::from_raw(11)),
            ])
        );
        assert_eq!(
            dispatch(
                &mut session,
                11,
                DebugRequest::Other(GenericRequest::CurrentThread)
            ),
            DebugReply::Thread(ThreadId::new(Pid::from_raw(10), Pid::from_raw(11)))
        );
    }

    #[test]
    fn requests_for_missing_task_fail_with_esrch() {
        let mut session = session();
        assert_eq!(
            dispatch(
                &mut session,
                99,
                DebugRequest::Other(GenericRequest::ReadRegisters)
            ),
            DebugReply::Error(Errno::ESRCH)
        );
    }

    #[test]
    fn register_writes_are_visible() {
        let mut session = session();
        let mut regs = crate::regs::zeroed();
        regs.rip = 0x4000;
        assert_eq!(
            dispatch(
                &mut session,
                10,
                DebugRequest::Other(GenericRequest::WriteRegisters(regs))
            ),
            DebugReply::Ok
        );
        assert_eq!(
            dispatch(
                &mut session,
                10,
                DebugRequest::Other(GenericRequest::ReadRegisters)
            ),
            DebugReply::Registers(regs)
        );
    }
}
