/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The connection to the debugger client.

use nix::sys::signal::Signal;
use tokio::sync::mpsc;

use crate::DebugReply;
use crate::DebugRequest;
use crate::Error;
use crate::ThreadId;

/// Where debugger requests come from and where replies go.
///
/// The experiment runs on the ptracer thread, so every method blocks.
pub trait DebuggerChannel {
    /// Blocks until the client sends the next request.
    fn get_request(&mut self) -> Result<DebugRequest, Error>;

    fn reply_read_siginfo(&mut self, siginfo: &[u8]) -> Result<(), Error> {
        self.reply(DebugReply::Siginfo(siginfo.to_vec()))
    }

    fn reply_write_siginfo(&mut self) -> Result<(), Error> {
        self.reply(DebugReply::SiginfoWritten)
    }

    /// Tells the client that `thread` stopped after its last resume.
    fn notify_stop(&mut self, thread: ThreadId, sig: Signal) -> Result<(), Error> {
        self.reply(DebugReply::Stopped {
            thread,
            signal: sig as i32,
        })
    }

    fn reply(&mut self, reply: DebugReply) -> Result<(), Error>;
}

/// A [`DebuggerChannel`] fed by an async front end (e.g. a gdb remote
/// protocol server) over tokio channels.
pub struct RemoteDebugger {
    request_rx: mpsc::Receiver<DebugRequest>,
    reply_tx: mpsc::Sender<DebugReply>,
}

/// The front end's half of a [`RemoteDebugger`].
pub struct DebuggerClient {
    pub requests: mpsc::Sender<DebugRequest>,
    pub replies: mpsc::Receiver<DebugReply>,
}

impl RemoteDebugger {
    pub fn new(
        request_rx: mpsc::Receiver<DebugRequest>,
        reply_tx: mpsc::Sender<DebugReply>,
    ) -> Self {
        RemoteDebugger {
            request_rx,
            reply_tx,
        }
    }

    /// Creates a connected debugger/client pair. `buffer` bounds the number of
    /// in-flight requests and replies in each direction.
    pub fn channel(buffer: usize) -> (Self, DebuggerClient) {
        let (request_tx, request_rx) = mpsc::channel(buffer);
        let (reply_tx, reply_rx) = mpsc::channel(buffer);
        (
            RemoteDebugger::new(request_rx, reply_tx),
            DebuggerClient {
                requests: request_tx,
                replies: reply_rx,
            },
        )
    }
}

impl DebuggerChannel for RemoteDebugger {
    fn get_request(&mut self) -> Result<DebugRequest, Error> {
        let request = self.request_rx.blocking_recv().ok_or(Error::Disconnected)?;
        tracing::trace!("debugger request: {:?}", request);
        Ok(request)
    }

    fn reply(&mut self, reply: DebugReply) -> Result<(), Error> {
        tracing::trace!("debugger reply: {:?}", reply);
        self.reply_tx
            .blocking_send(reply)
            .map_err(|_| Error::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use nix::unistd::Pid;

    use super::*;

    #[test]
    fn requests_then_disconnect() {
        let (mut dbg, client) = RemoteDebugger::channel(4);
        let DebuggerClient { requests, mut replies } = client;

        requests.blocking_send(DebugRequest::WriteSiginfo).unwrap();
        drop(requests);

        assert_eq!(dbg.get_request().unwrap(), DebugRequest::WriteSiginfo);
        assert!(matches!(dbg.get_request(), Err(Error::Disconnected)));

        let thread = ThreadId::new(Pid::from_raw(3), Pid::from_raw(4));
        dbg.notify_stop(thread, Signal::SIGSEGV).unwrap();
        dbg.reply_read_siginfo(&[0; 4]).unwrap();
        assert_eq!(
            replies.blocking_recv(),
            Some(DebugReply::Stopped {
                thread,
                signal: libc::SIGSEGV
            })
        );
        assert_eq!(
            replies.blocking_recv(),
            Some(DebugReply::Siginfo(vec![0; 4]))
        );
    }

    #[test]
    fn reply_without_client_fails() {
        let (mut dbg, client) = RemoteDebugger::channel(1);
        drop(client);
        assert!(matches!(
            dbg.reply_write_siginfo(),
            Err(Error::Disconnected)
        ));
    }
}
