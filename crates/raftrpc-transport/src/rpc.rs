//! The envelope handed to the consensus engine for every inbound RPC.

use std::sync::Arc;

use raftrpc_common::protocol::raft::RaftMethod;
use tokio::sync::oneshot;

use crate::types::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RequestPreVoteRequest, RequestPreVoteResponse, RequestVoteRequest, RequestVoteResponse,
    TimeoutNowRequest, TimeoutNowResponse,
};

/// A decoded inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    AppendEntries(AppendEntriesRequest),
    RequestVote(RequestVoteRequest),
    RequestPreVote(RequestPreVoteRequest),
    InstallSnapshot {
        request: InstallSnapshotRequest,
        data: Vec<u8>,
    },
    TimeoutNow(TimeoutNowRequest),
}

impl Command {
    /// Method the command arrives on. Pipelined append-entries report
    /// [`RaftMethod::AppendEntries`].
    pub fn method(&self) -> RaftMethod {
        match self {
            Command::AppendEntries(_) => RaftMethod::AppendEntries,
            Command::RequestVote(_) => RaftMethod::RequestVote,
            Command::RequestPreVote(_) => RaftMethod::RequestPreVote,
            Command::InstallSnapshot { .. } => RaftMethod::InstallSnapshot,
            Command::TimeoutNow(_) => RaftMethod::TimeoutNow,
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Command::AppendEntries(req) if req.is_heartbeat())
    }
}

/// The engine's answer to a [`Command`]. The variant must match the command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResponse {
    AppendEntries(AppendEntriesResponse),
    RequestVote(RequestVoteResponse),
    RequestPreVote(RequestPreVoteResponse),
    InstallSnapshot(InstallSnapshotResponse),
    TimeoutNow(TimeoutNowResponse),
}

impl CommandResponse {
    pub fn method(&self) -> RaftMethod {
        match self {
            CommandResponse::AppendEntries(_) => RaftMethod::AppendEntries,
            CommandResponse::RequestVote(_) => RaftMethod::RequestVote,
            CommandResponse::RequestPreVote(_) => RaftMethod::RequestPreVote,
            CommandResponse::InstallSnapshot(_) => RaftMethod::InstallSnapshot,
            CommandResponse::TimeoutNow(_) => RaftMethod::TimeoutNow,
        }
    }
}

/// A response, or the error message the engine attaches instead.
pub type RpcResponse = std::result::Result<CommandResponse, String>;

/// Synchronous fast path for heartbeat-shaped append-entries.
///
/// Called on the dispatcher's task; it must respond on the [`Rpc`] (or drop
/// it) without blocking for long.
pub type HeartbeatHandler = Arc<dyn Fn(Rpc) + Send + Sync>;

/// One inbound request and the slot for its response.
///
/// The dispatcher waits on the slot until [`respond`](Rpc::respond) is called
/// or the envelope is dropped. `respond` takes `self`, so an envelope is
/// answered at most once.
#[derive(Debug)]
pub struct Rpc {
    command: Command,
    responder: oneshot::Sender<RpcResponse>,
}

impl Rpc {
    pub(crate) fn new(command: Command) -> (Self, oneshot::Receiver<RpcResponse>) {
        let (responder, rx) = oneshot::channel();
        (Self { command, responder }, rx)
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    /// Fills the response slot.
    ///
    /// If the dispatcher already gave up (handshake timeout), the response is
    /// discarded.
    pub fn respond(self, response: RpcResponse) {
        let method = self.command.method();
        if self.responder.send(response).is_err() {
            tracing::debug!(method = %method, "Caller no longer waiting, response discarded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RpcHeader;

    #[tokio::test]
    async fn test_respond_fills_slot() {
        let (rpc, rx) = Rpc::new(Command::TimeoutNow(TimeoutNowRequest::default()));
        assert_eq!(rpc.command().method(), RaftMethod::TimeoutNow);

        rpc.respond(Ok(CommandResponse::TimeoutNow(TimeoutNowResponse::default())));
        assert!(matches!(rx.await.unwrap(), Ok(CommandResponse::TimeoutNow(_))));
    }

    #[tokio::test]
    async fn test_dropped_envelope_closes_slot() {
        let (rpc, rx) = Rpc::new(Command::RequestVote(RequestVoteRequest::default()));
        drop(rpc);
        assert!(rx.await.is_err());
    }

    #[test]
    fn test_respond_after_caller_left() {
        let (rpc, rx) = Rpc::new(Command::RequestVote(RequestVoteRequest::default()));
        drop(rx);
        rpc.respond(Err("too late".to_string()));
    }

    #[test]
    fn test_command_heartbeat() {
        let beat = AppendEntriesRequest {
            header: RpcHeader {
                addr: "10.0.0.1:7000".into(),
                ..Default::default()
            },
            term: 2,
            ..Default::default()
        };
        assert!(Command::AppendEntries(beat).is_heartbeat());
        assert!(!Command::TimeoutNow(TimeoutNowRequest::default()).is_heartbeat());
    }
}
