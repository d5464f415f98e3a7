//! Server side of the Raft service.
//!
//! Every inbound call is decoded into a [`Command`], wrapped in an [`Rpc`]
//! and handed to the engine. Heartbeats go to the heartbeat handler when one
//! is set; everything else goes through the hand-off channel returned by
//! [`Transport::consumer`](crate::Transport::consumer). The call then waits
//! for the engine's response and encodes it back.

use std::sync::Arc;

use raftrpc_common::protocol::error::{RaftRpcError, Result};
use raftrpc_common::protocol::raft::{self as wire, RaftMethod};
use raftrpc_common::protocol::{Request, Response, RpcResult};
use raftrpc_common::transport::JsonCodec;

use crate::convert::install_snapshot_from_wire;
use crate::manager::ManagerInner;
use crate::rpc::{Command, CommandResponse, Rpc};
use crate::types::{
    AppendEntriesRequest, RequestPreVoteRequest, RequestVoteRequest, TimeoutNowRequest,
};

/// Inbound dispatcher. Obtained from [`Manager::service`](crate::Manager::service).
#[derive(Clone)]
pub struct RaftService {
    inner: Arc<ManagerInner>,
}

impl RaftService {
    pub(crate) fn new(inner: Arc<ManagerInner>) -> Self {
        Self { inner }
    }

    /// Handles one request frame addressed to the Raft service.
    ///
    /// Suitable as a [`TcpServer`](raftrpc_common::transport::TcpServer)
    /// handler. Pipelined append-entries arrive as ordered stream frames and
    /// are handled exactly like single ones.
    ///
    /// # Errors
    ///
    /// - [`RaftRpcError::InvalidRequest`] for an unknown method or a payload
    ///   that does not decode
    /// - Whatever [`dispatch`](Self::dispatch) fails with
    pub async fn handle(&self, request: Request) -> Result<Response> {
        let id = request.id;
        let method: RaftMethod = request.method.parse()?;
        tracing::debug!(id, method = %method, "Dispatching inbound call");

        let result = match method {
            RaftMethod::AppendEntries | RaftMethod::AppendEntriesPipeline => {
                let req: wire::AppendEntriesRequest = JsonCodec::decode_args(request.args)?;
                let command = Command::AppendEntries(AppendEntriesRequest::try_from(req)?);
                match self.dispatch(command).await? {
                    CommandResponse::AppendEntries(resp) => {
                        encode(wire::AppendEntriesResponse::from(resp))?
                    }
                    other => return Err(mismatched(method, &other)),
                }
            }
            RaftMethod::RequestVote => {
                let req: wire::RequestVoteRequest = JsonCodec::decode_args(request.args)?;
                let command = Command::RequestVote(RequestVoteRequest::from(req));
                match self.dispatch(command).await? {
                    CommandResponse::RequestVote(resp) => {
                        encode(wire::RequestVoteResponse::from(resp))?
                    }
                    other => return Err(mismatched(method, &other)),
                }
            }
            RaftMethod::RequestPreVote => {
                let req: wire::RequestPreVoteRequest = JsonCodec::decode_args(request.args)?;
                let command = Command::RequestPreVote(RequestPreVoteRequest::from(req));
                match self.dispatch(command).await? {
                    CommandResponse::RequestPreVote(resp) => {
                        encode(wire::RequestPreVoteResponse::from(resp))?
                    }
                    other => return Err(mismatched(method, &other)),
                }
            }
            RaftMethod::InstallSnapshot => {
                let req: wire::InstallSnapshotRequest = JsonCodec::decode_args(request.args)?;
                let (request, data) = install_snapshot_from_wire(req)?;
                match self.dispatch(Command::InstallSnapshot { request, data }).await? {
                    CommandResponse::InstallSnapshot(resp) => {
                        encode(wire::InstallSnapshotResponse::from(resp))?
                    }
                    other => return Err(mismatched(method, &other)),
                }
            }
            RaftMethod::TimeoutNow => {
                let req: wire::TimeoutNowRequest = JsonCodec::decode_args(request.args)?;
                let command = Command::TimeoutNow(TimeoutNowRequest::from(req));
                match self.dispatch(command).await? {
                    CommandResponse::TimeoutNow(resp) => {
                        encode(wire::TimeoutNowResponse::from(resp))?
                    }
                    other => return Err(mismatched(method, &other)),
                }
            }
        };

        Ok(Response::success(id, result))
    }

    /// Hands a decoded command to the engine and waits for its response.
    ///
    /// Heartbeat-shaped append-entries are given to the heartbeat handler,
    /// if one is set, instead of the hand-off channel. The wait is bounded by
    /// the handshake timeout when one is configured.
    ///
    /// # Errors
    ///
    /// - [`RaftRpcError::Timeout`] if the engine does not respond in time
    /// - [`RaftRpcError::Application`] if the engine responded with an error
    /// - [`RaftRpcError::Transport`] if the engine dropped the request
    /// - [`RaftRpcError::Shutdown`] if the hand-off channel's consumer is gone
    pub async fn dispatch(&self, command: Command) -> Result<CommandResponse> {
        let method = command.method();
        let heartbeat = command.is_heartbeat();
        let (rpc, rx) = Rpc::new(command);

        let handler = if heartbeat {
            self.inner.heartbeat_handler()
        } else {
            None
        };
        match handler {
            Some(handler) => {
                tracing::trace!("Heartbeat fast path");
                handler(rpc);
            }
            None => self.inner.rpc_tx.send(rpc).map_err(|_| {
                tracing::warn!(method = %method, "Hand-off channel closed, rejecting call");
                RaftRpcError::Shutdown
            })?,
        }

        let outcome = match self.inner.handshake_timeout {
            Some(limit) => tokio::time::timeout(limit, rx).await.map_err(|_| {
                tracing::debug!(method = %method, timeout = ?limit, "Engine did not respond in time");
                RaftRpcError::Timeout(limit.as_millis() as u64)
            })?,
            None => rx.await,
        };

        let response = outcome.map_err(|_| {
            RaftRpcError::Transport(format!("{} was dropped without a response", method))
        })?;
        response.map_err(RaftRpcError::Application)
    }
}

fn encode<T: serde::Serialize>(value: T) -> Result<RpcResult> {
    JsonCodec::encode_args(&value)
}

fn mismatched(method: RaftMethod, response: &CommandResponse) -> RaftRpcError {
    RaftRpcError::InvalidResponse(format!(
        "engine answered {} with a {} response",
        method,
        response.method()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::manager::Manager;
    use crate::types::{
        AppendEntriesResponse, RequestVoteResponse, RpcHeader, TimeoutNowResponse,
    };
    use crate::Transport;
    use raftrpc_common::protocol::RemoteErrorKind;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn heartbeat() -> AppendEntriesRequest {
        AppendEntriesRequest {
            header: RpcHeader {
                protocol_version: 3,
                id: "leader".into(),
                addr: "10.0.0.1:7000".into(),
            },
            term: 3,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_unknown_method_is_bad_request() {
        let manager = Manager::new("127.0.0.1:1", vec![], Options::default());
        let err = manager
            .service()
            .handle(Request::new("raft.Nope", json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.remote_kind(), RemoteErrorKind::BadRequest);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_bad_request() {
        let manager = Manager::new("127.0.0.1:1", vec![], Options::default());
        let err = manager
            .service()
            .handle(Request::new(RaftMethod::RequestVote.as_str(), json!({"term": "x"})))
            .await
            .unwrap_err();
        assert!(matches!(err, RaftRpcError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_heartbeat_goes_to_handler_not_channel() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let manager = Manager::new(
            "127.0.0.1:1",
            vec![],
            Options::new().with_heartbeat_handler(Arc::new(move |rpc: Rpc| {
                counted.fetch_add(1, Ordering::SeqCst);
                rpc.respond(Ok(CommandResponse::AppendEntries(AppendEntriesResponse {
                    term: 3,
                    success: true,
                    ..Default::default()
                })));
            })),
        );
        let mut inbound = manager.transport().consumer().unwrap();

        let resp = manager
            .service()
            .dispatch(Command::AppendEntries(heartbeat()))
            .await
            .unwrap();
        assert!(matches!(resp, CommandResponse::AppendEntries(r) if r.success));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(inbound.try_recv().is_err());

        // A replication request still goes through the channel
        let service = manager.service();
        let mut replicate = heartbeat();
        replicate.leader_commit_index = 1;
        let call = tokio::spawn(async move {
            service.dispatch(Command::AppendEntries(replicate)).await
        });
        let rpc = inbound.recv().await.unwrap();
        assert!(!rpc.command().is_heartbeat());
        rpc.respond(Ok(CommandResponse::AppendEntries(AppendEntriesResponse::default())));
        call.await.unwrap().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_without_handler_uses_channel() {
        let manager = Manager::new("127.0.0.1:1", vec![], Options::default());
        let mut inbound = manager.transport().consumer().unwrap();
        let service = manager.service();

        let call = tokio::spawn(async move { service.dispatch(Command::AppendEntries(heartbeat())).await });
        let rpc = inbound.recv().await.unwrap();
        assert!(rpc.command().is_heartbeat());
        rpc.respond(Ok(CommandResponse::AppendEntries(AppendEntriesResponse::default())));
        call.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let manager = Manager::new(
            "127.0.0.1:1",
            vec![],
            Options::new().with_handshake_timeout(Duration::from_millis(50)),
        );
        // Consumer taken but never read
        let _inbound = manager.transport().consumer().unwrap();

        let err = manager
            .service()
            .dispatch(Command::TimeoutNow(TimeoutNowRequest::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, RaftRpcError::Timeout(50)));
        assert_eq!(err.remote_kind(), RemoteErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_engine_error_and_dropped_envelope() {
        let manager = Manager::new("127.0.0.1:1", vec![], Options::default());
        let mut inbound = manager.transport().consumer().unwrap();
        tokio::spawn(async move {
            let first = inbound.recv().await.unwrap();
            first.respond(Err("not the leader".into()));
            let second = inbound.recv().await.unwrap();
            drop(second);
        });

        let service = manager.service();
        let err = service
            .dispatch(Command::TimeoutNow(TimeoutNowRequest::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, RaftRpcError::Application(ref m) if m == "not the leader"));

        let err = service
            .dispatch(Command::TimeoutNow(TimeoutNowRequest::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, RaftRpcError::Transport(_)));
    }

    #[tokio::test]
    async fn test_mismatched_response_kind() {
        let manager = Manager::new("127.0.0.1:1", vec![], Options::default());
        let mut inbound = manager.transport().consumer().unwrap();
        tokio::spawn(async move {
            let rpc = inbound.recv().await.unwrap();
            rpc.respond(Ok(CommandResponse::TimeoutNow(TimeoutNowResponse::default())));
        });

        let args = JsonCodec::encode_args(&wire::RequestVoteRequest {
            term: 2,
            ..Default::default()
        })
        .unwrap();
        let err = manager
            .service()
            .handle(Request::new(RaftMethod::RequestVote.as_str(), args))
            .await
            .unwrap_err();
        assert!(matches!(err, RaftRpcError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_consumer_dropped_is_shutdown() {
        let manager = Manager::new("127.0.0.1:1", vec![], Options::default());
        drop(manager.transport().consumer());

        let err = manager
            .service()
            .dispatch(Command::RequestVote(RequestVoteRequest::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, RaftRpcError::Shutdown));
    }

    #[tokio::test]
    async fn test_handle_encodes_response() {
        let manager = Manager::new("127.0.0.1:1", vec![], Options::default());
        let mut inbound = manager.transport().consumer().unwrap();
        tokio::spawn(async move {
            let rpc = inbound.recv().await.unwrap();
            let term = match rpc.command() {
                Command::RequestVote(req) => req.term,
                _ => 0,
            };
            rpc.respond(Ok(CommandResponse::RequestVote(RequestVoteResponse {
                term,
                granted: true,
                ..Default::default()
            })));
        });

        let args = JsonCodec::encode_args(&wire::RequestVoteRequest {
            term: 8,
            ..Default::default()
        })
        .unwrap();
        let request = Request::new(RaftMethod::RequestVote.as_str(), args);
        let id = request.id;
        let response = manager.service().handle(request).await.unwrap();
        assert_eq!(response.id, id);

        let reply: wire::RequestVoteResponse =
            JsonCodec::decode_args(response.into_result().unwrap()).unwrap();
        assert!(reply.granted);
        assert_eq!(reply.term, 8);
    }
}
