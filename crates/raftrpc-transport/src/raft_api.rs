//! Client side: the transport contract the consensus engine calls through.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use raftrpc_common::protocol::error::{RaftRpcError, Result};
use raftrpc_common::protocol::raft::{self as wire, RaftMethod};
use raftrpc_common::protocol::{Request, Response};
use raftrpc_common::transport::{open_stream, JsonCodec, RpcChannel};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::convert::install_snapshot_to_wire;
use crate::manager::ManagerInner;
use crate::pipeline::AppendPipeline;
use crate::rpc::{HeartbeatHandler, Rpc};
use crate::types::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RequestPreVoteRequest, RequestPreVoteResponse, RequestVoteRequest, RequestVoteResponse,
    ServerAddress, ServerId, TimeoutNowRequest, TimeoutNowResponse,
};

/// What a consensus engine needs from its network layer.
///
/// Outbound calls name the peer twice: `id` selects the cached connection,
/// `target` is where to dial if there is none yet.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Takes the channel of inbound requests. Returns `None` after the first call.
    fn consumer(&self) -> Option<mpsc::UnboundedReceiver<Rpc>>;

    fn local_addr(&self) -> ServerAddress;

    /// Opens an ordered stream of append-entries to `target`.
    async fn append_entries_pipeline(
        &self,
        id: &ServerId,
        target: &ServerAddress,
    ) -> Result<AppendPipeline>;

    async fn append_entries(
        &self,
        id: &ServerId,
        target: &ServerAddress,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;

    async fn request_vote(
        &self,
        id: &ServerId,
        target: &ServerAddress,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse>;

    async fn request_pre_vote(
        &self,
        id: &ServerId,
        target: &ServerAddress,
        request: RequestPreVoteRequest,
    ) -> Result<RequestPreVoteResponse>;

    /// Sends snapshot metadata together with the snapshot bytes.
    async fn install_snapshot(
        &self,
        id: &ServerId,
        target: &ServerAddress,
        request: InstallSnapshotRequest,
        data: Vec<u8>,
    ) -> Result<InstallSnapshotResponse>;

    async fn timeout_now(
        &self,
        id: &ServerId,
        target: &ServerAddress,
        request: TimeoutNowRequest,
    ) -> Result<TimeoutNowResponse>;

    /// Serializes a peer address for storage in the engine's log.
    fn encode_peer(&self, id: &ServerId, addr: &ServerAddress) -> Vec<u8>;

    fn decode_peer(&self, buf: &[u8]) -> ServerAddress;

    /// Installs or clears the heartbeat fast path.
    fn set_heartbeat_handler(&self, handler: Option<HeartbeatHandler>);

    /// Closes every peer connection.
    async fn close(&self) -> Result<()>;
}

/// [`Transport`] backed by a [`Manager`](crate::Manager).
#[derive(Clone)]
pub struct RaftTransport {
    inner: Arc<ManagerInner>,
}

impl RaftTransport {
    pub(crate) fn new(inner: Arc<ManagerInner>) -> Self {
        Self { inner }
    }

    async fn channel(&self, id: &ServerId, target: &ServerAddress) -> Result<Arc<RpcChannel>> {
        let config = self.inner.dial_config.clone();
        self.inner
            .connections
            .get(id, target, |addr| async move {
                RpcChannel::connect(addr.as_str(), &config).await
            })
            .await
    }

    async fn call<Req, Resp>(
        &self,
        id: &ServerId,
        target: &ServerAddress,
        method: RaftMethod,
        args: &Req,
        timeout: Option<Duration>,
    ) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let channel = self.channel(id, target).await?;

        let mut request = Request::new(method.as_str(), JsonCodec::encode_args(args)?);
        if let Some(timeout) = timeout {
            request = request.with_timeout(timeout.as_millis() as u64);
        }

        tracing::debug!(peer = %id, addr = %target, method = %method, "Outbound call");
        let response = channel.call(request).await?;
        decode_reply(response)
    }
}

/// Decodes a success frame into `T`, or surfaces the peer's error.
pub(crate) fn decode_reply<T: DeserializeOwned>(response: Response) -> Result<T> {
    let result = response.into_result()?;
    serde_json::from_value(result)
        .map_err(|e| RaftRpcError::InvalidResponse(format!("Malformed reply: {}", e)))
}

#[async_trait]
impl Transport for RaftTransport {
    fn consumer(&self) -> Option<mpsc::UnboundedReceiver<Rpc>> {
        self.inner.rpc_rx.lock().take()
    }

    fn local_addr(&self) -> ServerAddress {
        self.inner.local_address.clone()
    }

    async fn append_entries_pipeline(
        &self,
        id: &ServerId,
        target: &ServerAddress,
    ) -> Result<AppendPipeline> {
        if self.inner.pipelines.is_closed() {
            return Err(RaftRpcError::Shutdown);
        }

        tracing::debug!(peer = %id, addr = %target, "Opening append-entries pipeline");
        let (sender, receiver) = open_stream(target.as_str(), &self.inner.dial_config).await?;
        AppendPipeline::start(&self.inner.pipelines, target.clone(), sender, receiver).await
    }

    async fn append_entries(
        &self,
        id: &ServerId,
        target: &ServerAddress,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let timeout = if request.is_heartbeat() {
            self.inner.heartbeat_timeout
        } else {
            None
        };
        let reply: wire::AppendEntriesResponse = self
            .call(
                id,
                target,
                RaftMethod::AppendEntries,
                &wire::AppendEntriesRequest::from(request),
                timeout,
            )
            .await?;
        Ok(reply.into())
    }

    async fn request_vote(
        &self,
        id: &ServerId,
        target: &ServerAddress,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        let reply: wire::RequestVoteResponse = self
            .call(
                id,
                target,
                RaftMethod::RequestVote,
                &wire::RequestVoteRequest::from(request),
                None,
            )
            .await?;
        Ok(reply.into())
    }

    async fn request_pre_vote(
        &self,
        id: &ServerId,
        target: &ServerAddress,
        request: RequestPreVoteRequest,
    ) -> Result<RequestPreVoteResponse> {
        let reply: wire::RequestPreVoteResponse = self
            .call(
                id,
                target,
                RaftMethod::RequestPreVote,
                &wire::RequestPreVoteRequest::from(request),
                None,
            )
            .await?;
        Ok(reply.into())
    }

    async fn install_snapshot(
        &self,
        id: &ServerId,
        target: &ServerAddress,
        request: InstallSnapshotRequest,
        data: Vec<u8>,
    ) -> Result<InstallSnapshotResponse> {
        let reply: wire::InstallSnapshotResponse = self
            .call(
                id,
                target,
                RaftMethod::InstallSnapshot,
                &install_snapshot_to_wire(request, data),
                None,
            )
            .await?;
        Ok(reply.into())
    }

    async fn timeout_now(
        &self,
        id: &ServerId,
        target: &ServerAddress,
        request: TimeoutNowRequest,
    ) -> Result<TimeoutNowResponse> {
        let reply: wire::TimeoutNowResponse = self
            .call(
                id,
                target,
                RaftMethod::TimeoutNow,
                &wire::TimeoutNowRequest::from(request),
                None,
            )
            .await?;
        Ok(reply.into())
    }

    fn encode_peer(&self, _id: &ServerId, addr: &ServerAddress) -> Vec<u8> {
        addr.as_str().as_bytes().to_vec()
    }

    fn decode_peer(&self, buf: &[u8]) -> ServerAddress {
        ServerAddress::new(String::from_utf8_lossy(buf))
    }

    fn set_heartbeat_handler(&self, handler: Option<HeartbeatHandler>) {
        self.inner.set_heartbeat_handler(handler);
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::manager::Manager;
    use raftrpc_common::protocol::RemoteErrorKind;
    use serde_json::json;

    #[test]
    fn test_peer_codec() {
        let transport = Manager::new("127.0.0.1:1", vec![], Options::default()).transport();
        let addr = ServerAddress::new("node-3.cluster:7000");
        let encoded = transport.encode_peer(&ServerId::new("n3"), &addr);
        assert_eq!(encoded, b"node-3.cluster:7000");
        assert_eq!(transport.decode_peer(&encoded), addr);
    }

    #[test]
    fn test_set_heartbeat_handler() {
        let transport = Manager::new("127.0.0.1:1", vec![], Options::default()).transport();
        transport.set_heartbeat_handler(Some(Arc::new(|_rpc: Rpc| {})));
        assert!(transport.inner.heartbeat_handler().is_some());
        transport.set_heartbeat_handler(None);
        assert!(transport.inner.heartbeat_handler().is_none());
    }

    #[test]
    fn test_decode_reply() {
        let ok = Response::success(1, json!({"header": {}, "term": 4, "granted": true}));
        let reply: wire::RequestVoteResponse = decode_reply(ok).unwrap();
        assert_eq!(reply.term, 4);

        let remote = Response::error(2, RemoteErrorKind::Timeout, "engine busy");
        let err = decode_reply::<wire::RequestVoteResponse>(remote).unwrap_err();
        assert_eq!(err.remote_kind(), RemoteErrorKind::Timeout);

        let garbage = Response::success(3, json!("nope"));
        let err = decode_reply::<wire::RequestVoteResponse>(garbage).unwrap_err();
        assert!(matches!(err, RaftRpcError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_pipeline_after_close_is_shutdown() {
        let transport = Manager::new("127.0.0.1:1", vec![], Options::default()).transport();
        transport.close().await.unwrap();

        // Nothing listens on port 2; Shutdown means no dial was attempted
        let err = transport
            .append_entries_pipeline(&ServerId::new("n2"), &ServerAddress::new("127.0.0.1:2"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RaftRpcError::Shutdown));
    }

    #[tokio::test]
    async fn test_call_after_close_is_shutdown() {
        let transport = Manager::new("127.0.0.1:1", vec![], Options::default()).transport();
        transport.close().await.unwrap();

        let err = transport
            .request_vote(
                &ServerId::new("n2"),
                &ServerAddress::new("127.0.0.1:2"),
                RequestVoteRequest::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RaftRpcError::Shutdown));
    }
}
