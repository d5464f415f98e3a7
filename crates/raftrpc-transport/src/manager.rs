use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use raftrpc_common::auth::AuthConfig;
use raftrpc_common::protocol::error::{RaftRpcError, Result};
use raftrpc_common::protocol::Request;
use raftrpc_common::transport::{DialConfig, DialOption, RpcChannel, TcpServer};
use tokio::sync::mpsc;

use crate::config::Options;
use crate::pipeline::PipelineRegistry;
use crate::pool::ConnectionPool;
use crate::raft_api::RaftTransport;
use crate::rpc::{HeartbeatHandler, Rpc};
use crate::service::RaftService;
use crate::types::ServerAddress;

/// State shared by the service (server role) and the transport (client role).
pub(crate) struct ManagerInner {
    pub(crate) local_address: ServerAddress,
    pub(crate) dial_config: DialConfig,
    pub(crate) rpc_tx: mpsc::UnboundedSender<Rpc>,
    pub(crate) rpc_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<Rpc>>>,
    pub(crate) heartbeat_handler: parking_lot::Mutex<Option<HeartbeatHandler>>,
    pub(crate) heartbeat_timeout: Option<Duration>,
    pub(crate) handshake_timeout: Option<Duration>,
    pub(crate) auth: AuthConfig,
    pub(crate) connections: ConnectionPool<RpcChannel>,
    pub(crate) pipelines: PipelineRegistry,
}

impl ManagerInner {
    pub(crate) fn heartbeat_handler(&self) -> Option<HeartbeatHandler> {
        self.heartbeat_handler.lock().clone()
    }

    pub(crate) fn set_heartbeat_handler(&self, handler: Option<HeartbeatHandler>) {
        *self.heartbeat_handler.lock() = handler;
    }

    /// Shuts down pipelines, then the cached peer connections, collecting
    /// every failure from both.
    pub(crate) async fn close(&self) -> Result<()> {
        let mut errors = self.pipelines.close().await;
        match self.connections.close().await {
            Ok(()) => {}
            Err(RaftRpcError::Close(pool_errors)) => errors.append(pool_errors),
            Err(e) => errors.push(e),
        }
        errors.into_result()
    }
}

/// Creates and owns both halves of the Raft transport.
///
/// - [`service`](Manager::service) answers inbound calls from peers and hands
///   them to the engine
/// - [`transport`](Manager::transport) is what the engine uses to call peers
///
/// Both share the peer connections, the hand-off channel and the heartbeat
/// handler. Cloning a `Manager` is cheap and yields a handle to the same
/// state.
///
/// # Example
///
/// ```rust,no_run
/// use raftrpc_common::transport::{DialOption, TcpServer};
/// use raftrpc_transport::{Manager, Options, Transport};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let manager = Manager::new("127.0.0.1:7001", vec![DialOption::NoDelay(true)], Options::default());
///
/// let server = TcpServer::new("127.0.0.1:7001").await?;
/// let serving = manager.clone();
/// tokio::spawn(async move { serving.serve(server).await });
///
/// let transport = manager.transport();
/// let mut inbound = transport.consumer().expect("consumer taken once");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

impl Manager {
    /// Creates a manager for the node reachable at `local_address`.
    ///
    /// `dial_options` are applied to every outbound connection. No network
    /// activity happens until the first call to a peer.
    pub fn new(
        local_address: impl Into<ServerAddress>,
        dial_options: Vec<DialOption>,
        options: Options,
    ) -> Self {
        let (rpc_tx, rpc_rx) = mpsc::unbounded_channel();
        let local_address = local_address.into();

        tracing::debug!(
            addr = %local_address,
            dial_options = dial_options.len(),
            ?options,
            "Creating Raft transport"
        );

        Self {
            inner: Arc::new(ManagerInner {
                local_address,
                dial_config: DialConfig::from_options(&dial_options),
                rpc_tx,
                rpc_rx: parking_lot::Mutex::new(Some(rpc_rx)),
                heartbeat_handler: parking_lot::Mutex::new(options.heartbeat_handler),
                heartbeat_timeout: options.heartbeat_timeout,
                handshake_timeout: options.handshake_timeout,
                auth: options.auth,
                connections: ConnectionPool::new(),
                pipelines: PipelineRegistry::default(),
            }),
        }
    }

    /// The inbound dispatcher, to be registered on an RPC server.
    pub fn service(&self) -> RaftService {
        RaftService::new(self.inner.clone())
    }

    /// The outbound half, used by the consensus engine.
    pub fn transport(&self) -> RaftTransport {
        RaftTransport::new(self.inner.clone())
    }

    pub fn local_addr(&self) -> &ServerAddress {
        &self.inner.local_address
    }

    /// Serves the Raft service on `server` until it fails to accept.
    pub async fn serve(&self, server: TcpServer) -> Result<()> {
        self.serve_until(server, std::future::pending()).await
    }

    /// Serves the Raft service on `server` until `shutdown` completes.
    ///
    /// Credentials configured through [`Options::with_auth`] replace any the
    /// server was built with.
    pub async fn serve_until<S>(&self, server: TcpServer, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        let server = if self.inner.auth.requires_auth() {
            server.with_auth(self.inner.auth.clone())
        } else {
            server
        };

        let service = self.service();
        server
            .run_until(
                move |request: Request| {
                    let service = service.clone();
                    async move { service.handle(request).await }
                },
                shutdown,
            )
            .await
    }

    /// Closes every peer connection, pipelines included.
    ///
    /// All connections are closed even if some fail; the failures come back
    /// together as one error. Closing an already closed manager is a no-op.
    /// Afterwards every outbound call and new pipeline fails with
    /// [`RaftRpcError::Shutdown`].
    pub async fn close(&self) -> Result<()> {
        tracing::debug!(addr = %self.inner.local_address, "Closing Raft transport");
        self.inner.close().await
    }
}
