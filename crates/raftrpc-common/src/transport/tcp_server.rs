use std::future::Future;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::auth::AuthConfig;
use crate::protocol::error::{RaftRpcError, Result};
use crate::protocol::{Request, Response};
use crate::transport::codec::{read_frame, write_frame, JsonCodec};

/// Async TCP server for the framed RPC protocol.
///
/// Each accepted connection gets its own task. Ordinary frames on a
/// connection are handled concurrently, one task per frame, and answered as
/// they complete. Frames marked as stream frames are handled one at a time in
/// arrival order, so their responses come back in order.
pub struct TcpServer {
    listener: TcpListener,
    auth: AuthConfig,
}

impl TcpServer {
    /// Creates a new TCP server bound to the specified address.
    ///
    /// # Arguments
    /// * `bind_addr` - The address to bind to (e.g., "0.0.0.0:7000")
    pub async fn new(bind_addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            RaftRpcError::Connection(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;

        Ok(Self {
            listener,
            auth: AuthConfig::disabled(),
        })
    }

    /// Requires every request to carry the given credentials.
    pub fn with_auth(mut self, auth: AuthConfig) -> Self {
        self.auth = auth;
        self
    }

    /// Gets the actual bound address.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| RaftRpcError::Connection(format!("Failed to get local addr: {}", e)))
    }

    /// Runs the server until an accept error occurs.
    pub async fn run_with_handler<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response>> + Send + 'static,
    {
        self.run_until(handler, std::future::pending()).await
    }

    /// Runs the server until `shutdown` completes.
    ///
    /// Stops accepting new connections on shutdown. Connections already
    /// accepted keep being served until their peers close them.
    pub async fn run_until<F, Fut, S>(&self, handler: F, shutdown: S) -> Result<()>
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response>> + Send + 'static,
        S: Future<Output = ()>,
    {
        let handler = Arc::new(handler);
        tokio::pin!(shutdown);

        tracing::info!(addr = ?self.listener.local_addr().ok(), "RPC server listening");

        loop {
            let (stream, peer_addr) = tokio::select! {
                accepted = self.listener.accept() => accepted.map_err(|e| {
                    RaftRpcError::Connection(format!("Failed to accept connection: {}", e))
                })?,
                _ = &mut shutdown => {
                    tracing::info!("RPC server shutting down");
                    return Ok(());
                }
            };

            tracing::debug!(peer = %peer_addr, "Connection established");

            let handler = handler.clone();
            let auth = self.auth.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, handler, auth).await {
                    tracing::debug!(peer = %peer_addr, error = %e, "Connection error");
                }
            });
        }
    }
}

/// Serve one connection until the peer closes it.
async fn handle_connection<F, Fut>(
    stream: TcpStream,
    handler: Arc<F>,
    auth: AuthConfig,
) -> Result<()>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Response>();

    // Single writer so frames from concurrent handlers never interleave.
    // It exits once every sender is gone, which closes the write half.
    let writer_task = tokio::spawn(async move {
        while let Some(response) = rx.recv().await {
            let encoded = match JsonCodec::encode_response(&response) {
                Ok(encoded) => encoded,
                Err(e) => {
                    tracing::warn!(id = response.id, error = %e, "Failed to encode response");
                    continue;
                }
            };
            if let Err(e) = write_frame(&mut writer, &encoded).await {
                tracing::debug!(error = %e, "Failed to send response");
                return;
            }
        }
    });

    let result = loop {
        let buf = match read_frame(&mut reader).await {
            Ok(Some(buf)) => buf,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        };

        // Without a request id there is nobody to answer, so drop the
        // connection and let the peer fail its pending calls.
        let request = match JsonCodec::decode_request(&buf) {
            Ok(req) => req,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to decode request, closing connection");
                break Err(e);
            }
        };

        if !auth.validate_api_key(request.api_key.as_deref().unwrap_or("")) {
            tracing::warn!(method = %request.method, "Rejected request with invalid API key");
            let err = RaftRpcError::Unauthorized("invalid or missing API key".into());
            let _ = tx.send(Response::from_error(request.id, &err));
            continue;
        }

        if request.stream {
            let response = invoke(handler.as_ref(), request).await;
            let _ = tx.send(response);
        } else {
            let handler = handler.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let response = invoke(handler.as_ref(), request).await;
                let _ = tx.send(response);
            });
        }
    };

    drop(tx);
    let _ = writer_task.await;
    result
}

async fn invoke<F, Fut>(handler: &F, request: Request) -> Response
where
    F: Fn(Request) -> Fut,
    Fut: Future<Output = Result<Response>>,
{
    let request_id = request.id;
    match handler(request).await {
        Ok(resp) => resp,
        Err(e) => {
            tracing::debug!(id = request_id, error = %e, "Handler error");
            Response::from_error(request_id, &e)
        }
    }
}
