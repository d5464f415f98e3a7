use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::protocol::error::{RaftRpcError, Result};
use crate::protocol::{Request, RequestId, Response};
use crate::transport::codec::{read_frame, write_frame, JsonCodec};
use crate::transport::dial::DialConfig;

/// Connects to `addr` using the dial configuration.
///
/// The address may resolve to several socket addresses; each is tried in
/// turn, every attempt bounded by `config.connect_timeout`.
///
/// # Errors
///
/// Returns [`RaftRpcError::Dial`] if the address cannot be resolved or no
/// resolved address accepts the connection.
pub async fn dial(addr: &str, config: &DialConfig) -> Result<TcpStream> {
    let socket_addrs: Vec<SocketAddr> = tokio::net::lookup_host(addr)
        .await
        .map_err(|e| RaftRpcError::Dial {
            addr: addr.to_string(),
            reason: format!("invalid address: {}", e),
        })?
        .collect();

    let mut last_err = None;
    for socket_addr in socket_addrs {
        match tokio::time::timeout(config.connect_timeout, connect_socket(socket_addr, config)).await
        {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => last_err = Some(e.to_string()),
            Err(_) => {
                last_err = Some(format!(
                    "connect timed out after {}ms",
                    config.connect_timeout.as_millis()
                ))
            }
        }
    }

    Err(RaftRpcError::Dial {
        addr: addr.to_string(),
        reason: last_err.unwrap_or_else(|| "no addresses resolved".to_string()),
    })
}

async fn connect_socket(addr: SocketAddr, config: &DialConfig) -> std::io::Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_keepalive(config.keepalive)?;
    let stream = socket.connect(addr).await?;
    stream.set_nodelay(config.nodelay)?;
    Ok(stream)
}

#[derive(Default)]
struct Pending {
    calls: HashMap<RequestId, oneshot::Sender<Result<Response>>>,
    closed: bool,
}

/// A live, multiplexed client connection to one server.
///
/// Many calls may be in flight at once on the same connection. Each request
/// is written as one frame; a background task reads response frames and
/// hands each to the caller waiting on the matching request id.
///
/// # Example
///
/// ```no_run
/// use raftrpc_common::transport::{DialConfig, RpcChannel};
/// use raftrpc_common::protocol::Request;
/// use serde_json::json;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let channel = RpcChannel::connect("127.0.0.1:7000", &DialConfig::default()).await?;
/// let response = channel.call(Request::new("raft.TimeoutNow", json!({"header": {}}))).await?;
/// channel.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct RpcChannel {
    addr: String,
    config: DialConfig,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Arc<Mutex<Pending>>,
    reader: JoinHandle<()>,
}

impl RpcChannel {
    /// Dials `addr` and starts the response reader.
    pub async fn connect(addr: &str, config: &DialConfig) -> Result<Self> {
        let stream = dial(addr, config).await?;
        let (read_half, write_half) = stream.into_split();

        let pending = Arc::new(Mutex::new(Pending::default()));
        let reader = tokio::spawn(read_responses(
            addr.to_string(),
            read_half,
            pending.clone(),
        ));

        tracing::debug!(addr = %addr, "RPC channel established");

        Ok(Self {
            addr: addr.to_string(),
            config: config.clone(),
            writer: tokio::sync::Mutex::new(write_half),
            pending,
            reader,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// True once the connection is unusable: closed locally, closed by the
    /// peer, or failed while reading.
    pub fn is_closed(&self) -> bool {
        self.pending.lock().closed
    }

    /// Sends a request and waits for its response.
    ///
    /// Credentials and interceptors from the dial configuration are applied
    /// first. If the request carries `timeout_ms`, the wait is bounded by it.
    ///
    /// # Errors
    ///
    /// - [`RaftRpcError::Connection`] if the connection is or becomes closed
    /// - [`RaftRpcError::Timeout`] if the request deadline elapses
    pub async fn call(&self, mut request: Request) -> Result<Response> {
        self.config.prepare(&mut request);
        let id = request.id;
        let encoded = JsonCodec::encode_request(&request)?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if pending.closed {
                return Err(RaftRpcError::Connection(format!(
                    "connection to {} is closed",
                    self.addr
                )));
            }
            pending.calls.insert(id, tx);
        }

        let written = {
            let mut writer = self.writer.lock().await;
            write_frame(&mut *writer, &encoded).await
        };
        if let Err(e) = written {
            self.pending.lock().calls.remove(&id);
            return Err(e);
        }

        let outcome = match request.timeout_ms {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.pending.lock().calls.remove(&id);
                    return Err(RaftRpcError::Timeout(ms));
                }
            },
            None => rx.await,
        };

        outcome.map_err(|_| {
            RaftRpcError::Connection(format!("connection to {} dropped the call", self.addr))
        })?
    }

    /// Closes the connection. Calls still waiting fail with a connection error.
    pub async fn close(&self) -> Result<()> {
        self.reader.abort();
        fail_pending(&self.pending, &self.addr);

        let mut writer = self.writer.lock().await;
        writer.shutdown().await.map_err(|e| {
            RaftRpcError::Connection(format!("failed to close connection to {}: {}", self.addr, e))
        })
    }
}

impl Drop for RpcChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_responses(addr: String, mut reader: OwnedReadHalf, pending: Arc<Mutex<Pending>>) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(buf)) => match JsonCodec::decode_response(&buf) {
                Ok(response) => {
                    let waiter = pending.lock().calls.remove(&response.id);
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(Ok(response));
                        }
                        None => {
                            tracing::debug!(addr = %addr, id = response.id, "Dropping response for unknown call");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(addr = %addr, error = %e, "Undecodable response frame");
                    break;
                }
            },
            Ok(None) => {
                tracing::debug!(addr = %addr, "Connection closed by peer");
                break;
            }
            Err(e) => {
                tracing::debug!(addr = %addr, error = %e, "Connection read failed");
                break;
            }
        }
    }

    fail_pending(&pending, &addr);
}

fn fail_pending(pending: &Mutex<Pending>, addr: &str) {
    let waiters: Vec<_> = {
        let mut pending = pending.lock();
        pending.closed = true;
        pending.calls.drain().map(|(_, tx)| tx).collect()
    };
    for tx in waiters {
        let _ = tx.send(Err(RaftRpcError::Connection(format!(
            "connection to {} lost",
            addr
        ))));
    }
}

/// Opens an ordered stream on a dedicated connection.
///
/// Every frame sent on the stream is marked so the server handles frames one
/// at a time in arrival order; responses come back in the same order.
pub async fn open_stream(addr: &str, config: &DialConfig) -> Result<(StreamSender, StreamReceiver)> {
    let stream = dial(addr, config).await?;
    let (read_half, write_half) = stream.into_split();

    tracing::debug!(addr = %addr, "RPC stream opened");

    Ok((
        StreamSender {
            addr: addr.to_string(),
            config: config.clone(),
            writer: write_half,
        },
        StreamReceiver {
            addr: addr.to_string(),
            reader: read_half,
        },
    ))
}

/// Sending half of an ordered stream.
pub struct StreamSender {
    addr: String,
    config: DialConfig,
    writer: OwnedWriteHalf,
}

impl StreamSender {
    pub async fn send(&mut self, mut request: Request) -> Result<RequestId> {
        request.stream = true;
        self.config.prepare(&mut request);
        let encoded = JsonCodec::encode_request(&request)?;
        write_frame(&mut self.writer, &encoded).await?;
        Ok(request.id)
    }

    /// Half-closes the stream; the server finishes the frames already sent.
    pub async fn close(&mut self) -> Result<()> {
        self.writer.shutdown().await.map_err(|e| {
            RaftRpcError::Connection(format!("failed to close stream to {}: {}", self.addr, e))
        })
    }
}

/// Receiving half of an ordered stream.
pub struct StreamReceiver {
    addr: String,
    reader: OwnedReadHalf,
}

impl StreamReceiver {
    /// Next response, or `None` once the server closed the stream.
    pub async fn recv(&mut self) -> Result<Option<Response>> {
        match read_frame(&mut self.reader).await? {
            Some(buf) => Ok(Some(JsonCodec::decode_response(&buf)?)),
            None => {
                tracing::debug!(addr = %self.addr, "Stream closed by peer");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RemoteErrorKind;
    use serde_json::json;
    use tokio::net::TcpListener;

    /// Accepts one connection and answers each pair of frames in reverse order.
    async fn spawn_swapping_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            loop {
                let first = match read_frame(&mut stream).await.unwrap() {
                    Some(buf) => JsonCodec::decode_request(&buf).unwrap(),
                    None => return,
                };
                let second = match read_frame(&mut stream).await.unwrap() {
                    Some(buf) => JsonCodec::decode_request(&buf).unwrap(),
                    None => return,
                };
                for req in [second, first] {
                    let resp = Response::success(req.id, req.args.clone());
                    let encoded = JsonCodec::encode_response(&resp).unwrap();
                    write_frame(&mut stream, &encoded).await.unwrap();
                }
            }
        });

        addr
    }

    #[tokio::test]
    async fn test_dial_refused_is_dial_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = dial(&addr, &DialConfig::default()).await.unwrap_err();
        assert!(err.is_dial(), "expected dial error, got {:?}", err);
    }

    #[tokio::test]
    async fn test_dial_invalid_address() {
        let err = dial("not an address", &DialConfig::default())
            .await
            .unwrap_err();
        assert!(err.is_dial());
    }

    #[tokio::test]
    async fn test_concurrent_calls_matched_by_id() {
        let addr = spawn_swapping_server().await;
        let channel = Arc::new(RpcChannel::connect(&addr, &DialConfig::default()).await.unwrap());

        let a = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.call(Request::new("echo", json!("a"))).await })
        };
        let b = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.call(Request::new("echo", json!("b"))).await })
        };

        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();
        assert_eq!(a.into_result().unwrap(), json!("a"));
        assert_eq!(b.into_result().unwrap(), json!("b"));
    }

    #[tokio::test]
    async fn test_call_timeout() {
        // Server accepts but never answers
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let channel = RpcChannel::connect(&addr, &DialConfig::default()).await.unwrap();
        let err = channel
            .call(Request::new("slow", json!({})).with_timeout(50))
            .await
            .unwrap_err();
        assert!(matches!(err, RaftRpcError::Timeout(50)));
        assert!(!channel.is_closed());
    }

    #[tokio::test]
    async fn test_peer_close_fails_pending_calls() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            // Read one request, then hang up without answering
            let _ = read_frame(&mut stream).await;
        });

        let channel = RpcChannel::connect(&addr, &DialConfig::default()).await.unwrap();
        let err = channel
            .call(Request::new("dropped", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, RaftRpcError::Connection(_)));
        assert!(channel.is_closed());
    }

    #[tokio::test]
    async fn test_call_after_close_fails() {
        let addr = spawn_swapping_server().await;
        let channel = RpcChannel::connect(&addr, &DialConfig::default()).await.unwrap();
        channel.close().await.unwrap();

        assert!(channel.is_closed());
        let err = channel.call(Request::new("late", json!({}))).await.unwrap_err();
        assert!(matches!(err, RaftRpcError::Connection(_)));
    }

    #[tokio::test]
    async fn test_stream_marks_frames_and_keeps_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            while let Some(buf) = read_frame(&mut stream).await.unwrap() {
                let req = JsonCodec::decode_request(&buf).unwrap();
                let resp = if req.stream {
                    Response::success(req.id, req.args)
                } else {
                    Response::error(req.id, RemoteErrorKind::BadRequest, "not a stream frame")
                };
                write_frame(&mut stream, &JsonCodec::encode_response(&resp).unwrap())
                    .await
                    .unwrap();
            }
        });

        let (mut sender, mut receiver) = open_stream(&addr, &DialConfig::default()).await.unwrap();
        let mut sent = Vec::new();
        for i in 0..5 {
            sent.push(sender.send(Request::new("seq", json!(i))).await.unwrap());
        }
        sender.close().await.unwrap();

        for (i, id) in sent.into_iter().enumerate() {
            let resp = receiver.recv().await.unwrap().unwrap();
            assert_eq!(resp.id, id);
            assert_eq!(resp.into_result().unwrap(), json!(i));
        }
        assert!(receiver.recv().await.unwrap().is_none());
    }
}
