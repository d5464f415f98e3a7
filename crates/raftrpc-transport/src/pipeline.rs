//! Pipelined append-entries over an ordered stream.
//!
//! Requests are written back to back without waiting for replies. The peer
//! handles stream frames one at a time, so replies come back in the order the
//! requests went out and are matched to them by position.

use std::sync::{Arc, Weak};
use std::time::Instant;

use raftrpc_common::protocol::error::{CloseErrors, RaftRpcError, Result};
use raftrpc_common::protocol::raft::{self as wire, RaftMethod};
use raftrpc_common::protocol::Request;
use raftrpc_common::transport::{JsonCodec, StreamReceiver, StreamSender};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;

use crate::raft_api::decode_reply;
use crate::types::{AppendEntriesRequest, AppendEntriesResponse, ServerAddress};

/// Maximum number of appends awaiting a reply before
/// [`AppendPipeline::append_entries`] waits.
pub const MAX_INFLIGHT: usize = 20;

/// Outcome of one pipelined append-entries.
#[derive(Debug)]
pub struct PipelineResult {
    /// When the request was sent
    pub start: Instant,
    pub request: AppendEntriesRequest,
    pub response: Result<AppendEntriesResponse>,
}

struct InFlight {
    start: Instant,
    request: AppendEntriesRequest,
}

/// The stream connection behind one pipeline, shared with the registry so the
/// transport can tear it down on shutdown.
struct StreamConn {
    target: ServerAddress,
    sender: Mutex<Option<StreamSender>>,
    stop: Notify,
}

impl StreamConn {
    /// Half-closes the stream. Replies already owed are still read.
    async fn finish(&self) -> Result<()> {
        let sender = self.sender.lock().await.take();
        match sender {
            Some(mut sender) => sender.close().await,
            None => Ok(()),
        }
    }

    /// Closes both directions; appends still waiting for a reply fail.
    async fn shutdown(&self) -> Result<()> {
        self.stop.notify_one();
        self.finish().await
    }
}

/// Every pipeline stream opened through one transport.
///
/// Once closed, no new pipeline can be registered.
#[derive(Default)]
pub(crate) struct PipelineRegistry {
    inner: parking_lot::Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    streams: Vec<Weak<StreamConn>>,
    closed: bool,
}

impl PipelineRegistry {
    pub(crate) fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    fn register(&self, conn: &Arc<StreamConn>) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(RaftRpcError::Shutdown);
        }
        inner.streams.retain(|s| s.strong_count() > 0);
        inner.streams.push(Arc::downgrade(conn));
        Ok(())
    }

    /// Shuts down every live pipeline stream and refuses new ones.
    pub(crate) async fn close(&self) -> CloseErrors {
        let live: Vec<Arc<StreamConn>> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.streams.drain(..).filter_map(|s| s.upgrade()).collect()
        };

        let mut errors = CloseErrors::new();
        for conn in live {
            if let Err(e) = conn.shutdown().await {
                tracing::warn!(peer = %conn.target, error = %e, "Failed to close pipeline");
                errors.push(e);
            }
        }
        errors
    }
}

/// Client side of an append-entries stream to one peer.
///
/// Obtained from [`Transport::append_entries_pipeline`](crate::Transport::append_entries_pipeline).
/// The stream runs on its own connection, separate from the peer's cached
/// one, and is closed along with the transport. Dropping the pipeline
/// cancels replies still in flight.
pub struct AppendPipeline {
    conn: Arc<StreamConn>,
    inflight: Option<mpsc::Sender<InFlight>>,
    done: Option<mpsc::Receiver<PipelineResult>>,
    receiver: JoinHandle<()>,
}

impl AppendPipeline {
    /// Starts reading replies and registers the stream for shutdown.
    ///
    /// # Errors
    ///
    /// [`RaftRpcError::Shutdown`] if the registry was closed while the stream
    /// was being opened. The stream is closed before returning.
    pub(crate) async fn start(
        registry: &PipelineRegistry,
        target: ServerAddress,
        sender: StreamSender,
        stream: StreamReceiver,
    ) -> Result<Self> {
        let conn = Arc::new(StreamConn {
            target,
            sender: Mutex::new(Some(sender)),
            stop: Notify::new(),
        });
        if let Err(e) = registry.register(&conn) {
            let _ = conn.finish().await;
            return Err(e);
        }

        let (inflight_tx, inflight_rx) = mpsc::channel(MAX_INFLIGHT);
        let (done_tx, done_rx) = mpsc::channel(MAX_INFLIGHT);
        let receiver = tokio::spawn(receive_replies(conn.clone(), stream, inflight_rx, done_tx));

        Ok(Self {
            conn,
            inflight: Some(inflight_tx),
            done: Some(done_rx),
            receiver,
        })
    }

    pub fn target(&self) -> &ServerAddress {
        &self.conn.target
    }

    /// Sends one request down the stream.
    ///
    /// Returns once the request is written; the reply is delivered through
    /// [`consumer`](Self::consumer). Waits while [`MAX_INFLIGHT`] requests
    /// are unanswered.
    ///
    /// # Errors
    ///
    /// - [`RaftRpcError::Shutdown`] after [`close`](Self::close) or once the
    ///   transport is closed
    /// - The write error if the stream is broken
    pub async fn append_entries(&mut self, request: AppendEntriesRequest) -> Result<()> {
        let Some(inflight) = self.inflight.as_ref() else {
            return Err(RaftRpcError::Shutdown);
        };

        let args = JsonCodec::encode_args(&wire::AppendEntriesRequest::from(request.clone()))?;
        let start = Instant::now();
        {
            let mut sender = self.conn.sender.lock().await;
            let Some(sender) = sender.as_mut() else {
                return Err(RaftRpcError::Shutdown);
            };
            sender
                .send(Request::new(RaftMethod::AppendEntriesPipeline.as_str(), args))
                .await?;
        }

        inflight.send(InFlight { start, request }).await.map_err(|_| {
            RaftRpcError::Connection(format!("pipeline to {} stopped", self.conn.target))
        })
    }

    /// Takes the channel of completed appends, in send order. Returns `None`
    /// after the first call.
    pub fn consumer(&mut self) -> Option<mpsc::Receiver<PipelineResult>> {
        self.done.take()
    }

    /// Stops sending. Replies to appends already sent are still delivered.
    pub async fn close(&mut self) -> Result<()> {
        if self.inflight.take().is_some() {
            tracing::debug!(peer = %self.conn.target, "Closing append-entries pipeline");
        }
        self.conn.finish().await
    }
}

impl Drop for AppendPipeline {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

async fn receive_replies(
    conn: Arc<StreamConn>,
    mut stream: StreamReceiver,
    mut inflight: mpsc::Receiver<InFlight>,
    done: mpsc::Sender<PipelineResult>,
) {
    let target = conn.target.clone();
    let waiting = loop {
        let next = tokio::select! {
            next = inflight.recv() => next,
            _ = conn.stop.notified() => break None,
        };
        let Some(InFlight { start, request }) = next else {
            return;
        };

        let reply = tokio::select! {
            reply = stream.recv() => Some(reply),
            _ = conn.stop.notified() => None,
        };
        let Some(reply) = reply else {
            break Some(InFlight { start, request });
        };

        let response = match reply {
            Ok(Some(reply)) => {
                decode_reply::<wire::AppendEntriesResponse>(reply).map(AppendEntriesResponse::from)
            }
            Ok(None) => Err(RaftRpcError::Connection(format!(
                "pipeline to {} closed by peer",
                target
            ))),
            Err(e) => Err(e),
        };

        let result = PipelineResult {
            start,
            request,
            response,
        };
        if done.send(result).await.is_err() {
            tracing::debug!(peer = %target, "Pipeline consumer gone, stopping");
            return;
        }
    };

    drop(stream);
    inflight.close();
    fail_remaining(&target, waiting, inflight, &done).await;
}

/// Fails the append being waited on and everything queued behind it.
async fn fail_remaining(
    target: &ServerAddress,
    current: Option<InFlight>,
    mut inflight: mpsc::Receiver<InFlight>,
    done: &mpsc::Sender<PipelineResult>,
) {
    tracing::debug!(peer = %target, "Pipeline shut down");
    let queued = std::iter::from_fn(|| inflight.try_recv().ok());
    for InFlight { start, request } in current.into_iter().chain(queued) {
        let result = PipelineResult {
            start,
            request,
            response: Err(RaftRpcError::Connection(format!(
                "pipeline to {} shut down",
                target
            ))),
        };
        if done.send(result).await.is_err() {
            return;
        }
    }
}
