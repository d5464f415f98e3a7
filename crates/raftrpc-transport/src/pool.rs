//! Per-peer connection handles, created lazily and closed together.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use raftrpc_common::protocol::error::{CloseErrors, RaftRpcError, Result};
use tokio::sync::Mutex;

use crate::conn::{ConnHandle, Connection};
use crate::types::{ServerAddress, ServerId};

/// Map of peer id to connection handle.
///
/// Handles are created on first use and live until [`close`](Self::close).
/// The map lock is only held to look up or insert a handle, never while
/// dialing; dials are serialized per peer by each handle's own lock.
///
/// # Lock order
///
/// Map lock first, then a handle lock. [`get`](Self::get) releases the map
/// lock before it touches the handle, and [`close`](Self::close) takes the
/// handle locks while holding the map lock.
///
/// # Example
///
/// ```rust,no_run
/// use raftrpc_common::transport::{DialConfig, RpcChannel};
/// use raftrpc_transport::{ConnectionPool, ServerAddress, ServerId};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = ConnectionPool::<RpcChannel>::new();
/// let config = DialConfig::default();
///
/// let channel = pool
///     .get(&ServerId::new("n2"), &ServerAddress::new("127.0.0.1:7002"), |addr| {
///         let config = config.clone();
///         async move { RpcChannel::connect(addr.as_str(), &config).await }
///     })
///     .await?;
///
/// pool.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct ConnectionPool<C> {
    inner: Mutex<PoolInner<C>>,
}

struct PoolInner<C> {
    handles: HashMap<ServerId, Arc<ConnHandle<C>>>,
    closed: bool,
}

impl<C: Connection> ConnectionPool<C> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                handles: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// Returns the handle for `id`, inserting an undialed one if needed.
    ///
    /// Never touches the network.
    ///
    /// # Errors
    ///
    /// Returns [`RaftRpcError::Shutdown`] after the pool has been closed.
    pub async fn resolve(&self, id: &ServerId) -> Result<Arc<ConnHandle<C>>> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(RaftRpcError::Shutdown);
        }

        let handle = inner
            .handles
            .entry(id.clone())
            .or_insert_with(|| {
                tracing::debug!(peer = %id, "New peer handle");
                Arc::new(ConnHandle::new())
            })
            .clone();
        Ok(handle)
    }

    /// Resolves the handle for `id` and returns its live connection, dialing
    /// `addr` if the handle has none.
    pub async fn get<F, Fut>(&self, id: &ServerId, addr: &ServerAddress, dial: F) -> Result<Arc<C>>
    where
        F: FnOnce(ServerAddress) -> Fut,
        Fut: Future<Output = Result<C>>,
    {
        let handle = self.resolve(id).await?;
        handle.get(addr, dial).await
    }

    /// Number of peers with a handle.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.handles.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Closes every connection and empties the pool.
    ///
    /// Waits out dials in flight, then closes their results. Every handle is
    /// closed even if some fail; all failures are returned together as
    /// [`RaftRpcError::Close`]. Calling it again returns `Ok(())`.
    pub async fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.closed = true;

        let mut errors = CloseErrors::new();
        for (id, handle) in inner.handles.drain() {
            if let Err(e) = handle.close().await {
                tracing::warn!(peer = %id, error = %e, "Failed to close connection");
                errors.push(e);
            }
        }
        errors.into_result()
    }
}

impl<C: Connection> Default for ConnectionPool<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::tests::FakeConn;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    fn peer(n: u32) -> (ServerId, ServerAddress) {
        (
            ServerId::new(format!("n{}", n)),
            ServerAddress::new(format!("10.0.0.{}:7000", n)),
        )
    }

    #[tokio::test]
    async fn test_resolve_is_idempotent() {
        let pool = ConnectionPool::<FakeConn>::new();
        let (id, _) = peer(1);

        let a = pool.resolve(&id).await.unwrap();
        let b = pool.resolve(&id).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.len().await, 1);
        assert!(!a.is_established().await);
    }

    #[tokio::test]
    async fn test_one_dial_per_peer_under_concurrency() {
        let pool = Arc::new(ConnectionPool::<FakeConn>::new());
        let dials = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..20)
            .map(|i| {
                let pool = pool.clone();
                let dials = dials.clone();
                let closes = closes.clone();
                tokio::spawn(async move {
                    // Two peers, ten callers each
                    let (id, addr) = peer(i % 2);
                    pool.get(&id, &addr, |_| async move {
                        dials.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(FakeConn::new(closes))
                    })
                    .await
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(dials.load(Ordering::SeqCst), 2);
        assert_eq!(pool.len().await, 2);

        pool.close().await.unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_close_waits_for_inflight_dial() {
        let pool = Arc::new(ConnectionPool::<FakeConn>::new());
        let closes = Arc::new(AtomicUsize::new(0));
        let dial_started = Arc::new(Notify::new());
        let release_dial = Arc::new(Notify::new());

        let getter = {
            let pool = pool.clone();
            let closes = closes.clone();
            let dial_started = dial_started.clone();
            let release_dial = release_dial.clone();
            tokio::spawn(async move {
                let (id, addr) = peer(1);
                pool.get(&id, &addr, |_| async move {
                    dial_started.notify_one();
                    release_dial.notified().await;
                    Ok(FakeConn::new(closes))
                })
                .await
            })
        };
        dial_started.notified().await;

        let closer = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.close().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!closer.is_finished(), "close must wait for the dial");

        release_dial.notify_one();
        let conn = getter.await.unwrap().unwrap();
        closer.await.unwrap().unwrap();

        assert!(conn.is_closed());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_after_failed_dial_closes_nothing() {
        let pool = ConnectionPool::<FakeConn>::new();
        let (id, addr) = peer(3);

        let result = pool
            .get(&id, &addr, |a| async move {
                Err(RaftRpcError::Dial {
                    addr: a.to_string(),
                    reason: "connection refused".into(),
                })
            })
            .await;
        assert!(result.is_err());

        pool.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_aggregates_every_failure() {
        let pool = ConnectionPool::<FakeConn>::new();
        let closes = Arc::new(AtomicUsize::new(0));

        for n in 0..3 {
            let (id, addr) = peer(n);
            let closes = closes.clone();
            pool.get(&id, &addr, |_| async move {
                let mut conn = FakeConn::new(closes);
                conn.fail_close = n != 1;
                Ok(conn)
            })
            .await
            .unwrap();
        }

        match pool.close().await {
            Err(RaftRpcError::Close(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("expected aggregated close error, got {:?}", other),
        }
        // All three were attempted
        assert_eq!(closes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_close_twice_and_resolve_after_close() {
        let pool = ConnectionPool::<FakeConn>::new();
        let closes = Arc::new(AtomicUsize::new(0));
        let (id, addr) = peer(4);
        pool.get(&id, &addr, |_| async { Ok(FakeConn::new(closes.clone())) })
            .await
            .unwrap();

        pool.close().await.unwrap();
        pool.close().await.unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(pool.is_empty().await);

        assert!(matches!(
            pool.resolve(&id).await.err().unwrap(),
            RaftRpcError::Shutdown
        ));
    }
}
