//! Lazily-established, reusable connection to one peer.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use raftrpc_common::protocol::error::{RaftRpcError, Result};
use raftrpc_common::transport::RpcChannel;
use tokio::sync::Mutex;

use crate::types::ServerAddress;

/// What a [`ConnHandle`] needs from the connection it caches.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    async fn close(&self) -> Result<()>;

    /// True once the connection can no longer carry calls.
    fn is_closed(&self) -> bool;
}

#[async_trait]
impl Connection for RpcChannel {
    async fn close(&self) -> Result<()> {
        RpcChannel::close(self).await
    }

    fn is_closed(&self) -> bool {
        RpcChannel::is_closed(self)
    }
}

enum DialState<C> {
    Idle,
    Established(Arc<C>),
    Closed,
}

/// Owns at most one live connection to a peer.
///
/// The state sits behind an async lock that is held for the whole dial, so
/// callers arriving while a dial is in flight wait for it and then reuse its
/// result instead of dialing again.
pub struct ConnHandle<C> {
    state: Mutex<DialState<C>>,
}

impl<C: Connection> ConnHandle<C> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DialState::Idle),
        }
    }

    /// Returns the cached connection, dialing `addr` first if there is none.
    ///
    /// A connection the peer has since closed is replaced by a fresh dial. A
    /// failed dial leaves the handle idle, so a later call may try again.
    ///
    /// # Errors
    ///
    /// - Whatever `dial` returns
    /// - [`RaftRpcError::Shutdown`] once the handle is closed
    pub async fn get<F, Fut>(&self, addr: &ServerAddress, dial: F) -> Result<Arc<C>>
    where
        F: FnOnce(ServerAddress) -> Fut,
        Fut: Future<Output = Result<C>>,
    {
        let mut state = self.state.lock().await;
        match &*state {
            DialState::Established(conn) if !conn.is_closed() => return Ok(conn.clone()),
            DialState::Established(_) => {
                tracing::debug!(addr = %addr, "Cached connection closed by peer, redialing");
            }
            DialState::Closed => return Err(RaftRpcError::Shutdown),
            DialState::Idle => {}
        }

        *state = DialState::Idle;
        tracing::debug!(addr = %addr, "Dialing peer");
        let conn = Arc::new(dial(addr.clone()).await?);
        *state = DialState::Established(conn.clone());
        Ok(conn)
    }

    /// Closes the connection, if one was established, and retires the handle.
    ///
    /// Waits for an in-flight dial to finish first.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, DialState::Closed) {
            DialState::Established(conn) => conn.close().await,
            DialState::Idle | DialState::Closed => Ok(()),
        }
    }

    /// True if a connection is currently cached.
    pub async fn is_established(&self) -> bool {
        matches!(&*self.state.lock().await, DialState::Established(_))
    }
}

impl<C: Connection> Default for ConnHandle<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// In-memory connection that records how it was closed.
    pub(crate) struct FakeConn {
        pub(crate) closed: AtomicBool,
        pub(crate) closes: Arc<AtomicUsize>,
        pub(crate) fail_close: bool,
    }

    impl FakeConn {
        pub(crate) fn new(closes: Arc<AtomicUsize>) -> Self {
            Self {
                closed: AtomicBool::new(false),
                closes,
                fail_close: false,
            }
        }
    }

    #[async_trait]
    impl Connection for FakeConn {
        async fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail_close {
                Err(RaftRpcError::Connection("close failed".into()))
            } else {
                Ok(())
            }
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    fn addr() -> ServerAddress {
        ServerAddress::from("10.0.0.2:7000")
    }

    #[tokio::test]
    async fn test_concurrent_get_dials_once() {
        let handle = Arc::new(ConnHandle::<FakeConn>::new());
        let dials = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let handle = handle.clone();
                let dials = dials.clone();
                let closes = closes.clone();
                tokio::spawn(async move {
                    handle
                        .get(&addr(), |_| async move {
                            dials.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(FakeConn::new(closes))
                        })
                        .await
                })
            })
            .collect();

        let mut conns = Vec::new();
        for task in tasks {
            conns.push(task.await.unwrap().unwrap());
        }

        assert_eq!(dials.load(Ordering::SeqCst), 1);
        assert!(conns.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[tokio::test]
    async fn test_failed_dial_is_not_cached() {
        let handle = ConnHandle::<FakeConn>::new();
        let err = handle
            .get(&addr(), |a| async move {
                Err(RaftRpcError::Dial {
                    addr: a.to_string(),
                    reason: "refused".into(),
                })
            })
            .await
            .err()
            .unwrap();
        assert!(err.is_dial());
        assert!(!handle.is_established().await);

        let closes = Arc::new(AtomicUsize::new(0));
        handle
            .get(&addr(), |_| async { Ok(FakeConn::new(closes.clone())) })
            .await
            .unwrap();
        assert!(handle.is_established().await);
    }

    #[tokio::test]
    async fn test_redial_after_peer_close() {
        let handle = ConnHandle::<FakeConn>::new();
        let closes = Arc::new(AtomicUsize::new(0));

        let first = handle
            .get(&addr(), |_| async { Ok(FakeConn::new(closes.clone())) })
            .await
            .unwrap();
        first.closed.store(true, Ordering::SeqCst);

        let second = handle
            .get(&addr(), |_| async { Ok(FakeConn::new(closes.clone())) })
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.is_closed());
    }

    #[tokio::test]
    async fn test_close_retires_handle() {
        let handle = ConnHandle::<FakeConn>::new();
        let closes = Arc::new(AtomicUsize::new(0));
        handle
            .get(&addr(), |_| async { Ok(FakeConn::new(closes.clone())) })
            .await
            .unwrap();

        handle.close().await.unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        // Closing again finds nothing to close
        handle.close().await.unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        let err = handle
            .get(&addr(), |_| async { Ok(FakeConn::new(closes.clone())) })
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RaftRpcError::Shutdown));
    }

    #[tokio::test]
    async fn test_close_never_dialed() {
        let handle = ConnHandle::<FakeConn>::new();
        handle.close().await.unwrap();
    }
}
