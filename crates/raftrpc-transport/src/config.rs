use std::fmt;
use std::time::Duration;

use raftrpc_common::auth::AuthConfig;

use crate::rpc::HeartbeatHandler;

/// Optional settings for a [`Manager`](crate::Manager).
///
/// The defaults are no heartbeat fast path, no deadline on outbound
/// heartbeats, no bound on how long an inbound call waits for the engine,
/// and no credential check on inbound calls.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use raftrpc_transport::Options;
///
/// let options = Options::new()
///     .with_heartbeat_timeout(Duration::from_millis(100))
///     .with_handshake_timeout(Duration::from_secs(5));
/// ```
#[derive(Clone, Default)]
pub struct Options {
    pub(crate) heartbeat_handler: Option<HeartbeatHandler>,
    pub(crate) heartbeat_timeout: Option<Duration>,
    pub(crate) handshake_timeout: Option<Duration>,
    pub(crate) auth: AuthConfig,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deadline applied to outbound heartbeat-shaped append-entries calls.
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(timeout);
        self
    }

    /// How long an inbound call waits for the engine to respond.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    /// Installs the heartbeat fast path at construction.
    pub fn with_heartbeat_handler(mut self, handler: HeartbeatHandler) -> Self {
        self.heartbeat_handler = Some(handler);
        self
    }

    /// Credentials inbound calls must carry.
    pub fn with_auth(mut self, auth: AuthConfig) -> Self {
        self.auth = auth;
        self
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("heartbeat_handler", &self.heartbeat_handler.is_some())
            .field("heartbeat_timeout", &self.heartbeat_timeout)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("auth", &self.auth.requires_auth())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::rpc::Rpc;

    #[test]
    fn test_defaults() {
        let options = Options::default();
        assert!(options.heartbeat_handler.is_none());
        assert!(options.heartbeat_timeout.is_none());
        assert!(options.handshake_timeout.is_none());
        assert!(!options.auth.requires_auth());
    }

    #[test]
    fn test_builder() {
        let options = Options::new()
            .with_heartbeat_timeout(Duration::from_millis(50))
            .with_handshake_timeout(Duration::from_secs(1))
            .with_heartbeat_handler(Arc::new(|_rpc: Rpc| {}))
            .with_auth(AuthConfig::with_api_key("k"));

        assert_eq!(options.heartbeat_timeout, Some(Duration::from_millis(50)));
        assert_eq!(options.handshake_timeout, Some(Duration::from_secs(1)));
        assert!(options.heartbeat_handler.is_some());
        assert!(options.auth.requires_auth());

        let debug = format!("{:?}", options);
        assert!(debug.contains("heartbeat_handler: true"));
    }
}
