//! Connection-level options applied to every outbound dial.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::protocol::Request;

/// Default timeout for establishing a TCP connection (5 seconds)
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Hook run on every outgoing request before it is written to the wire.
pub type Interceptor = Arc<dyn Fn(&mut Request) + Send + Sync>;

/// A single dial option.
///
/// Options are applied in order. For scalar settings the last one wins;
/// interceptors accumulate and run in the order they were given.
#[derive(Clone)]
pub enum DialOption {
    /// Upper bound on establishing the TCP connection
    ConnectTimeout(Duration),
    /// Set `TCP_NODELAY` on the socket
    NoDelay(bool),
    /// Set `SO_KEEPALIVE` on the socket
    Keepalive(bool),
    /// Credential attached to every request
    ApiKey(String),
    /// Request hook
    Interceptor(Interceptor),
}

impl fmt::Debug for DialOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialOption::ConnectTimeout(d) => f.debug_tuple("ConnectTimeout").field(d).finish(),
            DialOption::NoDelay(b) => f.debug_tuple("NoDelay").field(b).finish(),
            DialOption::Keepalive(b) => f.debug_tuple("Keepalive").field(b).finish(),
            DialOption::ApiKey(_) => f.write_str("ApiKey(*****)"),
            DialOption::Interceptor(_) => f.write_str("Interceptor(..)"),
        }
    }
}

/// Resolved form of a list of [`DialOption`]s.
///
/// # Example
///
/// ```
/// use raftrpc_common::transport::{DialConfig, DialOption};
/// use std::time::Duration;
///
/// let config = DialConfig::from_options(&[
///     DialOption::ConnectTimeout(Duration::from_secs(1)),
///     DialOption::NoDelay(true),
///     DialOption::ApiKey("secret".into()),
/// ]);
/// assert_eq!(config.connect_timeout, Duration::from_secs(1));
/// assert!(config.nodelay);
/// ```
#[derive(Clone)]
pub struct DialConfig {
    pub connect_timeout: Duration,
    pub nodelay: bool,
    pub keepalive: bool,
    pub api_key: Option<String>,
    interceptors: Vec<Interceptor>,
}

impl Default for DialConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            nodelay: true,
            keepalive: false,
            api_key: None,
            interceptors: Vec::new(),
        }
    }
}

impl fmt::Debug for DialConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialConfig")
            .field("connect_timeout", &self.connect_timeout)
            .field("nodelay", &self.nodelay)
            .field("keepalive", &self.keepalive)
            .field("api_key", &self.api_key.as_ref().map(|_| "*****"))
            .field("interceptors", &self.interceptors.len())
            .finish()
    }
}

impl DialConfig {
    pub fn from_options(options: &[DialOption]) -> Self {
        let mut config = Self::default();
        for option in options {
            match option {
                DialOption::ConnectTimeout(d) => config.connect_timeout = *d,
                DialOption::NoDelay(b) => config.nodelay = *b,
                DialOption::Keepalive(b) => config.keepalive = *b,
                DialOption::ApiKey(key) => config.api_key = Some(key.clone()),
                DialOption::Interceptor(i) => config.interceptors.push(i.clone()),
            }
        }
        config
    }

    /// Attaches the credential, then runs the interceptors in order.
    pub fn prepare(&self, request: &mut Request) {
        if let Some(key) = &self.api_key {
            request.api_key = Some(key.clone());
        }
        for interceptor in &self.interceptors {
            interceptor(request);
        }
    }
}
