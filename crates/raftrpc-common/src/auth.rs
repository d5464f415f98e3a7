//! Shared-secret authentication for the RPC server.
//!
//! Clients attach an API key to every request (see
//! [`DialOption::ApiKey`](crate::transport::DialOption::ApiKey)); a server
//! configured with a key rejects requests whose key does not match with an
//! `unauthorized` error frame. Without a key configured, every request is
//! accepted.
//!
//! # Example
//!
//! ```no_run
//! use raftrpc_common::auth::AuthConfig;
//!
//! let auth = AuthConfig::with_api_key("cluster-secret");
//! let open = AuthConfig::disabled();
//! ```

use std::fmt;

/// Authentication configuration for an RPC server.
///
/// # Example
///
/// ```
/// use raftrpc_common::auth::AuthConfig;
///
/// let auth = AuthConfig::disabled();
/// assert!(!auth.requires_auth());
///
/// let auth = AuthConfig::with_api_key("secret-key");
/// assert!(auth.requires_auth());
/// assert!(auth.validate_api_key("secret-key"));
/// ```
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    api_key: Option<String>,
}

impl AuthConfig {
    pub fn with_api_key(api_key: impl Into<String>) -> Self {
        Self {
            api_key: Some(api_key.into()),
        }
    }

    pub fn disabled() -> Self {
        Self { api_key: None }
    }

    pub fn requires_auth(&self) -> bool {
        self.api_key.is_some()
    }

    /// Checks a provided key against the configured one.
    ///
    /// Always `true` when authentication is disabled. The comparison takes
    /// the same time wherever the first differing byte is.
    pub fn validate_api_key(&self, provided_key: &str) -> bool {
        match &self.api_key {
            Some(expected_key) => constant_time_eq(expected_key, provided_key),
            None => true,
        }
    }
}

impl fmt::Display for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.api_key {
            Some(_key) => write!(f, "ApiKey(*****)"),
            None => write!(f, "Disabled"),
        }
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (byte_a, byte_b) in a.bytes().zip(b.bytes()) {
        result |= byte_a ^ byte_b;
    }

    result == 0
}
