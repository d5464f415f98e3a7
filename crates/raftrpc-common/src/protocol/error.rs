use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Category of an error reported by a remote peer in an error frame.
///
/// The server picks the kind from the local error that failed the call so the
/// caller can tell an engine rejection from a timeout or a bad credential.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    /// The consensus engine attached an error to its response
    Application,
    /// The engine did not answer within the handshake window
    Timeout,
    /// The request carried a missing or wrong API key
    Unauthorized,
    /// The request could not be decoded or named an unknown method
    BadRequest,
    /// The peer's transport is shutting down
    Unavailable,
    /// Anything else
    Internal,
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RemoteErrorKind::Application => "application",
            RemoteErrorKind::Timeout => "timeout",
            RemoteErrorKind::Unauthorized => "unauthorized",
            RemoteErrorKind::BadRequest => "bad request",
            RemoteErrorKind::Unavailable => "unavailable",
            RemoteErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum RaftRpcError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Failed to dial {addr}: {reason}")]
    Dial { addr: String, reason: String },

    #[error("Remote {kind} error: {message}")]
    Remote {
        kind: RemoteErrorKind,
        message: String,
    },

    #[error("Application error: {0}")]
    Application(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Transport is shut down")]
    Shutdown,

    #[error("error closing connections: {0}")]
    Close(CloseErrors),
}

impl RaftRpcError {
    /// Kind reported to the remote caller when this error fails an inbound call.
    pub fn remote_kind(&self) -> RemoteErrorKind {
        match self {
            RaftRpcError::Application(_) => RemoteErrorKind::Application,
            RaftRpcError::Timeout(_) => RemoteErrorKind::Timeout,
            RaftRpcError::Unauthorized(_) => RemoteErrorKind::Unauthorized,
            RaftRpcError::InvalidRequest(_) | RaftRpcError::JsonSerialization(_) => {
                RemoteErrorKind::BadRequest
            }
            RaftRpcError::Shutdown => RemoteErrorKind::Unavailable,
            RaftRpcError::Remote { kind, .. } => *kind,
            _ => RemoteErrorKind::Internal,
        }
    }

    /// Returns true for errors raised while establishing a connection.
    pub fn is_dial(&self) -> bool {
        matches!(self, RaftRpcError::Dial { .. })
    }
}

/// Every failure collected while closing a set of connections.
#[derive(Debug, Default)]
pub struct CloseErrors {
    errors: Vec<RaftRpcError>,
}

impl CloseErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: RaftRpcError) {
        self.errors.push(err);
    }

    /// Moves every failure from `other` into `self`.
    pub fn append(&mut self, other: CloseErrors) {
        self.errors.extend(other.errors);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn errors(&self) -> &[RaftRpcError] {
        &self.errors
    }

    /// `Ok(())` when nothing failed, otherwise the combined `Close` error.
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(RaftRpcError::Close(self))
        }
    }
}

impl fmt::Display for CloseErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s) occurred", self.errors.len())?;
        for err in &self.errors {
            write!(f, "; {}", err)?;
        }
        Ok(())
    }
}

pub type Result<T> = std::result::Result<T, RaftRpcError>;
