//! Response frames.
//!
//! Every [`Request`](super::Request) is answered by exactly one `Response`
//! carrying the same id. Multiplexed channels use the id to route the
//! response back to the waiting caller.

use serde::{Deserialize, Serialize};

use super::error::{RaftRpcError, RemoteErrorKind, Result};
use super::RequestId;

/// RPC method result (JSON value)
pub type RpcResult = serde_json::Value;

/// Error carried by a failed response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

/// A response frame returned by a server for one request.
///
/// Exactly one of `result` and `error` is set.
///
/// # Example
///
/// ```
/// use raftrpc_common::protocol::responses::Response;
/// use raftrpc_common::protocol::RemoteErrorKind;
/// use serde_json::json;
///
/// let ok = Response::success(7, json!({"granted": true}));
/// assert!(ok.is_success());
///
/// let failed = Response::error(7, RemoteErrorKind::Timeout, "no answer from engine");
/// assert!(!failed.is_success());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    /// Request identifier this response corresponds to
    pub id: RequestId,
    /// Result value (present on success)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<RpcResult>,
    /// Error (present on failure)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

impl Response {
    pub fn success(id: RequestId, result: RpcResult) -> Self {
        Response {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: RequestId, kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Response {
            id,
            result: None,
            error: Some(RemoteError {
                kind,
                message: message.into(),
            }),
        }
    }

    /// Builds the error frame sent back when handling a request failed locally.
    pub fn from_error(id: RequestId, err: &RaftRpcError) -> Self {
        let message = match err {
            // Forward the peer's message unchanged instead of nesting prefixes
            RaftRpcError::Remote { message, .. } => message.clone(),
            RaftRpcError::Application(message) => message.clone(),
            other => other.to_string(),
        };
        Self::error(id, err.remote_kind(), message)
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Converts the frame into the caller-facing result.
    ///
    /// # Errors
    ///
    /// - [`RaftRpcError::Remote`] when the peer returned an error frame
    /// - [`RaftRpcError::InvalidResponse`] when a success frame has no result
    pub fn into_result(self) -> Result<RpcResult> {
        if let Some(err) = self.error {
            return Err(RaftRpcError::Remote {
                kind: err.kind,
                message: err.message,
            });
        }
        self.result.ok_or_else(|| {
            RaftRpcError::InvalidResponse("Missing result in success response".to_string())
        })
    }
}
