//! raftrpc Common Types and Transport
//!
//! This crate provides the general-purpose RPC layer the Raft transport runs
//! on: request/response frames, the Raft wire messages, a JSON codec, a
//! multiplexed TCP client channel, an ordered stream mode and an async TCP
//! server.
//!
//! # Architecture
//!
//! - **Transport**: TCP, one long-lived connection per peer
//! - **Serialization**: JSON
//! - **Message Format**: `[4-byte length prefix as u32 big-endian] + [JSON data]`
//! - **Max Message Size**: 100 MB
//!
//! # Components
//!
//! - [`protocol`] - Frames, Raft wire messages and the error type
//! - [`transport`] - Codec, dial options, client channel and server
//! - [`auth`] - API key checks on the server side
//!
//! # Example
//!
//! ```
//! use raftrpc_common::{RaftMethod, Request, Response};
//! use serde_json::json;
//!
//! let request = Request::new(RaftMethod::TimeoutNow.as_str(), json!({"header": {}}))
//!     .with_timeout(500);
//! let response = Response::success(request.id, json!({"header": {}}));
//! assert!(response.is_success());
//! ```

pub mod auth;
pub mod protocol;
pub mod transport;

pub use protocol::*;
