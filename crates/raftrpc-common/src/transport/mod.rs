//! Transport layer for the framed RPC protocol.
//!
//! - **Wire Format**: `[4-byte length prefix as u32 big-endian] + [JSON data]`
//! - **Client**: [`RpcChannel`] multiplexes concurrent calls over one TCP
//!   connection; [`open_stream`] opens an ordered stream on its own connection
//! - **Server**: [`TcpServer`] dispatches each frame to an async handler
//! - **Dialing**: [`DialOption`] / [`DialConfig`] apply the same connection
//!   options to every dial
//!
//! Frames larger than 100 MB are rejected on both ends.
//!
//! # Example
//!
//! ```no_run
//! use raftrpc_common::transport::{DialConfig, RpcChannel, TcpServer};
//! use raftrpc_common::protocol::{Request, Response};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let server = TcpServer::new("127.0.0.1:0").await?;
//! let addr = server.local_addr()?.to_string();
//! tokio::spawn(async move {
//!     server
//!         .run_with_handler(|req: Request| async move { Ok(Response::success(req.id, req.args)) })
//!         .await
//! });
//!
//! let channel = RpcChannel::connect(&addr, &DialConfig::default()).await?;
//! let echoed = channel.call(Request::new("echo", json!({"n": 1}))).await?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod dial;
pub mod tcp;
pub mod tcp_server;

pub use codec::{read_frame, write_frame, JsonCodec, MAX_MESSAGE_SIZE};
pub use dial::{DialConfig, DialOption, Interceptor, DEFAULT_CONNECT_TIMEOUT};
pub use tcp::{dial, open_stream, RpcChannel, StreamReceiver, StreamSender};
pub use tcp_server::TcpServer;
