//! Raft transport over the raftrpc RPC layer.
//!
//! A [`Manager`] provides both halves of a consensus engine's network layer:
//!
//! - [`RaftService`] answers peers' calls. Each call becomes an [`Rpc`] on the
//!   hand-off channel (or goes to the heartbeat handler) and waits for the
//!   engine to respond.
//! - [`RaftTransport`] implements [`Transport`], which the engine uses to call
//!   peers. Connections are dialed on first use, one per peer, and reused.
//!
//! # Example
//!
//! ```rust,no_run
//! use raftrpc_common::transport::TcpServer;
//! use raftrpc_transport::{
//!     Command, CommandResponse, Manager, Options, RequestVoteResponse, Transport,
//! };
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = Manager::new("127.0.0.1:7001", vec![], Options::default());
//! let server = TcpServer::new("127.0.0.1:7001").await?;
//! let serving = manager.clone();
//! tokio::spawn(async move { serving.serve(server).await });
//!
//! let mut inbound = manager.transport().consumer().unwrap();
//! while let Some(rpc) = inbound.recv().await {
//!     let response = match rpc.command() {
//!         Command::RequestVote(req) => Ok(CommandResponse::RequestVote(RequestVoteResponse {
//!             term: req.term,
//!             granted: true,
//!             ..Default::default()
//!         })),
//!         _ => Err("unsupported".to_string()),
//!     };
//!     rpc.respond(response);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod conn;
pub mod convert;
pub mod manager;
pub mod pipeline;
pub mod pool;
pub mod raft_api;
pub mod rpc;
pub mod service;
pub mod types;

pub use config::Options;
pub use conn::{ConnHandle, Connection};
pub use manager::Manager;
pub use pipeline::{AppendPipeline, PipelineResult, MAX_INFLIGHT};
pub use pool::ConnectionPool;
pub use raft_api::{RaftTransport, Transport};
pub use rpc::{Command, CommandResponse, HeartbeatHandler, Rpc, RpcResponse};
pub use service::RaftService;
pub use types::*;

pub use raftrpc_common::protocol::error::{RaftRpcError, RemoteErrorKind, Result};
pub use raftrpc_common::transport::DialOption;
