//! # raftrpc CLI
//!
//! Command-line tools for the raftrpc transport:
//!
//! - `raftrpc serve`: run a transport answered by a [`StubEngine`](engine::StubEngine)
//! - `raftrpc vote`, `raftrpc heartbeat`, `raftrpc timeout-now`: issue one
//!   RPC to a peer and print the reply as JSON

pub mod engine;
