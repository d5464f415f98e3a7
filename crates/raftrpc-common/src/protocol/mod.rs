pub mod error;
pub mod raft;
pub mod requests;
pub mod responses;


pub use error::{CloseErrors, RaftRpcError, RemoteErrorKind, Result};
pub use raft::RaftMethod;
pub use requests::{MethodName, Request, RequestId, RpcArgs};
pub use responses::{RemoteError, Response, RpcResult};
