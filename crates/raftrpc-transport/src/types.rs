//! Engine-facing Raft message types.
//!
//! These are what the consensus engine produces and consumes. They are
//! converted to the wire messages in `raftrpc_common::protocol::raft` by
//! [`convert`](crate::convert).

use std::fmt;
use std::time::SystemTime;

/// Stable identity of a server, independent of its address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerId(pub String);

/// Network address at which a server can be reached (`host:port`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerAddress(pub String);

macro_rules! string_newtype {
    ($name:ident) => {
        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_newtype!(ServerId);
string_newtype!(ServerAddress);

/// Header common to every Raft RPC.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RpcHeader {
    pub protocol_version: i32,
    /// Id of the sending server
    pub id: ServerId,
    /// Address of the sending server
    pub addr: ServerAddress,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogType {
    #[default]
    Command,
    Noop,
    AddPeerDeprecated,
    RemovePeerDeprecated,
    Barrier,
    Configuration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Log {
    pub index: u64,
    pub term: u64,
    pub log_type: LogType,
    pub data: Vec<u8>,
    pub extensions: Vec<u8>,
    pub appended_at: Option<SystemTime>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppendEntriesRequest {
    pub header: RpcHeader,
    pub term: u64,
    pub prev_log_entry: u64,
    pub prev_log_term: u64,
    pub entries: Vec<Log>,
    pub leader_commit_index: u64,
}

impl AppendEntriesRequest {
    /// True for the empty append-entries a leader sends to assert liveness.
    ///
    /// Shape rule: a known term and leader address, no previous entry, no
    /// entries and no commit index.
    pub fn is_heartbeat(&self) -> bool {
        self.term != 0
            && !self.header.addr.is_empty()
            && self.prev_log_entry == 0
            && self.prev_log_term == 0
            && self.entries.is_empty()
            && self.leader_commit_index == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppendEntriesResponse {
    pub header: RpcHeader,
    pub term: u64,
    pub last_log: u64,
    pub success: bool,
    pub no_retry_backoff: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestVoteRequest {
    pub header: RpcHeader,
    pub term: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
    pub leadership_transfer: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestVoteResponse {
    pub header: RpcHeader,
    pub term: u64,
    pub granted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestPreVoteRequest {
    pub header: RpcHeader,
    pub term: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestPreVoteResponse {
    pub header: RpcHeader,
    pub term: u64,
    pub granted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallSnapshotRequest {
    pub header: RpcHeader,
    pub snapshot_version: i32,
    pub term: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
    pub configuration: Vec<u8>,
    pub configuration_index: u64,
    /// Size of the snapshot data in bytes
    pub size: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallSnapshotResponse {
    pub header: RpcHeader,
    pub term: u64,
    pub success: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimeoutNowRequest {
    pub header: RpcHeader,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimeoutNowResponse {
    pub header: RpcHeader,
}
