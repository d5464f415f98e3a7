//! Wire messages for the Raft service.
//!
//! These are the encoded forms exchanged between peers. They deliberately
//! stay close to a schema definition: plain fields, integer codes and
//! explicit timestamps. Engine-facing types live in `raftrpc-transport` and
//! are converted to and from these at the edge.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::error::RaftRpcError;

/// Remote methods exposed by the Raft service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RaftMethod {
    AppendEntries,
    AppendEntriesPipeline,
    RequestVote,
    RequestPreVote,
    InstallSnapshot,
    TimeoutNow,
}

impl RaftMethod {
    pub const ALL: [RaftMethod; 6] = [
        RaftMethod::AppendEntries,
        RaftMethod::AppendEntriesPipeline,
        RaftMethod::RequestVote,
        RaftMethod::RequestPreVote,
        RaftMethod::InstallSnapshot,
        RaftMethod::TimeoutNow,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RaftMethod::AppendEntries => "raft.AppendEntries",
            RaftMethod::AppendEntriesPipeline => "raft.AppendEntriesPipeline",
            RaftMethod::RequestVote => "raft.RequestVote",
            RaftMethod::RequestPreVote => "raft.RequestPreVote",
            RaftMethod::InstallSnapshot => "raft.InstallSnapshot",
            RaftMethod::TimeoutNow => "raft.TimeoutNow",
        }
    }
}

impl fmt::Display for RaftMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RaftMethod {
    type Err = RaftRpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RaftMethod::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| RaftRpcError::InvalidRequest(format!("Unknown method: {}", s)))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RpcHeader {
    pub protocol_version: i32,
    pub id: String,
    pub addr: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: u32,
}

/// Log entry type codes.
pub mod log_type {
    pub const COMMAND: i32 = 0;
    pub const NOOP: i32 = 1;
    pub const ADD_PEER_DEPRECATED: i32 = 2;
    pub const REMOVE_PEER_DEPRECATED: i32 = 3;
    pub const BARRIER: i32 = 4;
    pub const CONFIGURATION: i32 = 5;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Log {
    pub index: u64,
    pub term: u64,
    #[serde(rename = "type")]
    pub log_type: i32,
    #[serde(default)]
    pub data: Vec<u8>,
    #[serde(default)]
    pub extensions: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appended_at: Option<Timestamp>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppendEntriesRequest {
    pub header: RpcHeader,
    pub term: u64,
    pub prev_log_entry: u64,
    pub prev_log_term: u64,
    #[serde(default)]
    pub entries: Vec<Log>,
    pub leader_commit_index: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppendEntriesResponse {
    pub header: RpcHeader,
    pub term: u64,
    pub last_log: u64,
    pub success: bool,
    pub no_retry_backoff: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RequestVoteRequest {
    pub header: RpcHeader,
    pub term: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
    pub leadership_transfer: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RequestVoteResponse {
    pub header: RpcHeader,
    pub term: u64,
    pub granted: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RequestPreVoteRequest {
    pub header: RpcHeader,
    pub term: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RequestPreVoteResponse {
    pub header: RpcHeader,
    pub term: u64,
    pub granted: bool,
}

/// Snapshot metadata followed by the snapshot bytes in the same frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InstallSnapshotRequest {
    pub header: RpcHeader,
    pub snapshot_version: i32,
    pub term: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
    #[serde(default)]
    pub configuration: Vec<u8>,
    pub configuration_index: u64,
    pub size: i64,
    #[serde(default)]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InstallSnapshotResponse {
    pub header: RpcHeader,
    pub term: u64,
    pub success: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TimeoutNowRequest {
    pub header: RpcHeader,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TimeoutNowResponse {
    pub header: RpcHeader,
}
