//! Conversions between engine-facing types and wire messages.
//!
//! Every field is carried in both directions. The only fallible direction is
//! wire to engine for anything containing log entries, since an unknown log
//! type code or an out-of-range timestamp cannot be represented.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use raftrpc_common::protocol::error::{RaftRpcError, Result};
use raftrpc_common::protocol::raft::{self as wire, log_type};

use crate::types::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    Log, LogType, RequestPreVoteRequest, RequestPreVoteResponse, RequestVoteRequest,
    RequestVoteResponse, RpcHeader, TimeoutNowRequest, TimeoutNowResponse,
};

impl From<RpcHeader> for wire::RpcHeader {
    fn from(h: RpcHeader) -> Self {
        wire::RpcHeader {
            protocol_version: h.protocol_version,
            id: h.id.0,
            addr: h.addr.0,
        }
    }
}

impl From<wire::RpcHeader> for RpcHeader {
    fn from(h: wire::RpcHeader) -> Self {
        RpcHeader {
            protocol_version: h.protocol_version,
            id: h.id.into(),
            addr: h.addr.into(),
        }
    }
}

impl LogType {
    pub fn code(&self) -> i32 {
        match self {
            LogType::Command => log_type::COMMAND,
            LogType::Noop => log_type::NOOP,
            LogType::AddPeerDeprecated => log_type::ADD_PEER_DEPRECATED,
            LogType::RemovePeerDeprecated => log_type::REMOVE_PEER_DEPRECATED,
            LogType::Barrier => log_type::BARRIER,
            LogType::Configuration => log_type::CONFIGURATION,
        }
    }
}

impl TryFrom<i32> for LogType {
    type Error = RaftRpcError;

    fn try_from(code: i32) -> Result<Self> {
        match code {
            log_type::COMMAND => Ok(LogType::Command),
            log_type::NOOP => Ok(LogType::Noop),
            log_type::ADD_PEER_DEPRECATED => Ok(LogType::AddPeerDeprecated),
            log_type::REMOVE_PEER_DEPRECATED => Ok(LogType::RemovePeerDeprecated),
            log_type::BARRIER => Ok(LogType::Barrier),
            log_type::CONFIGURATION => Ok(LogType::Configuration),
            other => Err(RaftRpcError::InvalidRequest(format!(
                "Unknown log type: {}",
                other
            ))),
        }
    }
}

/// Seconds/nanos since the epoch, nanos always in `0..1_000_000_000`.
pub(crate) fn timestamp_from_system_time(t: SystemTime) -> wire::Timestamp {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => wire::Timestamp {
            seconds: d.as_secs() as i64,
            nanos: d.subsec_nanos(),
        },
        Err(e) => {
            let d = e.duration();
            if d.subsec_nanos() == 0 {
                wire::Timestamp {
                    seconds: -(d.as_secs() as i64),
                    nanos: 0,
                }
            } else {
                wire::Timestamp {
                    seconds: -(d.as_secs() as i64) - 1,
                    nanos: 1_000_000_000 - d.subsec_nanos(),
                }
            }
        }
    }
}

/// # Errors
///
/// Rejects nanos outside `0..1_000_000_000` and instants the platform clock
/// cannot represent.
pub(crate) fn system_time_from_timestamp(ts: wire::Timestamp) -> Result<SystemTime> {
    if ts.nanos >= 1_000_000_000 {
        return Err(RaftRpcError::InvalidRequest(format!(
            "Timestamp nanos out of range: {}",
            ts.nanos
        )));
    }

    let secs = Duration::from_secs(ts.seconds.unsigned_abs());
    let whole = if ts.seconds >= 0 {
        UNIX_EPOCH.checked_add(secs)
    } else {
        UNIX_EPOCH.checked_sub(secs)
    };
    whole
        .and_then(|t| t.checked_add(Duration::from_nanos(u64::from(ts.nanos))))
        .ok_or_else(|| {
            RaftRpcError::InvalidRequest(format!(
                "Timestamp out of range: {}s {}ns",
                ts.seconds, ts.nanos
            ))
        })
}

impl From<Log> for wire::Log {
    fn from(l: Log) -> Self {
        wire::Log {
            index: l.index,
            term: l.term,
            log_type: l.log_type.code(),
            data: l.data,
            extensions: l.extensions,
            appended_at: l.appended_at.map(timestamp_from_system_time),
        }
    }
}

impl TryFrom<wire::Log> for Log {
    type Error = RaftRpcError;

    fn try_from(l: wire::Log) -> Result<Self> {
        Ok(Log {
            index: l.index,
            term: l.term,
            log_type: LogType::try_from(l.log_type)?,
            data: l.data,
            extensions: l.extensions,
            appended_at: l.appended_at.map(system_time_from_timestamp).transpose()?,
        })
    }
}

impl From<AppendEntriesRequest> for wire::AppendEntriesRequest {
    fn from(r: AppendEntriesRequest) -> Self {
        wire::AppendEntriesRequest {
            header: r.header.into(),
            term: r.term,
            prev_log_entry: r.prev_log_entry,
            prev_log_term: r.prev_log_term,
            entries: r.entries.into_iter().map(Into::into).collect(),
            leader_commit_index: r.leader_commit_index,
        }
    }
}

impl TryFrom<wire::AppendEntriesRequest> for AppendEntriesRequest {
    type Error = RaftRpcError;

    fn try_from(r: wire::AppendEntriesRequest) -> Result<Self> {
        Ok(AppendEntriesRequest {
            header: r.header.into(),
            term: r.term,
            prev_log_entry: r.prev_log_entry,
            prev_log_term: r.prev_log_term,
            entries: r
                .entries
                .into_iter()
                .map(Log::try_from)
                .collect::<Result<Vec<_>>>()?,
            leader_commit_index: r.leader_commit_index,
        })
    }
}

impl From<AppendEntriesResponse> for wire::AppendEntriesResponse {
    fn from(r: AppendEntriesResponse) -> Self {
        wire::AppendEntriesResponse {
            header: r.header.into(),
            term: r.term,
            last_log: r.last_log,
            success: r.success,
            no_retry_backoff: r.no_retry_backoff,
        }
    }
}

impl From<wire::AppendEntriesResponse> for AppendEntriesResponse {
    fn from(r: wire::AppendEntriesResponse) -> Self {
        AppendEntriesResponse {
            header: r.header.into(),
            term: r.term,
            last_log: r.last_log,
            success: r.success,
            no_retry_backoff: r.no_retry_backoff,
        }
    }
}

impl From<RequestVoteRequest> for wire::RequestVoteRequest {
    fn from(r: RequestVoteRequest) -> Self {
        wire::RequestVoteRequest {
            header: r.header.into(),
            term: r.term,
            last_log_index: r.last_log_index,
            last_log_term: r.last_log_term,
            leadership_transfer: r.leadership_transfer,
        }
    }
}

impl From<wire::RequestVoteRequest> for RequestVoteRequest {
    fn from(r: wire::RequestVoteRequest) -> Self {
        RequestVoteRequest {
            header: r.header.into(),
            term: r.term,
            last_log_index: r.last_log_index,
            last_log_term: r.last_log_term,
            leadership_transfer: r.leadership_transfer,
        }
    }
}

impl From<RequestVoteResponse> for wire::RequestVoteResponse {
    fn from(r: RequestVoteResponse) -> Self {
        wire::RequestVoteResponse {
            header: r.header.into(),
            term: r.term,
            granted: r.granted,
        }
    }
}

impl From<wire::RequestVoteResponse> for RequestVoteResponse {
    fn from(r: wire::RequestVoteResponse) -> Self {
        RequestVoteResponse {
            header: r.header.into(),
            term: r.term,
            granted: r.granted,
        }
    }
}

impl From<RequestPreVoteRequest> for wire::RequestPreVoteRequest {
    fn from(r: RequestPreVoteRequest) -> Self {
        wire::RequestPreVoteRequest {
            header: r.header.into(),
            term: r.term,
            last_log_index: r.last_log_index,
            last_log_term: r.last_log_term,
        }
    }
}

impl From<wire::RequestPreVoteRequest> for RequestPreVoteRequest {
    fn from(r: wire::RequestPreVoteRequest) -> Self {
        RequestPreVoteRequest {
            header: r.header.into(),
            term: r.term,
            last_log_index: r.last_log_index,
            last_log_term: r.last_log_term,
        }
    }
}

impl From<RequestPreVoteResponse> for wire::RequestPreVoteResponse {
    fn from(r: RequestPreVoteResponse) -> Self {
        wire::RequestPreVoteResponse {
            header: r.header.into(),
            term: r.term,
            granted: r.granted,
        }
    }
}

impl From<wire::RequestPreVoteResponse> for RequestPreVoteResponse {
    fn from(r: wire::RequestPreVoteResponse) -> Self {
        RequestPreVoteResponse {
            header: r.header.into(),
            term: r.term,
            granted: r.granted,
        }
    }
}

/// Snapshot metadata and data travel in one wire message.
pub(crate) fn install_snapshot_to_wire(
    r: InstallSnapshotRequest,
    data: Vec<u8>,
) -> wire::InstallSnapshotRequest {
    wire::InstallSnapshotRequest {
        header: r.header.into(),
        snapshot_version: r.snapshot_version,
        term: r.term,
        last_log_index: r.last_log_index,
        last_log_term: r.last_log_term,
        configuration: r.configuration,
        configuration_index: r.configuration_index,
        size: r.size,
        data,
    }
}

/// Splits a wire snapshot message into metadata and data.
///
/// # Errors
///
/// Fails when the announced size does not match the bytes received.
pub(crate) fn install_snapshot_from_wire(
    r: wire::InstallSnapshotRequest,
) -> Result<(InstallSnapshotRequest, Vec<u8>)> {
    if r.size >= 0 && r.size as usize != r.data.len() {
        return Err(RaftRpcError::InvalidRequest(format!(
            "Snapshot size mismatch: header says {} bytes, received {}",
            r.size,
            r.data.len()
        )));
    }

    let request = InstallSnapshotRequest {
        header: r.header.into(),
        snapshot_version: r.snapshot_version,
        term: r.term,
        last_log_index: r.last_log_index,
        last_log_term: r.last_log_term,
        configuration: r.configuration,
        configuration_index: r.configuration_index,
        size: r.size,
    };
    Ok((request, r.data))
}

impl From<InstallSnapshotResponse> for wire::InstallSnapshotResponse {
    fn from(r: InstallSnapshotResponse) -> Self {
        wire::InstallSnapshotResponse {
            header: r.header.into(),
            term: r.term,
            success: r.success,
        }
    }
}

impl From<wire::InstallSnapshotResponse> for InstallSnapshotResponse {
    fn from(r: wire::InstallSnapshotResponse) -> Self {
        InstallSnapshotResponse {
            header: r.header.into(),
            term: r.term,
            success: r.success,
        }
    }
}

impl From<TimeoutNowRequest> for wire::TimeoutNowRequest {
    fn from(r: TimeoutNowRequest) -> Self {
        wire::TimeoutNowRequest {
            header: r.header.into(),
        }
    }
}

impl From<wire::TimeoutNowRequest> for TimeoutNowRequest {
    fn from(r: wire::TimeoutNowRequest) -> Self {
        TimeoutNowRequest {
            header: r.header.into(),
        }
    }
}

impl From<TimeoutNowResponse> for wire::TimeoutNowResponse {
    fn from(r: TimeoutNowResponse) -> Self {
        wire::TimeoutNowResponse {
            header: r.header.into(),
        }
    }
}

impl From<wire::TimeoutNowResponse> for TimeoutNowResponse {
    fn from(r: wire::TimeoutNowResponse) -> Self {
        TimeoutNowResponse {
            header: r.header.into(),
        }
    }
}
