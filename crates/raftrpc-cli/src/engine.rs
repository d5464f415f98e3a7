//! A minimal stand-in for a consensus engine.
//!
//! It keeps a current term, a vote and the highest log index it has seen, and
//! answers every RPC from that state. Nothing is persisted and no log is
//! stored; it exists so a transport can be exercised from the command line.

use raftrpc_transport::{
    AppendEntriesResponse, Command, CommandResponse, InstallSnapshotResponse, RequestPreVoteResponse,
    RequestVoteResponse, Rpc, RpcHeader, RpcResponse, ServerAddress, ServerId, TimeoutNowResponse,
};
use tokio::sync::mpsc;

pub const PROTOCOL_VERSION: i32 = 3;

pub struct StubEngine {
    id: ServerId,
    addr: ServerAddress,
    current_term: u64,
    voted_for: Option<ServerId>,
    last_log: u64,
}

impl StubEngine {
    pub fn new(id: ServerId, addr: ServerAddress) -> Self {
        Self {
            id,
            addr,
            current_term: 0,
            voted_for: None,
            last_log: 0,
        }
    }

    pub fn current_term(&self) -> u64 {
        self.current_term
    }

    pub fn last_log(&self) -> u64 {
        self.last_log
    }

    fn header(&self) -> RpcHeader {
        RpcHeader {
            protocol_version: PROTOCOL_VERSION,
            id: self.id.clone(),
            addr: self.addr.clone(),
        }
    }

    fn observe_term(&mut self, term: u64) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
        }
    }

    /// Computes the response to one command and updates the state.
    pub fn answer(&mut self, command: &Command) -> RpcResponse {
        let response = match command {
            Command::AppendEntries(req) => {
                let success = req.term >= self.current_term;
                if success {
                    self.observe_term(req.term);
                    if let Some(last) = req.entries.last() {
                        self.last_log = self.last_log.max(last.index);
                    }
                }
                CommandResponse::AppendEntries(AppendEntriesResponse {
                    header: self.header(),
                    term: self.current_term,
                    last_log: self.last_log,
                    success,
                    no_retry_backoff: false,
                })
            }
            Command::RequestVote(req) => {
                self.observe_term(req.term);
                let candidate = &req.header.id;
                let granted = req.term == self.current_term
                    && req.last_log_index >= self.last_log
                    && self.voted_for.as_ref().map_or(true, |v| v == candidate);
                if granted {
                    self.voted_for = Some(candidate.clone());
                }
                tracing::info!(candidate = %candidate, term = req.term, granted, "Vote requested");
                CommandResponse::RequestVote(RequestVoteResponse {
                    header: self.header(),
                    term: self.current_term,
                    granted,
                })
            }
            Command::RequestPreVote(req) => CommandResponse::RequestPreVote(RequestPreVoteResponse {
                header: self.header(),
                term: self.current_term,
                granted: req.term >= self.current_term && req.last_log_index >= self.last_log,
            }),
            Command::InstallSnapshot { request, data } => {
                let success = request.term >= self.current_term;
                if success {
                    self.observe_term(request.term);
                    self.last_log = request.last_log_index;
                }
                tracing::info!(bytes = data.len(), index = request.last_log_index, success, "Snapshot offered");
                CommandResponse::InstallSnapshot(InstallSnapshotResponse {
                    header: self.header(),
                    term: self.current_term,
                    success,
                })
            }
            Command::TimeoutNow(req) => {
                tracing::info!(from = %req.header.id, "Asked to start an election");
                CommandResponse::TimeoutNow(TimeoutNowResponse {
                    header: self.header(),
                })
            }
        };
        Ok(response)
    }

    /// Answers inbound RPCs until the channel closes.
    pub async fn run(mut self, mut inbound: mpsc::UnboundedReceiver<Rpc>) {
        while let Some(rpc) = inbound.recv().await {
            let response = self.answer(rpc.command());
            rpc.respond(response);
        }
        tracing::debug!("Inbound channel closed, engine stopping");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raftrpc_transport::{AppendEntriesRequest, Log, RequestVoteRequest};

    fn engine() -> StubEngine {
        StubEngine::new(ServerId::new("n1"), ServerAddress::new("127.0.0.1:7001"))
    }

    fn vote(candidate: &str, term: u64) -> Command {
        Command::RequestVote(RequestVoteRequest {
            header: RpcHeader {
                id: candidate.into(),
                ..Default::default()
            },
            term,
            ..Default::default()
        })
    }

    fn granted(response: RpcResponse) -> bool {
        match response {
            Ok(CommandResponse::RequestVote(r)) => r.granted,
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn test_one_vote_per_term() {
        let mut engine = engine();
        assert!(granted(engine.answer(&vote("a", 1))));
        assert!(granted(engine.answer(&vote("a", 1))));
        assert!(!granted(engine.answer(&vote("b", 1))));
        assert!(granted(engine.answer(&vote("b", 2))));
        assert_eq!(engine.current_term(), 2);
    }

    #[test]
    fn test_stale_vote_rejected() {
        let mut engine = engine();
        engine.answer(&vote("a", 5));
        assert!(!granted(engine.answer(&vote("b", 4))));
    }

    #[test]
    fn test_append_entries_tracks_log() {
        let mut engine = engine();
        let append = Command::AppendEntries(AppendEntriesRequest {
            term: 3,
            entries: vec![
                Log {
                    index: 1,
                    ..Default::default()
                },
                Log {
                    index: 2,
                    ..Default::default()
                },
            ],
            ..Default::default()
        });
        match engine.answer(&append) {
            Ok(CommandResponse::AppendEntries(r)) => {
                assert!(r.success);
                assert_eq!(r.last_log, 2);
                assert_eq!(r.term, 3);
            }
            other => panic!("unexpected response {:?}", other),
        }

        let stale = Command::AppendEntries(AppendEntriesRequest {
            term: 2,
            ..Default::default()
        });
        match engine.answer(&stale) {
            Ok(CommandResponse::AppendEntries(r)) => assert!(!r.success),
            other => panic!("unexpected response {:?}", other),
        }
        assert_eq!(engine.last_log(), 2);
    }
}
