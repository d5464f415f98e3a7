//! # raftrpc CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Run a node answered by the stub engine
//! raftrpc serve --id n1 --bind 127.0.0.1:7001
//!
//! # Ask a peer for its vote (outputs raw JSON)
//! raftrpc vote 127.0.0.1:7001 --term 5
//!
//! # Send a heartbeat
//! raftrpc heartbeat 127.0.0.1:7001 --term 5
//!
//! # Tell a peer to start an election
//! raftrpc timeout-now 127.0.0.1:7001
//! ```

use std::time::Duration;

use anyhow::Result;
use argh::FromArgs;
use raftrpc_cli::engine::{StubEngine, PROTOCOL_VERSION};
use raftrpc_common::auth::AuthConfig;
use raftrpc_common::protocol::raft as wire;
use raftrpc_common::transport::{DialOption, TcpServer};
use raftrpc_transport::{
    AppendEntriesRequest, AppendEntriesResponse, Command, CommandResponse, Manager, Options,
    RequestVoteRequest, Rpc, RpcHeader, ServerAddress, ServerId, TimeoutNowRequest, Transport,
};

#[derive(FromArgs)]
/// raftrpc - Raft transport over framed RPC
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    Vote(VoteArgs),
    Heartbeat(HeartbeatArgs),
    TimeoutNow(TimeoutNowArgs),
}

/// Arguments for running a node.
///
/// The node serves the Raft service on `bind` and answers every call with a
/// stub engine that tracks terms and votes but stores nothing.
#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// run a transport with a stub engine
struct ServeArgs {
    /// server id of this node
    #[argh(option)]
    id: String,

    /// address to listen on
    #[argh(option, short = 'b', default = "\"127.0.0.1:7000\".into()")]
    bind: String,

    /// address peers should use to reach this node; defaults to the bound address
    #[argh(option)]
    advertise: Option<String>,

    /// optional API key inbound calls must carry
    #[argh(option, long = "api-key")]
    api_key: Option<String>,

    /// how long an inbound call waits for the engine, in milliseconds
    #[argh(option, long = "handshake-timeout-ms", default = "5000")]
    handshake_timeout_ms: u64,

    /// answer heartbeats on the fast path instead of the engine's queue
    #[argh(switch, long = "heartbeat-fast-path")]
    heartbeat_fast_path: bool,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "vote")]
/// ask a peer for its vote
struct VoteArgs {
    /// address of the peer
    #[argh(positional)]
    target: String,

    /// term of the election
    #[argh(option)]
    term: u64,

    /// index of the candidate's last log entry
    #[argh(option, long = "last-log-index", default = "0")]
    last_log_index: u64,

    /// term of the candidate's last log entry
    #[argh(option, long = "last-log-term", default = "0")]
    last_log_term: u64,

    /// candidate id sent in the header
    #[argh(option, default = "\"raftrpc-cli\".into()")]
    id: String,

    /// API key attached to the call
    #[argh(option, long = "api-key")]
    api_key: Option<String>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "heartbeat")]
/// send an empty append-entries to a peer
struct HeartbeatArgs {
    /// address of the peer
    #[argh(positional)]
    target: String,

    /// leader term
    #[argh(option)]
    term: u64,

    /// leader id sent in the header
    #[argh(option, default = "\"raftrpc-cli\".into()")]
    id: String,

    /// deadline for the reply, in milliseconds
    #[argh(option, long = "timeout-ms", default = "1000")]
    timeout_ms: u64,

    /// API key attached to the call
    #[argh(option, long = "api-key")]
    api_key: Option<String>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "timeout-now")]
/// tell a peer to start an election immediately
struct TimeoutNowArgs {
    /// address of the peer
    #[argh(positional)]
    target: String,

    /// leader id sent in the header
    #[argh(option, default = "\"raftrpc-cli\".into()")]
    id: String,

    /// API key attached to the call
    #[argh(option, long = "api-key")]
    api_key: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Client commands print JSON on stdout, so logs only go with serve
    if matches!(cli.command, Commands::Serve(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Vote(args) => run_vote(args).await,
        Commands::Heartbeat(args) => run_heartbeat(args).await,
        Commands::TimeoutNow(args) => run_timeout_now(args).await,
    }
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let server = TcpServer::new(&args.bind).await?;
    let bound = server.local_addr()?.to_string();
    let advertise = ServerAddress::new(args.advertise.unwrap_or(bound));
    let id = ServerId::new(args.id);

    let mut options =
        Options::new().with_handshake_timeout(Duration::from_millis(args.handshake_timeout_ms));
    if let Some(key) = &args.api_key {
        tracing::info!("API key authentication enabled");
        options = options.with_auth(AuthConfig::with_api_key(key));
    }
    if args.heartbeat_fast_path {
        let header = RpcHeader {
            protocol_version: PROTOCOL_VERSION,
            id: id.clone(),
            addr: advertise.clone(),
        };
        options = options.with_heartbeat_handler(std::sync::Arc::new(move |rpc: Rpc| {
            let term = match rpc.command() {
                Command::AppendEntries(req) => req.term,
                _ => 0,
            };
            rpc.respond(Ok(CommandResponse::AppendEntries(AppendEntriesResponse {
                header: header.clone(),
                term,
                success: true,
                ..Default::default()
            })));
        }));
    }

    let dial_options = match &args.api_key {
        Some(key) => vec![DialOption::ApiKey(key.clone())],
        None => vec![],
    };
    let manager = Manager::new(advertise.clone(), dial_options, options);
    let inbound = manager
        .transport()
        .consumer()
        .ok_or_else(|| anyhow::anyhow!("inbound channel already taken"))?;
    tokio::spawn(StubEngine::new(id.clone(), advertise.clone()).run(inbound));

    tracing::info!(id = %id, addr = %advertise, "Serving Raft transport");
    manager
        .serve_until(server, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    manager.close().await?;
    Ok(())
}

/// Builds a client-only manager. Its local address is never served.
fn client(id: &str, api_key: Option<String>, options: Options) -> (ServerId, Manager) {
    let dial_options = api_key.map(DialOption::ApiKey).into_iter().collect();
    (ServerId::new(id), Manager::new("", dial_options, options))
}

fn header(id: &ServerId) -> RpcHeader {
    RpcHeader {
        protocol_version: PROTOCOL_VERSION,
        id: id.clone(),
        addr: ServerAddress::default(),
    }
}

async fn run_vote(args: VoteArgs) -> Result<()> {
    let (id, manager) = client(&args.id, args.api_key, Options::default());
    let target = ServerAddress::new(args.target);

    let reply = manager
        .transport()
        .request_vote(
            &ServerId::new(target.as_str()),
            &target,
            RequestVoteRequest {
                header: header(&id),
                term: args.term,
                last_log_index: args.last_log_index,
                last_log_term: args.last_log_term,
                leadership_transfer: false,
            },
        )
        .await?;
    manager.close().await?;

    println!("{}", serde_json::to_string(&wire::RequestVoteResponse::from(reply))?);
    Ok(())
}

async fn run_heartbeat(args: HeartbeatArgs) -> Result<()> {
    let reply = send_heartbeat(&args).await?;
    println!("{}", serde_json::to_string(&wire::AppendEntriesResponse::from(reply))?);
    Ok(())
}

/// The reply deadline is the transport's heartbeat timeout.
async fn send_heartbeat(args: &HeartbeatArgs) -> Result<AppendEntriesResponse> {
    let options = Options::new().with_heartbeat_timeout(Duration::from_millis(args.timeout_ms));
    let (id, manager) = client(&args.id, args.api_key.clone(), options);
    let target = ServerAddress::new(args.target.clone());

    // Heartbeat shape requires a non-empty leader address
    let request = AppendEntriesRequest {
        header: RpcHeader {
            addr: ServerAddress::new("raftrpc-cli"),
            ..header(&id)
        },
        term: args.term,
        ..Default::default()
    };

    let reply = manager
        .transport()
        .append_entries(&ServerId::new(target.as_str()), &target, request)
        .await;
    manager.close().await?;
    Ok(reply?)
}

async fn run_timeout_now(args: TimeoutNowArgs) -> Result<()> {
    let (id, manager) = client(&args.id, args.api_key, Options::default());
    let target = ServerAddress::new(args.target);

    let reply = manager
        .transport()
        .timeout_now(
            &ServerId::new(target.as_str()),
            &target,
            TimeoutNowRequest { header: header(&id) },
        )
        .await?;
    manager.close().await?;

    println!("{}", serde_json::to_string(&wire::TimeoutNowResponse::from(reply))?);
    Ok(())
}
