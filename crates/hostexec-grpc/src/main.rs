//! Hostexec gRPC Server
//!
//! Runs whitelisted diagnostic commands in the host namespaces on behalf of
//! gRPC clients.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use hostexec::{AccessLevel, DEFAULT_WHITELIST_PATH, WhitelistConfig, Whitelists};
use hostexec_grpc::{DebugServer, DebugService};

/// Access granted to callers that carry no access level of their own.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum DefaultAccess {
    /// Read whitelist only
    Read,
    /// Read and write whitelists
    Write,
}

impl From<DefaultAccess> for AccessLevel {
    fn from(access: DefaultAccess) -> Self {
        match access {
            DefaultAccess::Read => AccessLevel::ReadOnly,
            DefaultAccess::Write => AccessLevel::ReadWrite,
        }
    }
}

/// Hostexec gRPC Server - whitelisted command execution on the host
#[derive(Parser, Debug)]
#[command(name = "hostexec-grpc")]
#[command(about = "gRPC server running whitelisted commands in the host namespaces")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "[::1]:50051")]
    addr: SocketAddr,

    /// YAML file with `read_whitelist` and `write_whitelist` keys
    #[arg(long, default_value = DEFAULT_WHITELIST_PATH)]
    whitelist: PathBuf,

    /// Access level for callers without one
    #[arg(long, value_enum, default_value_t = DefaultAccess::Read)]
    default_access: DefaultAccess,

    /// Response frames buffered per call
    #[arg(long, default_value_t = 32)]
    response_buffer: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();

    let whitelists = Whitelists::load(&WhitelistConfig::new(args.whitelist));
    let service = DebugService::new(whitelists, args.default_access.into())
        .response_buffer(args.response_buffer);

    DebugServer::new(args.addr, service).run().await?;

    Ok(())
}
