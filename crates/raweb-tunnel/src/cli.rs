//! CLI definition using clap derive.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "raweb-tunnel", about = "WebSocket tunnel from RAWeb to guacd")]
pub struct Cli {
    /// TOML configuration file (defaults apply when omitted)
    #[arg(long, short = 'c', global = true, env = "RAWEB_TUNNEL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Listen address, overriding `server.listen`
    #[arg(long, short = 'l', global = true)]
    pub listen: Option<SocketAddr>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Serve the WebSocket tunnel (default)
    Serve,
    /// Register the guacd runtime image
    InstallRuntime,
    /// Stop guacd and unregister every runtime instance
    UninstallRuntime,
    /// Install if needed, start guacd and keep it running until ctrl-c
    StartDaemon,
    /// Terminate the guacd runtime instance
    StopDaemon,
}
