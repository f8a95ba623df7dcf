use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{
    client::ClientConfig,
    server::{RelayMode, ServerConfig},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server, accepting TCP connections on all interfaces.
    Server(ServerArgs),
    /// Connect to a relay server and chat from this terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address to listen on. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "0.0.0.0:7007")]
    pub listen: SocketAddr,

    /// Longest time a single readiness wait may block, in milliseconds.
    #[arg(long, default_value_t = 5000, value_parser = clap::value_parser!(u64).range(1..))]
    pub wait_timeout_ms: u64,

    /// Size of the per-read message buffer, in bytes.
    #[arg(long, default_value_t = 256, value_parser = clap::value_parser!(u16).range(1..))]
    pub max_message: u16,

    /// Whether messages go back to their sender or to everyone else.
    #[arg(long, value_enum, default_value_t = RelayMode::Echo)]
    pub mode: RelayMode,
}

impl From<&ServerArgs> for ServerConfig {
    fn from(args: &ServerArgs) -> Self {
        Self {
            wait_timeout: Duration::from_millis(args.wait_timeout_ms),
            max_message: usize::from(args.max_message),
            mode: args.mode,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the relay server.
    #[arg(long, default_value = "127.0.0.1:7007")]
    pub server: SocketAddr,

    /// Name prefixed to every message. Prompted for when omitted.
    #[arg(long)]
    pub username: Option<String>,

    /// Size of the receive buffer, in bytes.
    #[arg(long, default_value_t = 256, value_parser = clap::value_parser!(u16).range(1..))]
    pub max_message: u16,
}

impl From<&ClientArgs> for ClientConfig {
    fn from(args: &ClientArgs) -> Self {
        Self {
            server: args.server,
            max_message: usize::from(args.max_message),
        }
    }
}
