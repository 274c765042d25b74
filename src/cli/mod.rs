// ABOUTME: CLI argument parsing and command routing for mcp-gateway
//
// Provides command-line interface for:
// - Running the gateway until interrupted (serve)
// - Checking a configuration file (validate)
// - Dumping per-server breaker, pool and queue state (snapshot)
// - Routing a single request through the gateway (route)

pub mod route;
pub mod serve;
pub mod snapshot;
pub mod util;
pub mod validate;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// MCP gateway - route MCP requests across a registry of servers
#[derive(Parser)]
#[command(name = "mcp-gateway")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (defaults to ./mcp-gateway.toml, then ~/.mcp-gateway/config.toml)
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Emit logs as JSON Lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,
}

/// Output format for commands
#[derive(Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run the gateway until Ctrl-C
    Serve(ServeArgs),

    /// Validate the configuration and list configured servers
    Validate,

    /// Start the gateway, optionally probe every server, and print its state
    Snapshot(SnapshotArgs),

    /// Route one request by capability and print the result
    Route(RouteArgs),
}

/// Arguments for the serve command
#[derive(clap::Args)]
pub struct ServeArgs {
    /// Print a snapshot every N seconds (0 disables)
    #[arg(long, default_value = "0")]
    pub report_every: u64,
}

/// Arguments for the snapshot command
#[derive(clap::Args)]
pub struct SnapshotArgs {
    /// Probe every server before taking the snapshot
    #[arg(long)]
    pub probe: bool,

    /// Only show this server (id or name prefix)
    #[arg(long)]
    pub server: Option<String>,
}

/// Arguments for the route command
#[derive(clap::Args)]
pub struct RouteArgs {
    /// Capability to route by (usually a tool name)
    pub capability: String,

    /// JSON-RPC method; defaults to tools/call for the capability
    #[arg(long)]
    pub method: Option<String>,

    /// JSON params (or tool arguments with the default method)
    #[arg(long, default_value = "{}")]
    pub params: String,

    /// Tenant to route as
    #[arg(long)]
    pub tenant: Option<String>,

    /// Priority: low, normal or high
    #[arg(long, default_value = "normal")]
    pub priority: PriorityArg,
}

/// Request priority as accepted on the command line
#[derive(Clone, Copy, Default, ValueEnum)]
pub enum PriorityArg {
    Low,
    #[default]
    Normal,
    High,
}

impl From<PriorityArg> for crate::gateway::Priority {
    fn from(value: PriorityArg) -> Self {
        match value {
            PriorityArg::Low => Self::LOW,
            PriorityArg::Normal => Self::NORMAL,
            PriorityArg::High => Self::HIGH,
        }
    }
}
