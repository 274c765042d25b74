// ABOUTME: Main entry point for the mcp-gateway binary
//
// Binary: mcp-gateway
// Usage: mcp-gateway [--config FILE] [--format text|json] [--log-json] <COMMAND>
// - serve: run the gateway until Ctrl-C
// - validate: check the config and list configured servers
// - snapshot: print breaker, pool and queue state per server
// - route: send one request by capability

#![allow(missing_docs)]

use anyhow::Result;
use clap::Parser;

use mcp_gateway::cli::{self, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    setup_logging(args.log_json);
    setup_panic_handler();

    let config = args.config.as_deref();
    match args.command {
        Commands::Serve(serve_args) => cli::serve::execute(serve_args, config).await,
        Commands::Validate => cli::validate::execute(config, args.format),
        Commands::Snapshot(snapshot_args) => cli::snapshot::execute(snapshot_args, config, args.format).await,
        Commands::Route(route_args) => cli::route::execute(route_args, config, args.format).await,
    }
}

fn setup_logging(json: bool) {
    use tracing_subscriber::prelude::*;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "mcp_gateway=info,telemetry=info,audit=info".into());

    // stdout carries command output; logs go to stderr
    if json {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_writer(std::io::stderr)
                    .with_ansi(false),
            )
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .with(filter)
            .init();
    }
}

fn setup_panic_handler() {
    use tracing::error;

    std::panic::set_hook(Box::new(|panic_info| {
        error!("Application panicked: {}", panic_info);
        eprintln!("Application panicked: {}", panic_info);
        eprintln!("Run with --log-json and RUST_LOG=debug for more details.");
    }));
}
