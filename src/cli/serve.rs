// ABOUTME: CLI serve command - run the gateway until interrupted
//
// Registers configured and persisted servers, runs health monitors and the
// idle sweep, then drains everything on Ctrl-C.

use anyhow::Result;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use super::util::{load_config, start_gateway};
use super::ServeArgs;

/// Execute the serve command
pub async fn execute(args: ServeArgs, config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let running = start_gateway(config).await?;
    info!(
        servers = running.gateway.registry().len(),
        "Gateway serving; press Ctrl-C to stop"
    );

    let admin = running.gateway.admin();
    let report = async {
        if args.report_every == 0 {
            return std::future::pending::<()>().await;
        }
        let mut ticker = tokio::time::interval(Duration::from_secs(args.report_every));
        loop {
            ticker.tick().await;
            let snapshot = admin.snapshot();
            info!(
                servers = snapshot.servers.len(),
                health = ?snapshot.health_counts(),
                requests = snapshot.metrics.requests_total,
                failed = snapshot.metrics.requests_failed,
                rejected = snapshot.metrics.requests_rejected,
                "Gateway status"
            );
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutdown requested");
        }
        () = report => {}
    }

    running.shutdown().await;
    Ok(())
}
