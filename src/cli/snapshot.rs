// ABOUTME: CLI snapshot command - start the gateway and print per-server state
//
// Shows registry health alongside breaker state, pool occupancy and queue
// depth for every configured server.

use anyhow::Result;
use std::path::Path;

use super::util::{find_server, load_config, start_gateway, truncate};
use super::{OutputFormat, SnapshotArgs};
use crate::gateway::{GatewaySnapshot, Principal, ServerSnapshot};

/// Execute the snapshot command
pub async fn execute(args: SnapshotArgs, config_path: Option<&Path>, format: OutputFormat) -> Result<()> {
    let mut config = load_config(config_path)?;
    // Probing is explicit here; the scheduled monitor would race the snapshot
    config.health.enabled = false;

    let running = start_gateway(config).await?;
    let admin = running.gateway.admin();

    let result = async {
        let records = running.gateway.registry().list();
        let selected = match &args.server {
            Some(needle) => Some(find_server(needle, &records)?.id.clone()),
            None => None,
        };

        if args.probe {
            let system = Principal::system();
            for record in &records {
                if selected.as_ref().is_some_and(|id| id != &record.id) {
                    continue;
                }
                let result = admin.probe_now(&system, &record.id).await?;
                tracing::debug!(server = %record.id, result = ?result, "Probed server");
            }
        }

        let mut snapshot = admin.snapshot();
        if let Some(id) = &selected {
            snapshot.servers.retain(|s| &s.record.id == id);
        }
        anyhow::Ok(snapshot)
    }
    .await;

    running.shutdown().await;
    let snapshot = result?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&snapshot)?),
        OutputFormat::Text => output_text(&snapshot),
    }
    Ok(())
}

fn output_text(snapshot: &GatewaySnapshot) {
    if snapshot.servers.is_empty() {
        println!("No servers registered.");
        return;
    }

    println!(
        "{:<24} {:<12} {:<10} {:>9} {:>8} {:>9} {:>7}",
        "SERVER", "HEALTH", "BREAKER", "AVG MS", "SUCCESS", "POOL A/I", "QUEUE"
    );
    println!("{}", "-".repeat(86));
    for server in &snapshot.servers {
        println!("{}", format_row(server));
    }
}

fn format_row(server: &ServerSnapshot) -> String {
    let (active, idle) = server
        .pools
        .iter()
        .fold((0, 0), |(a, i), pool| (a + pool.active, i + pool.idle));
    let avg = server
        .record
        .avg_response_time_ms
        .map_or_else(|| "-".to_string(), |ms| format!("{ms:.1}"));
    format!(
        "{:<24} {:<12} {:<10} {:>9} {:>7.0}% {:>9} {:>7}",
        truncate(&server.record.name, 24),
        server.record.health.as_str(),
        server.breaker.state.as_str(),
        avg,
        server.record.success_rate * 100.0,
        format!("{active}/{idle}"),
        server.queue.size
    )
}
