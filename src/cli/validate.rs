// ABOUTME: CLI validate command - check a config file and list its servers

use anyhow::Result;
use serde::Serialize;
use std::path::Path;

use super::util::{load_config, truncate};
use super::OutputFormat;
use crate::config::GatewayConfig;

#[derive(Debug, Serialize)]
struct ValidationReport<'a> {
    valid: bool,
    servers: usize,
    max_concurrent: usize,
    health_interval_secs: u64,
    config: &'a GatewayConfig,
}

/// Execute the validate command
pub fn execute(config_path: Option<&Path>, format: OutputFormat) -> Result<()> {
    let config = load_config(config_path)?;

    match format {
        OutputFormat::Json => {
            let report = ValidationReport {
                valid: true,
                servers: config.servers.len(),
                max_concurrent: config.max_concurrent(),
                health_interval_secs: config.health.effective_interval().as_secs(),
                config: &config,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Text => output_text(&config),
    }
    Ok(())
}

fn output_text(config: &GatewayConfig) {
    println!("Configuration OK");
    println!(
        "  breaker: {} failures to open, {} successes to close, {}s open timeout",
        config.breaker.failure_threshold,
        config.breaker.success_threshold,
        config.breaker.timeout.as_secs()
    );
    println!(
        "  pool: {}..{} connections, queue: {} entries, {} concurrent",
        config.pool.min_size,
        config.pool.max_size,
        config.queue.max_size,
        config.max_concurrent()
    );
    println!();

    if config.servers.is_empty() {
        println!("No servers configured.");
        return;
    }

    println!("{:<24} {:<10} {:<12} {:<40} CAPABILITIES", "NAME", "TRANSPORT", "TENANT", "ENDPOINT");
    println!("{}", "-".repeat(110));
    for server in &config.servers {
        let capabilities: Vec<&str> = server.capabilities.iter().map(String::as_str).collect();
        println!(
            "{:<24} {:<10} {:<12} {:<40} {}",
            truncate(&server.name, 24),
            server.transport.as_str(),
            server.tenant.as_ref().map_or("-", |t| t.as_str()),
            truncate(&server.endpoint, 40),
            capabilities.join(",")
        );
    }
}
