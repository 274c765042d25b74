// ABOUTME: Shared CLI utilities for config loading, gateway startup and server lookup
//
// Server lookup uses prefix matching on both id and name so operators can
// type as little as is unambiguous.

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::config::GatewayConfig;
use crate::gateway::{ChannelTelemetry, Gateway, ServerRecord};

/// A started gateway plus its telemetry drain.
pub struct RunningGateway {
    pub gateway: Gateway,
    drain: JoinHandle<()>,
}

impl RunningGateway {
    /// Drain servers, then let the telemetry task flush what is left.
    pub async fn shutdown(self) {
        self.gateway.shutdown().await;
        drop(self.gateway);
        if tokio::time::timeout(std::time::Duration::from_secs(2), self.drain)
            .await
            .is_err()
        {
            tracing::debug!("Telemetry drain still running at exit");
        }
    }
}

pub fn load_config(path: Option<&Path>) -> Result<GatewayConfig> {
    GatewayConfig::load(path).context("Failed to load gateway configuration")
}

/// Build and start a gateway with channel telemetry drained to the log.
pub async fn start_gateway(config: GatewayConfig) -> Result<RunningGateway> {
    let (telemetry, drain) = ChannelTelemetry::new(config.telemetry.channel_capacity);
    let drain = match &config.telemetry.jsonl_path {
        Some(path) => drain.with_jsonl(path.clone()),
        None => drain,
    };
    let drain = drain.spawn();

    let gateway = Gateway::builder(config)
        .telemetry(Arc::new(telemetry))
        .build()
        .context("Failed to build gateway")?;
    gateway.start().await.context("Failed to start gateway")?;
    Ok(RunningGateway { gateway, drain })
}

/// Find a server by id or name
///
/// Matching priority:
/// 1. Exact id or name match
/// 2. Id prefix match
/// 3. Name prefix match (case-insensitive)
///
/// Returns an error if no match is found or if multiple servers match.
pub fn find_server<'a>(id_or_name: &str, servers: &'a [ServerRecord]) -> Result<&'a ServerRecord> {
    if servers.is_empty() {
        return Err(anyhow!("No servers registered. Add [[servers]] to the config."));
    }

    if let Some(exact) = servers
        .iter()
        .find(|s| s.id.as_str() == id_or_name || s.name == id_or_name)
    {
        return Ok(exact);
    }

    let needle = id_or_name.to_lowercase();
    let by_id: Vec<&ServerRecord> = servers
        .iter()
        .filter(|s| s.id.as_str().to_lowercase().starts_with(&needle))
        .collect();
    let matches = if by_id.is_empty() {
        servers
            .iter()
            .filter(|s| s.name.to_lowercase().starts_with(&needle))
            .collect()
    } else {
        by_id
    };

    match matches.as_slice() {
        [] => Err(anyhow!("No server matching '{id_or_name}'")),
        [single] => Ok(single),
        many => {
            let names: Vec<String> = many.iter().map(|s| format!("  {} ({})", s.id, s.name)).collect();
            Err(anyhow!(
                "Ambiguous server '{id_or_name}'. Matches:\n{}",
                names.join("\n")
            ))
        }
    }
}

/// Truncate a string to fit in the given width (character-aware for UTF-8)
pub fn truncate(s: &str, max_len: usize) -> String {
    if max_len <= 3 {
        return ".".repeat(max_len);
    }
    let char_count = s.chars().count();
    if char_count <= max_len {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{truncated}...")
    }
}
