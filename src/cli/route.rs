// ABOUTME: CLI route command - send one request through the gateway
//
// Prints the server's result, or the JSON-RPC error object the gateway
// would hand back to an MCP client.

use anyhow::{Context, Result};
use serde_json::Value;
use std::path::Path;

use super::util::{load_config, start_gateway};
use super::{OutputFormat, RouteArgs};
use crate::gateway::{McpRequest, Principal, RouteRequest};

/// Execute the route command
pub async fn execute(args: RouteArgs, config_path: Option<&Path>, format: OutputFormat) -> Result<()> {
    let params: Value = serde_json::from_str(&args.params).context("--params must be valid JSON")?;
    let request = build_request(&args, params);

    let mut principal = Principal::new("cli");
    if let Some(tenant) = &args.tenant {
        principal = principal.with_tenant(tenant.clone());
    }

    let config = load_config(config_path)?;
    let running = start_gateway(config).await?;
    let result = running.gateway.route(&principal, request).await;
    running.shutdown().await;

    match (result, format) {
        (Ok(value), OutputFormat::Json) => println!("{}", serde_json::to_string_pretty(&value)?),
        (Ok(value), OutputFormat::Text) => println!("{value}"),
        (Err(error), OutputFormat::Json) => {
            println!("{}", serde_json::to_string_pretty(&error.to_jsonrpc_error(None))?);
            anyhow::bail!("routing failed: {}", error.reason());
        }
        (Err(error), OutputFormat::Text) => {
            anyhow::bail!("{error} ({})", error.reason());
        }
    }
    Ok(())
}

fn build_request(args: &RouteArgs, params: Value) -> RouteRequest {
    let request = match &args.method {
        Some(method) => RouteRequest::new(
            args.capability.clone(),
            McpRequest::new(method.clone(), Some(params)),
        ),
        None => RouteRequest::tool_call(&args.capability, params),
    };
    request.with_priority(args.priority.into())
}
