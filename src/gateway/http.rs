// ABOUTME: JSON-RPC over HTTP POST connector for http and sse transports
//
// reqwest keeps its own keep-alive pool underneath, so a pooled
// `HttpConnection` is a lightweight client handle bound to one endpoint
// with its own request id sequence.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::record::TransportKind;
use super::transport::{CallError, Connection, Connector, McpRequest, ServerTarget};

/// Connector for servers reachable over HTTP.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    client: Client,
}

impl HttpConnector {
    /// Build a connector whose requests time out after `request_timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialised.
    pub fn new(request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(concat!("mcp-gateway/", env!("CARGO_PKG_VERSION")))
            .timeout(request_timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(&self, target: &ServerTarget) -> Result<Box<dyn Connection>, CallError> {
        match target.transport {
            TransportKind::Http | TransportKind::Sse => {}
            other => return Err(CallError::Unsupported(other)),
        }
        let endpoint = url::Url::parse(&target.endpoint)
            .map_err(|e| CallError::Transport(format!("invalid endpoint '{}': {e}", target.endpoint)))?;

        debug!(server = %target.server_id, endpoint = %endpoint, "Opening HTTP connection");
        Ok(Box::new(HttpConnection {
            client: self.client.clone(),
            endpoint,
            next_id: 1,
            open: true,
        }))
    }
}

struct HttpConnection {
    client: Client,
    endpoint: url::Url,
    next_id: u64,
    open: bool,
}

#[async_trait]
impl Connection for HttpConnection {
    async fn call(&mut self, request: &McpRequest) -> Result<Value, CallError> {
        let id = self.next_id;
        self.next_id += 1;

        let body = jsonrpc_request(id, request);
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                // Connect and timeout failures leave nothing worth reusing
                if e.is_connect() || e.is_timeout() {
                    self.open = false;
                }
                CallError::Transport(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            if status.is_server_error() {
                self.open = false;
            }
            return Err(CallError::Transport(format!("HTTP {status}")));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| CallError::Transport(format!("invalid JSON-RPC response: {e}")))?;
        parse_response(payload)
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

fn jsonrpc_request(id: u64, request: &McpRequest) -> Value {
    let mut body = serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": request.method,
    });
    if let Some(params) = &request.params {
        body["params"] = params.clone();
    }
    body
}

/// Split a JSON-RPC response into its result or error.
fn parse_response(mut payload: Value) -> Result<Value, CallError> {
    if let Some(error) = payload.get("error").filter(|e| !e.is_null()) {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(-32603);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        return Err(CallError::Protocol { code, message });
    }
    match payload.get_mut("result") {
        Some(result) => Ok(result.take()),
        None => Err(CallError::Transport(
            "JSON-RPC response has neither result nor error".to_string(),
        )),
    }
}
