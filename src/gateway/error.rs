// ABOUTME: Error taxonomy surfaced by the routing core and its admin surface
//
// Callers only ever see these categories plus a machine-readable reason and
// an optional retry-after hint. JSON-RPC conversion mirrors what an MCP
// client expects from an overloaded or unavailable upstream.

use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use super::persistence::StoreError;
use super::record::ServerId;

// === JSON-RPC Error Codes ===

/// Server is overloaded: queue full, pool exhausted, not accepting
pub const ERROR_SERVER_OVERLOADED: i32 = -32000;

/// Circuit breaker is open, requests blocked
pub const ERROR_CIRCUIT_OPEN: i32 = -32001;

/// Request timed out
pub const ERROR_REQUEST_TIMEOUT: i32 = -32002;

/// No server can take the request
pub const ERROR_NO_SERVER: i32 = -32003;

/// Tenant exceeded its rate limit
pub const ERROR_RATE_LIMITED: i32 = -32004;

/// Upstream transport failure
pub const ERROR_UPSTREAM: i32 = -32005;

/// Create a JSON-RPC error response
///
/// # Arguments
/// * `code` - JSON-RPC error code (use constants above)
/// * `message` - Human-readable error message
/// * `data` - Structured error details
/// * `id` - Request ID to include in response (null if unknown)
pub fn create_jsonrpc_error(code: i64, message: &str, data: Option<Value>, id: Option<Value>) -> Value {
    let mut error = serde_json::json!({
        "code": code,
        "message": message,
    });
    if let Some(data) = data {
        error["data"] = data;
    }
    serde_json::json!({
        "jsonrpc": "2.0",
        "error": error,
        "id": id.unwrap_or(Value::Null)
    })
}

// === Routing Errors ===

/// Stage of the request path a timeout occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Waiting in the server's request queue
    Queue,
    /// Waiting for a pooled connection
    Acquire,
    /// Waiting for the server's response
    Call,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Queue => "queue",
            Self::Acquire => "acquire",
            Self::Call => "call",
        })
    }
}

/// Errors produced while routing a request to a backend server.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    /// No registered server advertises the capability
    #[error("No server advertises capability '{capability}'")]
    NoCapableServer { capability: String },

    /// Candidates exist but every breaker is open or pool unhealthy
    #[error("All servers for '{capability}' are down")]
    AllServersDown {
        capability: String,
        retry_after: Option<Duration>,
    },

    /// Candidates exist but none accepted the request
    #[error("No server available for '{capability}'")]
    NoAvailableServer {
        capability: String,
        retry_after: Option<Duration>,
    },

    /// Breaker is open, the call was not attempted
    #[error("Circuit breaker open for {server_id}, retry in {retry_after:?}")]
    CircuitOpen {
        server_id: ServerId,
        retry_after: Duration,
    },

    /// No pooled connection became available in time
    #[error("Connection pool exhausted for {server_id} after {waited:?}")]
    PoolExhausted { server_id: ServerId, waited: Duration },

    /// Pool is marked unhealthy until a successful probe
    #[error("Connection pool unhealthy for {server_id}")]
    PoolUnhealthy { server_id: ServerId },

    /// Request queue is at capacity
    #[error("Queue full for {server_id}: capacity {capacity}")]
    QueueFull { server_id: ServerId, capacity: usize },

    /// Tenant token bucket for this server is empty
    #[error("Rate limited on {server_id}, retry in {retry_after:?}")]
    RateLimited {
        server_id: ServerId,
        retry_after: Duration,
    },

    /// Queue stopped accepting requests
    #[error("Server {server_id} is not accepting requests")]
    NotAccepting { server_id: ServerId },

    /// A stage exceeded its timeout
    #[error("Request to {server_id} timed out in {stage} stage after {elapsed:?}")]
    Timeout {
        server_id: ServerId,
        stage: Stage,
        elapsed: Duration,
    },

    /// Connection or I/O failure talking to the server
    #[error("Transport error from {server_id}: {message}")]
    Transport { server_id: ServerId, message: String },

    /// Server answered with a JSON-RPC error
    #[error("Server {server_id} returned error {code}: {message}")]
    Protocol {
        server_id: ServerId,
        code: i64,
        message: String,
    },

    /// Server was deregistered while the request was pending
    #[error("Server {server_id} was removed")]
    ServerRemoved { server_id: ServerId },

    /// Caller went away before a result was produced
    #[error("Request cancelled")]
    Cancelled,
}

impl RoutingError {
    /// Machine-readable reason code.
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::NoCapableServer { .. } => "no_capable_server",
            Self::AllServersDown { .. } => "all_servers_down",
            Self::NoAvailableServer { .. } => "no_available_server",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::PoolExhausted { .. } => "pool_exhausted",
            Self::PoolUnhealthy { .. } => "pool_unhealthy",
            Self::QueueFull { .. } => "queue_full",
            Self::RateLimited { .. } => "rate_limited",
            Self::NotAccepting { .. } => "not_accepting",
            Self::Timeout { .. } => "timeout",
            Self::Transport { .. } => "transport_error",
            Self::Protocol { .. } => "protocol_error",
            Self::ServerRemoved { .. } => "server_removed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether a caller may reasonably retry later.
    pub const fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::NoCapableServer { .. } | Self::Protocol { .. } | Self::Cancelled
        )
    }

    /// Suggested delay before retrying, when one is known.
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::AllServersDown { retry_after, .. } | Self::NoAvailableServer { retry_after, .. } => {
                *retry_after
            }
            Self::CircuitOpen { retry_after, .. } | Self::RateLimited { retry_after, .. } => {
                Some(*retry_after)
            }
            _ => None,
        }
    }

    /// Server the error is attributed to, if it is server-local.
    pub const fn server_id(&self) -> Option<&ServerId> {
        match self {
            Self::CircuitOpen { server_id, .. }
            | Self::PoolExhausted { server_id, .. }
            | Self::PoolUnhealthy { server_id }
            | Self::QueueFull { server_id, .. }
            | Self::RateLimited { server_id, .. }
            | Self::NotAccepting { server_id }
            | Self::Timeout { server_id, .. }
            | Self::Transport { server_id, .. }
            | Self::Protocol { server_id, .. }
            | Self::ServerRemoved { server_id } => Some(server_id),
            _ => None,
        }
    }

    /// Server-local condition that marks the server as down rather than busy.
    pub const fn is_server_down(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. } | Self::PoolUnhealthy { .. })
    }

    /// JSON-RPC error code for this category.
    pub const fn jsonrpc_code(&self) -> i64 {
        match self {
            Self::CircuitOpen { .. } => ERROR_CIRCUIT_OPEN as i64,
            Self::Timeout { .. } => ERROR_REQUEST_TIMEOUT as i64,
            Self::NoCapableServer { .. }
            | Self::AllServersDown { .. }
            | Self::NoAvailableServer { .. }
            | Self::ServerRemoved { .. } => ERROR_NO_SERVER as i64,
            Self::RateLimited { .. } => ERROR_RATE_LIMITED as i64,
            Self::Transport { .. } | Self::Cancelled => ERROR_UPSTREAM as i64,
            Self::Protocol { code, .. } => *code,
            Self::PoolExhausted { .. }
            | Self::PoolUnhealthy { .. }
            | Self::QueueFull { .. }
            | Self::NotAccepting { .. } => ERROR_SERVER_OVERLOADED as i64,
        }
    }

    /// Convert to a JSON-RPC error response.
    pub fn to_jsonrpc_error(&self, id: Option<Value>) -> Value {
        let mut data = serde_json::json!({
            "reason": self.reason(),
            "retryable": self.is_retryable(),
        });
        if let Some(retry_after) = self.retry_after() {
            data["retry_after_ms"] = Value::from(u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX));
        }
        let message = match self {
            // Upstream messages pass through untouched
            Self::Protocol { message, .. } => message.clone(),
            other => other.public_message().to_string(),
        };
        create_jsonrpc_error(self.jsonrpc_code(), &message, Some(data), id)
    }

    fn public_message(&self) -> &'static str {
        match self {
            Self::NoCapableServer { .. } => "No server provides this capability",
            Self::AllServersDown { .. } => "All servers for this capability are down",
            Self::NoAvailableServer { .. } | Self::ServerRemoved { .. } => {
                "No server is available for this request"
            }
            Self::CircuitOpen { .. } => "Server temporarily unavailable",
            Self::PoolExhausted { .. }
            | Self::PoolUnhealthy { .. }
            | Self::QueueFull { .. }
            | Self::NotAccepting { .. } => "Server overloaded",
            Self::RateLimited { .. } => "Rate limit exceeded",
            Self::Timeout { .. } => "Request timed out",
            Self::Transport { .. } => "Upstream server unreachable",
            Self::Protocol { .. } => "Upstream error",
            Self::Cancelled => "Request cancelled",
        }
    }
}

// === Registry & Admin Errors ===

/// Errors from registering, looking up or removing servers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Server not found: {0}")]
    NotFound(ServerId),

    /// Duplicate id, (tenant, name) or (tenant, endpoint)
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid registration: {0}")]
    InvalidRegistration(String),
}

/// Errors from the admin control surface.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdminError {
    #[error("Principal '{principal}' is not allowed to {action}")]
    Forbidden { principal: String, action: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Errors from building or starting a gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Failed to initialise HTTP connector: {0}")]
    Connector(#[from] reqwest::Error),

    #[error("Failed to load persisted servers: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to register configured server '{name}': {source}")]
    Registration {
        name: String,
        #[source]
        source: RegistryError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jsonrpc_error_creation() {
        let error = create_jsonrpc_error(
            i64::from(ERROR_SERVER_OVERLOADED),
            "Test error",
            None,
            Some(Value::from(42)),
        );

        assert_eq!(error["jsonrpc"], "2.0");
        assert_eq!(error["error"]["code"], ERROR_SERVER_OVERLOADED);
        assert_eq!(error["error"]["message"], "Test error");
        assert!(error["error"].get("data").is_none());
        assert_eq!(error["id"], 42);
    }

    #[test]
    fn test_jsonrpc_error_with_null_id() {
        let error = create_jsonrpc_error(i64::from(ERROR_CIRCUIT_OPEN), "Circuit open", None, None);
        assert_eq!(error["error"]["code"], ERROR_CIRCUIT_OPEN);
        assert!(error["id"].is_null());
    }

    #[test]
    fn test_routing_error_to_jsonrpc() {
        let err = RoutingError::CircuitOpen {
            server_id: ServerId::from("s1"),
            retry_after: Duration::from_millis(1500),
        };
        let json = err.to_jsonrpc_error(Some(Value::from(7)));
        assert_eq!(json["error"]["code"], ERROR_CIRCUIT_OPEN);
        assert_eq!(json["error"]["data"]["reason"], "circuit_open");
        assert_eq!(json["error"]["data"]["retry_after_ms"], 1500);
        assert_eq!(json["id"], 7);
        // Internal server ids stay out of caller-facing messages
        assert!(!json["error"]["message"].as_str().unwrap().contains("s1"));
    }

    #[test]
    fn test_protocol_error_passes_through_code() {
        let err = RoutingError::Protocol {
            server_id: ServerId::from("s1"),
            code: -32601,
            message: "Method not found".to_string(),
        };
        let json = err.to_jsonrpc_error(None);
        assert_eq!(json["error"]["code"], -32601);
        assert_eq!(json["error"]["message"], "Method not found");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_retryability() {
        let no_capable = RoutingError::NoCapableServer {
            capability: "x".to_string(),
        };
        assert!(!no_capable.is_retryable());

        let queue_full = RoutingError::QueueFull {
            server_id: ServerId::from("s1"),
            capacity: 1,
        };
        assert!(queue_full.is_retryable());
        assert_eq!(queue_full.reason(), "queue_full");
        assert_eq!(queue_full.retry_after(), None);

        let down = RoutingError::AllServersDown {
            capability: "x".to_string(),
            retry_after: Some(Duration::from_secs(3)),
        };
        assert!(down.is_retryable());
        assert_eq!(down.retry_after(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_server_down_classification() {
        let sid = ServerId::from("s1");
        assert!(RoutingError::PoolUnhealthy { server_id: sid.clone() }.is_server_down());
        assert!(!RoutingError::NotAccepting { server_id: sid.clone() }.is_server_down());
        assert_eq!(
            RoutingError::NotAccepting { server_id: sid.clone() }.server_id(),
            Some(&sid)
        );
        assert_eq!(RoutingError::Cancelled.server_id(), None);
    }
}
