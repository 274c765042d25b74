// ABOUTME: Server registry data model: identifiers, transports, health states, records
//
// A `ServerRegistration` is what operators (or the persistence layer) hand
// the gateway; a `ServerRecord` is the registry's read-only view of a
// registered server including its rolling statistics.

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

use super::error::RegistryError;

lazy_static! {
    // Lowercase slug: letters, digits, dash and underscore
    static ref SERVER_NAME: Regex = Regex::new(r"^[a-z0-9][a-z0-9_-]{0,99}$").unwrap();
}

// === Identifiers ===

/// Opaque identifier of a registered MCP server.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(String);

impl ServerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Tenant identifier supplied by the authentication layer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// === Transport ===

/// How the gateway talks to a backend server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Http,
    Websocket,
    Stdio,
    Sse,
}

impl TransportKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Websocket => "websocket",
            Self::Stdio => "stdio",
            Self::Sse => "sse",
        }
    }

    /// Whether the endpoint is a network URL (as opposed to a command line).
    pub const fn is_network(self) -> bool {
        !matches!(self, Self::Stdio)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === Health ===

/// Health classification of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unknown,
    Unhealthy,
    Maintenance,
}

impl HealthStatus {
    /// Routing preference, lower is better.
    pub const fn rank(self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Degraded => 1,
            Self::Unknown => 2,
            Self::Unhealthy => 3,
            Self::Maintenance => 4,
        }
    }

    /// Servers in these states are routed to without reservation.
    pub const fn is_routable(self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded | Self::Unknown)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unknown => "unknown",
            Self::Unhealthy => "unhealthy",
            Self::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one call or probe against a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    Timeout,
}

impl Outcome {
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

// === Registration ===

/// Definition of a server to register.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRegistration {
    /// Fixed identifier; generated on registration when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ServerId>,

    pub name: String,

    /// URL for network transports, command line for stdio
    pub endpoint: String,

    pub transport: TransportKind,

    #[serde(default)]
    pub capabilities: BTreeSet<String>,

    /// Owning tenant; `None` means shared by every tenant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<TenantId>,

    #[serde(default)]
    pub owner_id: String,
}

impl ServerRegistration {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>, transport: TransportKind) -> Self {
        Self {
            id: None,
            name: name.into(),
            endpoint: endpoint.into(),
            transport,
            capabilities: BTreeSet::new(),
            tenant: None,
            owner_id: String::new(),
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(ServerId::new(id));
        self
    }

    #[must_use]
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    #[must_use]
    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(TenantId::new(tenant));
        self
    }

    #[must_use]
    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = owner_id.into();
        self
    }

    /// Check the registration is well-formed.
    pub fn validate(&self) -> Result<(), RegistryError> {
        if !SERVER_NAME.is_match(&self.name) {
            return Err(RegistryError::InvalidRegistration(format!(
                "server name '{}' must be 1-100 lowercase alphanumerics, '-' or '_'",
                self.name
            )));
        }

        let endpoint = self.endpoint.trim();
        if endpoint.is_empty() {
            return Err(RegistryError::InvalidRegistration(format!(
                "server '{}' has an empty endpoint",
                self.name
            )));
        }

        if self.transport.is_network() {
            let url = url::Url::parse(endpoint).map_err(|e| {
                RegistryError::InvalidRegistration(format!(
                    "server '{}' endpoint '{endpoint}' is not a valid URL: {e}",
                    self.name
                ))
            })?;
            let allowed: &[&str] = match self.transport {
                TransportKind::Websocket => &["ws", "wss"],
                _ => &["http", "https"],
            };
            if !allowed.contains(&url.scheme()) {
                return Err(RegistryError::InvalidRegistration(format!(
                    "server '{}' uses scheme '{}' which does not match transport {}",
                    self.name,
                    url.scheme(),
                    self.transport
                )));
            }
        }

        if self.capabilities.iter().any(|c| c.trim().is_empty()) {
            return Err(RegistryError::InvalidRegistration(format!(
                "server '{}' declares an empty capability name",
                self.name
            )));
        }

        Ok(())
    }
}

// === Server Record ===

/// Registry view of one registered server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerRecord {
    pub id: ServerId,
    pub name: String,
    pub endpoint: String,
    pub transport: TransportKind,
    pub capabilities: BTreeSet<String>,
    pub tenant: Option<TenantId>,
    pub owner_id: String,
    pub health: HealthStatus,
    pub last_health_check: Option<DateTime<Utc>>,
    pub avg_response_time_ms: Option<f64>,
    pub success_rate: f64,
    pub active_connections: u32,
}

impl ServerRecord {
    /// Globally shared servers are visible to every tenant.
    pub const fn is_public(&self) -> bool {
        self.tenant.is_none()
    }

    pub fn is_visible_to(&self, tenant: Option<&TenantId>) -> bool {
        match (&self.tenant, tenant) {
            (None, _) => true,
            (Some(owner), Some(requester)) => owner == requester,
            (Some(_), None) => false,
        }
    }

    pub fn advertises(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }
}
