// ABOUTME: Configuration for the MCP gateway routing core
//
// Defines GatewayConfig with all tunable parameters:
// - Circuit breaker thresholds and open timeout
// - Connection pool sizing, acquire and idle timeouts
// - Request queue capacity, priority levels and stage timeouts
// - Per-tenant rate limits
// - Health probing interval and hysteresis
// - Telemetry and persistence sinks
// - Initial server definitions

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::gateway::ServerRegistration;

/// Minimum interval between health probes of one server.
pub const MIN_HEALTH_INTERVAL: Duration = Duration::from_secs(10);

/// Errors loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config from {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub breaker: BreakerConfig,
    pub pool: PoolConfig,
    pub queue: QueueConfig,
    pub rate_limit: RateLimitConfig,
    pub health: HealthConfig,
    pub router: RouterConfig,
    pub telemetry: TelemetryConfig,
    pub persistence: PersistenceConfig,

    /// Servers registered at startup
    pub servers: Vec<ServerRegistration>,
}

// === Circuit Breaker ===

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens
    pub failure_threshold: u32,

    /// Consecutive half-open successes before the breaker closes
    pub success_threshold: u32,

    /// Time spent open before trial requests are allowed
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,

    /// Trial requests admitted while half-open (defaults to `success_threshold`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub half_open_max_trials: Option<u32>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_millis(60_000),
            half_open_max_trials: None,
        }
    }
}

impl BreakerConfig {
    pub fn half_open_trials(&self) -> u32 {
        self.half_open_max_trials
            .unwrap_or(self.success_threshold)
            .max(1)
    }
}

// === Connection Pool ===

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Idle connections the sweep never reclaims below
    pub min_size: usize,

    /// Upper bound on active + idle connections per pool
    pub max_size: usize,

    /// How long `acquire` waits for a released connection
    #[serde(rename = "acquire_timeout_ms", with = "duration_ms")]
    pub acquire_timeout: Duration,

    /// Idle connections older than this are closed by the sweep
    #[serde(rename = "idle_timeout_ms", with = "duration_ms")]
    pub idle_timeout: Duration,

    /// Interval of the background idle sweep
    #[serde(rename = "sweep_interval_secs", with = "duration_secs")]
    pub sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 0,
            max_size: 10,
            acquire_timeout: Duration::from_millis(5_000),
            idle_timeout: Duration::from_millis(300_000),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

// === Request Queue ===

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum queued (not yet dispatched) requests per server
    pub max_size: usize,

    /// Number of priority levels, served highest first
    pub priority_levels: u8,

    /// Upper bound on one outbound call
    #[serde(rename = "processing_timeout_ms", with = "duration_ms")]
    pub processing_timeout: Duration,

    /// Requests waiting longer than this are timed out at dequeue
    #[serde(rename = "max_wait_ms", with = "duration_ms")]
    pub max_wait: Duration,

    /// Concurrent dispatches per server (defaults to the pool max size)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<usize>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            priority_levels: 3,
            processing_timeout: Duration::from_millis(30_000),
            max_wait: Duration::from_millis(60_000),
            max_concurrent: None,
        }
    }
}

// === Rate Limiting ===

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,

    /// Bucket capacity per (tenant, server)
    pub burst: u32,

    /// Steady-state refill rate in requests per second
    pub per_second: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            burst: 50,
            per_second: 25.0,
        }
    }
}

// === Health Monitoring ===

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub enabled: bool,

    /// Interval between probes, floored at `MIN_HEALTH_INTERVAL`
    #[serde(rename = "interval_secs", with = "duration_secs")]
    pub interval: Duration,

    /// Per-probe timeout, kept below the interval
    #[serde(rename = "probe_timeout_ms", with = "duration_ms")]
    pub probe_timeout: Duration,

    /// EMA smoothing factor for response time and success rate
    pub smoothing: f64,

    /// Consecutive probe failures for healthy -> degraded
    pub degrade_after: u32,

    /// Further consecutive failures for degraded -> unhealthy
    pub unhealthy_after: u32,

    /// Consecutive successes to recover to healthy
    pub recover_after: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(300),
            probe_timeout: Duration::from_millis(5_000),
            smoothing: 0.2,
            degrade_after: 2,
            unhealthy_after: 2,
            recover_after: 2,
        }
    }
}

impl HealthConfig {
    /// Probe interval with the floor applied.
    pub fn effective_interval(&self) -> Duration {
        self.interval.max(MIN_HEALTH_INTERVAL)
    }

    /// Probe timeout, clamped to half the effective interval.
    pub fn effective_probe_timeout(&self) -> Duration {
        self.probe_timeout.min(self.effective_interval() / 2)
    }
}

// === Router ===

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// How long deregistration waits for in-flight requests
    #[serde(rename = "drain_grace_secs", with = "duration_secs")]
    pub drain_grace: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            drain_grace: Duration::from_secs(30),
        }
    }
}

// === Sinks ===

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Buffered events before new ones are dropped
    pub channel_capacity: usize,

    /// Append events as JSON Lines to this file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsonl_path: Option<PathBuf>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            jsonl_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Registry event log; when unset servers come from `[[servers]]` only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsonl_path: Option<PathBuf>,

    /// Buffered registry events awaiting write-behind
    pub channel_capacity: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            jsonl_path: None,
            channel_capacity: 256,
        }
    }
}

impl GatewayConfig {
    /// Load configuration.
    ///
    /// An explicit path must exist. Without one, `./mcp-gateway.toml` and
    /// then `~/.mcp-gateway/config.toml` are tried, falling back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load_file(path);
        }

        for candidate in Self::get_config_paths() {
            if candidate.exists() {
                return Self::load_file(&candidate);
            }
        }

        Ok(Self::default())
    }

    fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), servers = config.servers.len(), "Loaded gateway config");
        Ok(config)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Write configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Get configuration file paths in order of precedence
    fn get_config_paths() -> Vec<PathBuf> {
        let mut paths = vec![];

        if let Ok(cwd) = std::env::current_dir() {
            paths.push(cwd.join("mcp-gateway.toml"));
        }

        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".mcp-gateway").join("config.toml"));
        }

        paths
    }

    /// Reject settings the core cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.breaker.failure_threshold == 0 {
            return invalid("breaker.failure_threshold must be at least 1");
        }
        if self.breaker.success_threshold == 0 {
            return invalid("breaker.success_threshold must be at least 1");
        }
        if self.breaker.half_open_trials() < self.breaker.success_threshold {
            return invalid("breaker.half_open_max_trials must be at least success_threshold");
        }
        if self.pool.max_size == 0 {
            return invalid("pool.max_size must be at least 1");
        }
        if self.pool.min_size > self.pool.max_size {
            return invalid("pool.min_size must not exceed pool.max_size");
        }
        if self.queue.max_size == 0 {
            return invalid("queue.max_size must be at least 1");
        }
        if self.queue.priority_levels == 0 {
            return invalid("queue.priority_levels must be at least 1");
        }
        if self.queue.max_concurrent == Some(0) {
            return invalid("queue.max_concurrent must be at least 1");
        }
        if self.rate_limit.enabled
            && (self.rate_limit.burst == 0
                || !self.rate_limit.per_second.is_finite()
                || self.rate_limit.per_second <= 0.0)
        {
            return invalid("rate_limit.burst and rate_limit.per_second must be positive");
        }
        if !(self.health.smoothing > 0.0 && self.health.smoothing <= 1.0) {
            return invalid("health.smoothing must be in (0, 1]");
        }
        if self.health.degrade_after == 0
            || self.health.unhealthy_after == 0
            || self.health.recover_after == 0
        {
            return invalid("health hysteresis thresholds must be at least 1");
        }
        if self.telemetry.channel_capacity == 0 || self.persistence.channel_capacity == 0 {
            return invalid("sink channel capacities must be at least 1");
        }

        for server in &self.servers {
            server
                .validate()
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }

        Ok(())
    }

    /// Concurrent dispatches per server.
    pub fn max_concurrent(&self) -> usize {
        self.queue.max_concurrent.unwrap_or(self.pool.max_size).max(1)
    }
}

/// Serde helper for Duration as milliseconds (u64)
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serde helper for Duration as seconds (u64)
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
