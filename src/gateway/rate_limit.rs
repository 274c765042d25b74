// ABOUTME: Token-bucket rate limiting per (tenant, server) pair
//
// Each server's queue owns a `RateLimiter`; buckets are keyed by tenant so
// a noisy tenant cannot drain another tenant's budget on the same server.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use super::record::TenantId;
use crate::config::RateLimitConfig;

/// Classic token bucket: `capacity` tokens, refilled continuously.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(capacity: u32, refill_per_sec: f64, now: Instant) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            capacity,
            refill_per_sec: refill_per_sec.max(f64::MIN_POSITIVE),
            tokens: capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = elapsed.mul_add(self.refill_per_sec, self.tokens).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token, or report how long until one is available.
    pub fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }
        let missing = 1.0 - self.tokens;
        Err(Duration::from_secs_f64(missing / self.refill_per_sec))
    }

    /// Tokens currently available, after refilling.
    pub fn available(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.tokens
    }

    fn is_full(&self) -> bool {
        self.tokens >= self.capacity
    }
}

/// Per-tenant buckets for one server.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<Option<TenantId>, TokenBucket>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub const fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Consume one token for `tenant`.
    ///
    /// # Errors
    ///
    /// Returns the time until a token becomes available when the tenant's
    /// bucket is empty.
    pub fn check(&self, tenant: Option<&TenantId>) -> Result<(), Duration> {
        if !self.config.enabled {
            return Ok(());
        }
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        buckets
            .entry(tenant.cloned())
            .or_insert_with(|| TokenBucket::new(self.config.burst, self.config.per_second, now))
            .try_acquire(now)
    }

    /// Drop buckets that have refilled completely; they behave exactly like
    /// a fresh bucket.
    pub fn prune_idle(&self) -> usize {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        let before = buckets.len();
        buckets.retain(|_, bucket| {
            bucket.refill(now);
            !bucket.is_full()
        });
        before - buckets.len()
    }

    pub fn tracked_tenants(&self) -> usize {
        self.buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
