// ABOUTME: Lock-free statistics primitives and gateway-level request metrics
//
// Tracks:
// - Rolling averages (response time, wait time, connect time) as atomic EMAs
// - Requests: routed, succeeded, failed, rejected before reaching a server

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Default EMA smoothing factor used across the gateway.
pub const DEFAULT_SMOOTHING: f64 = 0.2;

/// Convert a duration to fractional milliseconds for averaging.
pub fn duration_ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

// === Atomic EMA ===

/// Exponential moving average updated with a CAS loop.
///
/// Concurrent reporters never lose an update: each `record` reads the
/// current value and installs the smoothed one atomically. An EMA without
/// samples reports `None`; the first sample is taken as-is.
#[derive(Debug)]
pub struct AtomicEma {
    bits: AtomicU64,
    alpha: f64,
}

impl AtomicEma {
    /// Create an empty average with the given smoothing factor.
    ///
    /// The factor is clamped into `(0, 1]`.
    #[must_use]
    pub fn new(alpha: f64) -> Self {
        Self {
            bits: AtomicU64::new(f64::NAN.to_bits()),
            alpha: sanitize_alpha(alpha),
        }
    }

    /// Create an average seeded with an initial value.
    #[must_use]
    pub fn with_initial(alpha: f64, initial: f64) -> Self {
        Self {
            bits: AtomicU64::new(initial.to_bits()),
            alpha: sanitize_alpha(alpha),
        }
    }

    /// Fold a sample into the average and return the new value.
    pub fn record(&self, sample: f64) -> f64 {
        let alpha = self.alpha;
        let step = |current: f64| {
            if current.is_nan() {
                sample
            } else {
                alpha.mul_add(sample - current, current)
            }
        };

        let previous = match self.bits.fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
            Some(step(f64::from_bits(bits)).to_bits())
        }) {
            Ok(bits) | Err(bits) => bits,
        };

        step(f64::from_bits(previous))
    }

    /// Current average, or `None` before the first sample.
    pub fn get(&self) -> Option<f64> {
        let value = f64::from_bits(self.bits.load(Ordering::Acquire));
        if value.is_nan() {
            None
        } else {
            Some(value)
        }
    }

    /// Current average, or `default` before the first sample.
    pub fn value_or(&self, default: f64) -> f64 {
        self.get().unwrap_or(default)
    }

    /// Smoothing factor in use.
    pub const fn alpha(&self) -> f64 {
        self.alpha
    }
}

fn sanitize_alpha(alpha: f64) -> f64 {
    if alpha.is_finite() && alpha > 0.0 {
        alpha.min(1.0)
    } else {
        DEFAULT_SMOOTHING
    }
}

// === Gateway Metrics ===

/// Gateway-wide routing counters.
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    pub requests_total: AtomicU64,
    pub requests_succeeded: AtomicU64,
    pub requests_failed: AtomicU64,
    pub requests_rejected: AtomicU64,
    pub fallthroughs: AtomicU64,
}

/// Point-in-time copy of [`GatewayMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GatewayMetricsSnapshot {
    pub requests_total: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub requests_rejected: u64,
    pub fallthroughs: u64,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_started(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_succeeded(&self) {
        self.requests_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_failed(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// A request that never reached any backend.
    pub fn request_rejected(&self) {
        self.requests_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// The router moved on to the next candidate.
    pub fn fallthrough(&self) {
        self.fallthroughs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> GatewayMetricsSnapshot {
        GatewayMetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_succeeded: self.requests_succeeded.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            requests_rejected: self.requests_rejected.load(Ordering::Relaxed),
            fallthroughs: self.fallthroughs.load(Ordering::Relaxed),
        }
    }
}
