// ABOUTME: Per-server circuit breaker shielding the gateway from failing backends
//
// State transitions:
// - Closed -> Open: after `failure_threshold` consecutive failures
// - Open -> HalfOpen: once `timeout` has elapsed since the last state change
// - HalfOpen -> Closed: after `success_threshold` consecutive successes
// - HalfOpen -> Open: on any failure
//
// All transitions for one breaker happen under its own mutex, so concurrent
// outcome reports are linearized. Telemetry is emitted after the lock is
// released.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use super::error::RoutingError;
use super::record::{Outcome, ServerId};
use super::telemetry::{TelemetryEvent, TelemetryKind, TelemetrySink};
use crate::config::BreakerConfig;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Normal operation, requests flow through
    Closed,

    /// Requests rejected without being attempted
    Open,

    /// A limited number of trial requests are let through
    HalfOpen,
}

impl BreakerState {
    /// Stable lowercase name used in logs and telemetry.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    trials_remaining: u32,
    last_state_change: Instant,
    last_state_change_at: DateTime<Utc>,
    last_failure_at: Option<DateTime<Utc>>,
    total_requests: u64,
    total_successes: u64,
    total_failures: u64,
    total_timeouts: u64,
    total_rejections: u64,
    times_opened: u64,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            trials_remaining: 0,
            last_state_change: Instant::now(),
            last_state_change_at: Utc::now(),
            last_failure_at: None,
            total_requests: 0,
            total_successes: 0,
            total_failures: 0,
            total_timeouts: 0,
            total_rejections: 0,
            times_opened: 0,
        }
    }

    /// Move to `to`, resetting the consecutive counters.
    fn transition(&mut self, to: BreakerState, trials: u32) -> Transition {
        let from = self.state;
        self.state = to;
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.trials_remaining = if to == BreakerState::HalfOpen { trials } else { 0 };
        self.last_state_change = Instant::now();
        self.last_state_change_at = Utc::now();
        if to == BreakerState::Open {
            self.times_opened += 1;
        }
        Transition { from, to }
    }
}

#[derive(Debug, Clone, Copy)]
struct Transition {
    from: BreakerState,
    to: BreakerState,
}

/// Point-in-time view of a breaker for dashboards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    /// Current state
    pub state: BreakerState,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Successes since the last failure
    pub consecutive_successes: u32,
    /// Trial requests still available while half-open
    pub half_open_trials_remaining: u32,
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again
    pub success_threshold: u32,
    /// How long the circuit stays open before a trial
    pub timeout_ms: u64,
    /// When the most recent failure was recorded
    pub last_failure_at: Option<DateTime<Utc>>,
    /// When the state last changed
    pub last_state_change_at: DateTime<Utc>,
    /// Time until a trial is admitted, while not closed
    pub retry_after_ms: Option<u64>,
    /// Outcomes recorded (successes, failures and timeouts)
    pub total_requests: u64,
    /// Successful calls
    pub total_successes: u64,
    /// Failed calls, timeouts included
    pub total_failures: u64,
    /// Calls that failed by timing out
    pub total_timeouts: u64,
    /// Requests turned away without an attempt
    pub total_rejections: u64,
    /// Times the circuit has tripped open
    pub times_opened: u64,
}

/// Circuit breaker for one (server, logical service) pair.
pub struct CircuitBreaker {
    server_id: ServerId,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("server_id", &self.server_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(server_id: ServerId, config: BreakerConfig, telemetry: Arc<dyn TelemetrySink>) -> Self {
        Self {
            server_id,
            config,
            inner: Mutex::new(BreakerInner::new()),
            telemetry,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Server this breaker guards.
    pub fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    /// Current state. An expired open window is not promoted here;
    /// that happens on the next admission check.
    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Whether a request would currently be let through, without consuming
    /// a half-open trial. Used by the router when walking candidates.
    pub fn is_admitting(&self) -> bool {
        let inner = self.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => inner.last_state_change.elapsed() >= self.config.timeout,
            BreakerState::HalfOpen => {
                inner.trials_remaining > 0 || inner.last_state_change.elapsed() >= self.config.timeout
            }
        }
    }

    /// Admit one attempt, consuming a half-open trial when applicable.
    pub fn can_attempt(&self) -> bool {
        self.check().is_ok()
    }

    /// Admit one attempt or explain why it is rejected.
    ///
    /// # Errors
    ///
    /// Returns `RoutingError::CircuitOpen` while the breaker is open, or
    /// while half-open with its trial budget spent.
    pub fn check(&self) -> Result<(), RoutingError> {
        let timeout = self.config.timeout;
        let trials = self.config.half_open_trials();

        let (result, transition) = {
            let mut inner = self.lock();
            let elapsed = inner.last_state_change.elapsed();
            match inner.state {
                BreakerState::Closed => (Ok(()), None),
                BreakerState::Open if elapsed >= timeout => {
                    let t = inner.transition(BreakerState::HalfOpen, trials);
                    inner.trials_remaining -= 1;
                    (Ok(()), Some(t))
                }
                BreakerState::Open => {
                    inner.total_rejections += 1;
                    (Err(timeout - elapsed), None)
                }
                BreakerState::HalfOpen => {
                    // Trials that never reported back are re-armed after another timeout
                    if inner.trials_remaining == 0 && elapsed >= timeout {
                        inner.trials_remaining = trials;
                        inner.last_state_change = Instant::now();
                    }
                    if inner.trials_remaining > 0 {
                        inner.trials_remaining -= 1;
                        (Ok(()), None)
                    } else {
                        inner.total_rejections += 1;
                        (Err(timeout.saturating_sub(elapsed)), None)
                    }
                }
            }
        };

        if let Some(transition) = transition {
            self.announce(transition, None);
        }

        result.map_err(|retry_after| RoutingError::CircuitOpen {
            server_id: self.server_id.clone(),
            retry_after,
        })
    }

    /// Hand back a half-open trial admitted by `check` whose call was never
    /// attempted.
    pub fn release_trial(&self) {
        let mut inner = self.lock();
        if inner.state == BreakerState::HalfOpen {
            inner.trials_remaining = (inner.trials_remaining + 1).min(self.config.half_open_trials());
        }
    }

    /// Feed the outcome of one attempted call into the state machine.
    pub fn report_outcome(&self, outcome: Outcome) {
        let transition = {
            let mut inner = self.lock();
            inner.total_requests += 1;
            match outcome {
                Outcome::Success => inner.total_successes += 1,
                Outcome::Failure => inner.total_failures += 1,
                Outcome::Timeout => {
                    inner.total_failures += 1;
                    inner.total_timeouts += 1;
                }
            }
            if !outcome.is_success() {
                inner.last_failure_at = Some(Utc::now());
            }

            match (inner.state, outcome.is_success()) {
                (BreakerState::Closed, true) => {
                    inner.consecutive_failures = 0;
                    None
                }
                (BreakerState::Closed, false) => {
                    inner.consecutive_failures += 1;
                    if inner.consecutive_failures >= self.config.failure_threshold {
                        Some(inner.transition(BreakerState::Open, 0))
                    } else {
                        None
                    }
                }
                (BreakerState::HalfOpen, true) => {
                    inner.consecutive_successes += 1;
                    if inner.consecutive_successes >= self.config.success_threshold {
                        Some(inner.transition(BreakerState::Closed, 0))
                    } else {
                        None
                    }
                }
                (BreakerState::HalfOpen, false) => {
                    let t = inner.transition(BreakerState::Open, 0);
                    inner.consecutive_failures = 1;
                    Some(t)
                }
                // Late reports from calls admitted before the breaker opened
                (BreakerState::Open, _) => None,
            }
        };

        if let Some(transition) = transition {
            self.announce(transition, None);
        }
    }

    /// Operator override. Returns the previous state.
    pub fn force_state(&self, state: BreakerState, principal: &str) -> BreakerState {
        let transition = self
            .lock()
            .transition(state, self.config.half_open_trials());
        warn!(
            server = %self.server_id,
            from = %transition.from,
            to = %transition.to,
            principal,
            "Circuit breaker state forced by operator"
        );
        self.announce(transition, Some(principal));
        transition.from
    }

    /// Time until the breaker will admit a trial, if it is rejecting.
    pub fn retry_after(&self) -> Option<Duration> {
        let inner = self.lock();
        let elapsed = inner.last_state_change.elapsed();
        match inner.state {
            BreakerState::Closed => None,
            BreakerState::Open => Some(self.config.timeout.saturating_sub(elapsed)),
            BreakerState::HalfOpen if inner.trials_remaining > 0 => None,
            BreakerState::HalfOpen => Some(self.config.timeout.saturating_sub(elapsed)),
        }
    }

    /// Copy of the counters and state for dashboards.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let retry_after = self.retry_after();
        let inner = self.lock();
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            half_open_trials_remaining: inner.trials_remaining,
            failure_threshold: self.config.failure_threshold,
            success_threshold: self.config.success_threshold,
            timeout_ms: millis(self.config.timeout),
            last_failure_at: inner.last_failure_at,
            last_state_change_at: inner.last_state_change_at,
            retry_after_ms: retry_after.map(millis),
            total_requests: inner.total_requests,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            total_timeouts: inner.total_timeouts,
            total_rejections: inner.total_rejections,
            times_opened: inner.times_opened,
        }
    }

    fn announce(&self, transition: Transition, forced_by: Option<&str>) {
        let snapshot = self.snapshot();
        if forced_by.is_none() {
            info!(
                server = %self.server_id,
                from = %transition.from,
                to = %transition.to,
                total_failures = snapshot.total_failures,
                "Circuit breaker transition"
            );
        }

        let (kind, detail) = match forced_by {
            Some(principal) => (
                TelemetryKind::BreakerForced,
                format!("{} -> {} by {principal}", transition.from, transition.to),
            ),
            None => (
                TelemetryKind::BreakerTransition,
                format!("{} -> {}", transition.from, transition.to),
            ),
        };
        self.telemetry.emit(
            TelemetryEvent::new(kind, &self.server_id)
                .with_detail(detail)
                .with_counter("total_requests", snapshot.total_requests)
                .with_counter("total_failures", snapshot.total_failures)
                .with_counter("total_timeouts", snapshot.total_timeouts)
                .with_counter("times_opened", snapshot.times_opened),
        );
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
