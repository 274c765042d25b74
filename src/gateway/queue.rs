// ABOUTME: Per-server bounded priority queue with admission control
//
// Enqueue never blocks: a request is either admitted or rejected at once
// (not accepting, full, or rate limited). The server's dispatcher drains
// the queue highest priority first, FIFO within a level, and completes
// every dequeued ticket exactly once.

use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::error::RoutingError;
use super::metrics::{duration_ms, AtomicEma};
use super::rate_limit::RateLimiter;
use super::record::{ServerId, TenantId};
use super::telemetry::{TelemetryEvent, TelemetryKind, TelemetrySink};
use crate::config::{QueueConfig, RateLimitConfig};

/// Request priority; higher values are served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// Background work
    pub const LOW: Self = Self(0);
    /// Default for routed requests
    pub const NORMAL: Self = Self(1);
    /// Served ahead of everything else
    pub const HIGH: Self = Self(2);

    /// Index into a queue with `levels` priority levels.
    fn level(self, levels: usize) -> usize {
        usize::from(self.0).min(levels.saturating_sub(1))
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

/// Handle for one admitted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    /// Unique within the owning queue
    pub id: u64,
    /// Server whose queue admitted the request
    pub server_id: ServerId,
    /// Tenant charged by the rate limiter
    pub tenant: Option<TenantId>,
    /// Priority the request was admitted with
    pub priority: Priority,
    /// Admission time
    pub enqueued_at: Instant,
    /// Set when the dispatcher takes the entry
    pub dequeued_at: Option<Instant>,
}

impl Ticket {
    /// Time spent queued, up to dequeue (or now if still queued).
    pub fn waited(&self) -> Duration {
        self.dequeued_at
            .unwrap_or_else(Instant::now)
            .saturating_duration_since(self.enqueued_at)
    }
}

/// How a dequeued ticket finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Completion {
    /// The call returned a result
    Success,
    /// The call failed
    Error,
    /// The call, or the wait for it, ran out of time
    Timeout,
    /// Caller stopped waiting; no outcome was reported
    Cancelled,
    /// Not attempted: breaker, pool or wait-time rejection at dispatch
    Rejected,
}

/// An entry taken off the queue.
#[derive(Debug)]
pub struct Dequeued<T> {
    pub ticket: Ticket,
    pub payload: T,
}

struct QueueState<T> {
    levels: Vec<VecDeque<Dequeued<T>>>,
    size: usize,
    in_flight: HashSet<u64>,
    accepting: bool,
    closed: bool,
    next_id: u64,
}

/// Point-in-time view of a queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueSnapshot {
    /// Waiting entries allowed before rejection
    pub max_size: usize,
    /// Distinct priority levels served
    pub priority_levels: u8,
    /// Per-call processing deadline
    pub processing_timeout_ms: u64,
    /// Entries waiting
    pub size: usize,
    /// Entries dequeued and not yet completed
    pub in_flight: usize,
    /// False while paused or draining
    pub accepting: bool,
    /// Requests admitted
    pub total_enqueued: u64,
    /// Requests that ran to an outcome
    pub total_processed: u64,
    /// Completions that timed out
    pub total_timeouts: u64,
    /// Completions that failed
    pub total_errors: u64,
    /// Admissions refused, dispatch-time rejections and drained backlog
    pub total_rejected: u64,
    /// Requests whose caller stopped waiting
    pub total_cancelled: u64,
    /// Mean time between enqueue and dequeue
    pub avg_wait_time_ms: Option<f64>,
    /// Mean time between dequeue and completion
    pub avg_processing_time_ms: Option<f64>,
}

/// Bounded priority queue for one server.
pub struct RequestQueue<T> {
    server_id: ServerId,
    config: QueueConfig,
    limiter: RateLimiter,
    telemetry: Arc<dyn TelemetrySink>,
    state: Mutex<QueueState<T>>,
    available: Notify,
    idle: Notify,
    total_enqueued: AtomicU64,
    total_processed: AtomicU64,
    total_timeouts: AtomicU64,
    total_errors: AtomicU64,
    total_rejected: AtomicU64,
    total_cancelled: AtomicU64,
    wait_time: AtomicEma,
    processing_time: AtomicEma,
}

impl<T> fmt::Debug for RequestQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestQueue")
            .field("server_id", &self.server_id)
            .field("size", &self.len())
            .finish_non_exhaustive()
    }
}

enum Rejection {
    NotAccepting,
    Full,
    RateLimited(Duration),
}

impl<T> RequestQueue<T> {
    pub fn new(
        server_id: ServerId,
        config: QueueConfig,
        rate_limit: RateLimitConfig,
        smoothing: f64,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        let levels = usize::from(config.priority_levels.max(1));
        Self {
            server_id,
            limiter: RateLimiter::new(rate_limit),
            telemetry,
            state: Mutex::new(QueueState {
                levels: (0..levels).map(|_| VecDeque::new()).collect(),
                size: 0,
                in_flight: HashSet::new(),
                accepting: true,
                closed: false,
                next_id: 1,
            }),
            available: Notify::new(),
            idle: Notify::new(),
            total_enqueued: AtomicU64::new(0),
            total_processed: AtomicU64::new(0),
            total_timeouts: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
            total_cancelled: AtomicU64::new(0),
            wait_time: AtomicEma::new(smoothing),
            processing_time: AtomicEma::new(smoothing),
            config,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub const fn processing_timeout(&self) -> Duration {
        self.config.processing_timeout
    }

    pub const fn max_wait(&self) -> Duration {
        self.config.max_wait
    }

    pub const fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Admit a request or reject it immediately.
    ///
    /// # Errors
    ///
    /// - `NotAccepting` when the queue is closed or paused
    /// - `QueueFull` when `max_size` entries are waiting
    /// - `RateLimited` when the tenant's bucket for this server is empty
    pub fn enqueue(
        &self,
        tenant: Option<&TenantId>,
        priority: Priority,
        payload: T,
    ) -> Result<Ticket, RoutingError> {
        let admitted = {
            let mut state = self.lock();
            if state.closed || !state.accepting {
                Err(Rejection::NotAccepting)
            } else if state.size >= self.config.max_size {
                Err(Rejection::Full)
            } else if let Err(retry_after) = self.limiter.check(tenant) {
                Err(Rejection::RateLimited(retry_after))
            } else {
                let id = state.next_id;
                state.next_id += 1;
                let ticket = Ticket {
                    id,
                    server_id: self.server_id.clone(),
                    tenant: tenant.cloned(),
                    priority,
                    enqueued_at: Instant::now(),
                    dequeued_at: None,
                };
                let level = priority.level(state.levels.len());
                state.levels[level].push_back(Dequeued {
                    ticket: ticket.clone(),
                    payload,
                });
                state.size += 1;
                Ok(ticket)
            }
        };

        match admitted {
            Ok(ticket) => {
                self.total_enqueued.fetch_add(1, Ordering::Relaxed);
                self.available.notify_one();
                Ok(ticket)
            }
            Err(rejection) => Err(self.reject(tenant, rejection)),
        }
    }

    fn reject(&self, tenant: Option<&TenantId>, rejection: Rejection) -> RoutingError {
        let total = self.total_rejected.fetch_add(1, Ordering::Relaxed) + 1;
        let (kind, error) = match rejection {
            Rejection::NotAccepting => (
                TelemetryKind::QueueRejected,
                RoutingError::NotAccepting {
                    server_id: self.server_id.clone(),
                },
            ),
            Rejection::Full => (
                TelemetryKind::QueueRejected,
                RoutingError::QueueFull {
                    server_id: self.server_id.clone(),
                    capacity: self.config.max_size,
                },
            ),
            Rejection::RateLimited(retry_after) => (
                TelemetryKind::RateLimited,
                RoutingError::RateLimited {
                    server_id: self.server_id.clone(),
                    retry_after,
                },
            ),
        };

        debug!(
            server = %self.server_id,
            tenant = ?tenant.map(TenantId::as_str),
            reason = error.reason(),
            "Request rejected by admission control"
        );
        let mut event = TelemetryEvent::new(kind, &self.server_id)
            .with_detail(error.reason())
            .with_counter("total_rejected", total)
            .with_counter("max_size", self.config.max_size as u64);
        if let Some(tenant) = tenant {
            event = event.with_tenant(tenant);
        }
        self.telemetry.emit(event);
        error
    }

    /// Take the highest-priority entry, oldest first within its level.
    pub fn dequeue_next(&self) -> Option<Dequeued<T>> {
        let mut state = self.lock();
        let mut entry = state.levels.iter_mut().rev().find_map(VecDeque::pop_front)?;
        state.size -= 1;
        state.in_flight.insert(entry.ticket.id);
        entry.ticket.dequeued_at = Some(Instant::now());
        Some(entry)
    }

    /// Remove an entry that is still waiting, typically because its caller
    /// gave up. Returns `false` once the entry has been dequeued.
    pub fn cancel(&self, ticket: &Ticket) -> bool {
        let (removed, now_idle) = {
            let mut state = self.lock();
            let level = ticket.priority.level(state.levels.len());
            let Some(index) = state.levels[level]
                .iter()
                .position(|entry| entry.ticket.id == ticket.id)
            else {
                return false;
            };
            let removed = state.levels[level].remove(index);
            state.size -= 1;
            (removed, state.in_flight.is_empty() && state.size == 0)
        };
        drop(removed);

        self.total_cancelled.fetch_add(1, Ordering::Relaxed);
        debug!(server = %self.server_id, ticket = ticket.id, "Queued request cancelled");
        if now_idle {
            self.idle.notify_waiters();
        }
        true
    }

    /// Wait for the next entry. Returns `None` once the queue is closed.
    pub async fn next(&self) -> Option<Dequeued<T>> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(entry) = self.dequeue_next() {
                return Some(entry);
            }
            if self.lock().closed {
                return None;
            }
            notified.await;
        }
    }

    /// Finish a dequeued ticket. Returns `false` if it was already completed.
    pub fn complete(&self, ticket: &Ticket, completion: Completion) -> bool {
        let now_idle = {
            let mut state = self.lock();
            if !state.in_flight.remove(&ticket.id) {
                return false;
            }
            state.in_flight.is_empty() && state.size == 0
        };

        self.wait_time.record(duration_ms(ticket.waited()));
        let processing = ticket
            .dequeued_at
            .map(|at| at.elapsed())
            .unwrap_or_default();

        match completion {
            Completion::Success | Completion::Error | Completion::Timeout => {
                self.total_processed.fetch_add(1, Ordering::Relaxed);
                self.processing_time.record(duration_ms(processing));
            }
            Completion::Cancelled => {
                self.total_cancelled.fetch_add(1, Ordering::Relaxed);
            }
            Completion::Rejected => {
                self.total_rejected.fetch_add(1, Ordering::Relaxed);
            }
        }

        match completion {
            Completion::Error => {
                self.total_errors.fetch_add(1, Ordering::Relaxed);
            }
            Completion::Timeout => {
                let total = self.total_timeouts.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    server = %self.server_id,
                    ticket = ticket.id,
                    elapsed_ms = duration_ms(processing),
                    "Request timed out"
                );
                let mut event = TelemetryEvent::new(TelemetryKind::RequestTimeout, &self.server_id)
                    .with_counter("total_timeouts", total);
                if let Some(tenant) = &ticket.tenant {
                    event = event.with_tenant(tenant);
                }
                self.telemetry.emit(event);
            }
            _ => {}
        }

        if now_idle {
            self.idle.notify_waiters();
        }
        true
    }

    /// Pause or resume admission without discarding queued entries.
    pub fn set_accepting(&self, accepting: bool) {
        self.lock().accepting = accepting;
    }

    pub fn is_accepting(&self) -> bool {
        let state = self.lock();
        state.accepting && !state.closed
    }

    /// Stop admitting for good and hand back everything still queued.
    pub fn close(&self) -> Vec<Dequeued<T>> {
        let (backlog, now_idle) = {
            let mut state = self.lock();
            state.accepting = false;
            state.closed = true;
            state.size = 0;
            let backlog: Vec<_> = state.levels.iter_mut().rev().flat_map(|level| level.drain(..)).collect();
            (backlog, state.in_flight.is_empty())
        };

        self.total_rejected
            .fetch_add(backlog.len() as u64, Ordering::Relaxed);
        self.available.notify_waiters();
        if now_idle {
            self.idle.notify_waiters();
        }
        backlog
    }

    /// Wait until nothing is queued or in flight, up to `grace`.
    /// Returns whether the queue drained in time.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.lock();
                if state.in_flight.is_empty() && state.size == 0 {
                    return true;
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return false;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let (size, in_flight, accepting) = {
            let state = self.lock();
            (state.size, state.in_flight.len(), state.accepting && !state.closed)
        };
        QueueSnapshot {
            max_size: self.config.max_size,
            priority_levels: self.config.priority_levels,
            processing_timeout_ms: u64::try_from(self.config.processing_timeout.as_millis())
                .unwrap_or(u64::MAX),
            size,
            in_flight,
            accepting,
            total_enqueued: self.total_enqueued.load(Ordering::Relaxed),
            total_processed: self.total_processed.load(Ordering::Relaxed),
            total_timeouts: self.total_timeouts.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
            total_cancelled: self.total_cancelled.load(Ordering::Relaxed),
            avg_wait_time_ms: self.wait_time.get(),
            avg_processing_time_ms: self.processing_time.get(),
        }
    }
}
