// ABOUTME: Request routing: candidate lookup, breaker/pool gating, admission and fall-through

use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use super::auth::Principal;
use super::dispatch::PendingCall;
use super::error::{RoutingError, Stage};
use super::queue::{Priority, RequestQueue, Ticket};
use super::transport::McpRequest;
use super::Gateway;

/// A request addressed by capability rather than by server.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteRequest {
    pub capability: String,
    pub request: McpRequest,
    pub priority: Priority,
    /// Named connection pool; the server's default when `None`
    pub pool: Option<String>,
}

impl RouteRequest {
    pub fn new(capability: impl Into<String>, request: McpRequest) -> Self {
        Self {
            capability: capability.into(),
            request,
            priority: Priority::default(),
            pool: None,
        }
    }

    /// `tools/call` for `tool`, routed by the tool name.
    pub fn tool_call(tool: &str, arguments: Value) -> Self {
        Self::new(tool, McpRequest::tool_call(tool, arguments))
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = Some(pool.into());
        self
    }
}

/// Pulls a routed request back out of its queue if the caller stops
/// waiting (dropped future or budget timeout) before it was dequeued.
struct QueuedGuard<'a> {
    queue: &'a RequestQueue<PendingCall>,
    ticket: Ticket,
}

impl Drop for QueuedGuard<'_> {
    fn drop(&mut self) {
        self.queue.cancel(&self.ticket);
    }
}

fn soonest(current: Option<Duration>, candidate: Option<Duration>) -> Option<Duration> {
    match (current, candidate) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

impl Gateway {
    /// Route `request` to the best server advertising its capability.
    ///
    /// Candidates are tried in registry order. A candidate is skipped when
    /// its breaker is not admitting or its pool is unhealthy, and the next
    /// one is tried when admission rejects the request or the dispatcher
    /// gives up before sending it. Failures after the request reached a
    /// server are returned as-is.
    ///
    /// # Errors
    ///
    /// - `NoCapableServer` when nothing visible advertises the capability
    /// - `AllServersDown` when every candidate is gated by breaker or pool
    /// - `NoAvailableServer` when candidates exist but none took the request
    /// - server-local errors (`Timeout`, `Transport`, `Protocol`) from the
    ///   server that handled it
    pub async fn route(&self, principal: &Principal, request: RouteRequest) -> Result<Value, RoutingError> {
        let inner = &self.inner;
        inner.metrics.request_started();

        let tenant = principal.tenant();
        let candidates = inner.registry.lookup(&request.capability, tenant);
        if candidates.is_empty() {
            inner.metrics.request_rejected();
            return Err(RoutingError::NoCapableServer {
                capability: request.capability,
            });
        }

        let budget = inner.config.queue.max_wait
            + inner.config.pool.acquire_timeout
            + inner.config.queue.processing_timeout;
        let mut down = 0usize;
        let mut retry_after = None;

        for record in &candidates {
            let Some(runtime) = inner.runtime(&record.id) else {
                continue;
            };

            if !runtime.breaker.is_admitting() {
                down += 1;
                retry_after = soonest(retry_after, runtime.breaker.retry_after());
                debug!(server = %record.id, "Skipping candidate with open breaker");
                continue;
            }
            let pool_name = request
                .pool
                .as_deref()
                .unwrap_or_else(|| runtime.pools.default_pool_name());
            if runtime.pools.is_unhealthy(pool_name) {
                down += 1;
                debug!(server = %record.id, pool = pool_name, "Skipping candidate with unhealthy pool");
                continue;
            }

            let (call, reply) = PendingCall::new(request.request.clone(), request.pool.clone());
            let ticket = match runtime.queue.enqueue(tenant, request.priority, call) {
                Ok(ticket) => ticket,
                Err(error) => {
                    retry_after = soonest(retry_after, error.retry_after());
                    debug!(server = %record.id, reason = error.reason(), "Candidate rejected request");
                    inner.metrics.fallthrough();
                    continue;
                }
            };
            let queued = QueuedGuard {
                queue: &runtime.queue,
                ticket,
            };

            match tokio::time::timeout(budget, reply).await {
                Ok(Ok(Ok(value))) => {
                    inner.metrics.request_succeeded();
                    return Ok(value);
                }
                Ok(Ok(Err(failure))) if !failure.attempted => {
                    if failure.error.is_server_down() {
                        down += 1;
                    }
                    retry_after = soonest(retry_after, failure.error.retry_after());
                    debug!(
                        server = %record.id,
                        reason = failure.error.reason(),
                        "Request not attempted, trying next candidate"
                    );
                    inner.metrics.fallthrough();
                }
                Ok(Ok(Err(failure))) => {
                    inner.metrics.request_failed();
                    return Err(failure.error);
                }
                Ok(Err(_)) => {
                    // Dispatcher dropped the request during teardown
                    inner.metrics.fallthrough();
                }
                Err(_) => {
                    // Frees the queue slot if still waiting; a dequeued
                    // request is abandoned by the dispatcher once the reply
                    // channel closes.
                    drop(queued);
                    warn!(server = %record.id, budget_ms = budget.as_millis() as u64, "Routed request exceeded its budget");
                    inner.metrics.request_failed();
                    return Err(RoutingError::Timeout {
                        server_id: record.id.clone(),
                        stage: Stage::Queue,
                        elapsed: budget,
                    });
                }
            }
        }

        inner.metrics.request_rejected();
        let capability = request.capability;
        if down == candidates.len() {
            Err(RoutingError::AllServersDown {
                capability,
                retry_after,
            })
        } else {
            Err(RoutingError::NoAvailableServer {
                capability,
                retry_after,
            })
        }
    }
}
