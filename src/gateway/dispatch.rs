// ABOUTME: Per-server dispatcher draining the request queue into pooled connections
//
// One dispatcher task runs per server. It takes a semaphore permit before
// dequeuing so at most `max_concurrent` requests are in progress, then
// processes each entry on its own task:
//
//   breaker.check -> pool.acquire -> call (processing timeout)
//     -> release -> queue.complete -> breaker + registry outcome -> reply

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use super::breaker::CircuitBreaker;
use super::error::{RoutingError, Stage};
use super::pool::PoolManager;
use super::queue::{Completion, Dequeued, RequestQueue, Ticket};
use super::record::{Outcome, ServerId};
use super::registry::{HealthUpdate, ServerRegistry, UpdateSource};
use super::transport::{CallError, McpRequest};

/// Why a dispatched request did not produce a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchFailure {
    pub error: RoutingError,
    /// Whether the request was handed to the server. Unsent requests are
    /// safe to try on another server.
    pub attempted: bool,
}

impl DispatchFailure {
    pub const fn not_attempted(error: RoutingError) -> Self {
        Self {
            error,
            attempted: false,
        }
    }

    pub const fn attempted(error: RoutingError) -> Self {
        Self {
            error,
            attempted: true,
        }
    }
}

pub type DispatchResult = Result<Value, DispatchFailure>;

/// Queue payload: the request plus where to send its result.
#[derive(Debug)]
pub struct PendingCall {
    pub request: McpRequest,
    /// Named pool; the server's default pool when `None`
    pub pool: Option<String>,
    pub reply: oneshot::Sender<DispatchResult>,
}

impl PendingCall {
    pub fn new(request: McpRequest, pool: Option<String>) -> (Self, oneshot::Receiver<DispatchResult>) {
        let (reply, rx) = oneshot::channel();
        (Self { request, pool, reply }, rx)
    }

    /// Answer without attempting; used for backlog rejected at teardown.
    pub fn reject(self, error: RoutingError) {
        let _ = self.reply.send(Err(DispatchFailure::not_attempted(error)));
    }
}

/// Moves queued requests for one server onto its connections.
pub struct Dispatcher {
    server_id: ServerId,
    queue: Arc<RequestQueue<PendingCall>>,
    breaker: Arc<CircuitBreaker>,
    pools: Arc<PoolManager>,
    registry: Arc<ServerRegistry>,
    limit: Arc<Semaphore>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("server_id", &self.server_id)
            .field("available_permits", &self.limit.available_permits())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        server_id: ServerId,
        queue: Arc<RequestQueue<PendingCall>>,
        breaker: Arc<CircuitBreaker>,
        pools: Arc<PoolManager>,
        registry: Arc<ServerRegistry>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            server_id,
            queue,
            breaker,
            pools,
            registry,
            limit: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Run until the queue is closed and empty.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(self: Arc<Self>) {
        debug!(server = %self.server_id, "Dispatcher started");
        loop {
            let Ok(permit) = Arc::clone(&self.limit).acquire_owned().await else {
                break;
            };
            let Some(entry) = self.queue.next().await else {
                break;
            };
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                let _permit = permit;
                this.process(entry).await;
            });
        }
        debug!(server = %self.server_id, "Dispatcher stopped");
    }

    /// Permits not currently held by an in-progress request.
    pub fn available_permits(&self) -> usize {
        self.limit.available_permits()
    }

    /// Process one dequeued entry to completion. The ticket is completed
    /// and the caller answered on every path.
    pub async fn process(&self, entry: Dequeued<PendingCall>) {
        let Dequeued { ticket, payload } = entry;
        let PendingCall { request, pool, mut reply } = payload;

        if reply.is_closed() {
            self.queue.complete(&ticket, Completion::Cancelled);
            return;
        }

        let waited = ticket.waited();
        if waited > self.queue.max_wait() {
            self.queue.complete(&ticket, Completion::Timeout);
            let _ = reply.send(Err(DispatchFailure::not_attempted(RoutingError::Timeout {
                server_id: self.server_id.clone(),
                stage: Stage::Queue,
                elapsed: waited,
            })));
            return;
        }

        if let Err(error) = self.breaker.check() {
            self.queue.complete(&ticket, Completion::Rejected);
            let _ = reply.send(Err(DispatchFailure::not_attempted(error)));
            return;
        }

        let pool_name = pool.unwrap_or_else(|| self.pools.default_pool_name().to_string());
        let acquired = match self.pools.pool(&pool_name) {
            Ok(pool) => tokio::select! {
                acquired = pool.acquire() => Some(acquired.map(|conn| (pool, conn))),
                () = reply.closed() => None,
            },
            Err(error) => Some(Err(error)),
        };
        let Some(acquired) = acquired else {
            self.abandon(&ticket, "waiting for a connection");
            return;
        };
        let (pool, mut conn) = match acquired {
            Ok(acquired) => acquired,
            Err(error) => {
                // Connect failures say something about the server; capacity
                // and pool-health gating do not, so the trial is refunded.
                let outcome = match &error {
                    RoutingError::Transport { .. } => Some(Outcome::Failure),
                    RoutingError::Timeout { .. } => Some(Outcome::Timeout),
                    _ => None,
                };
                match outcome {
                    Some(outcome) => {
                        self.queue.complete(&ticket, Completion::Error);
                        self.report(outcome, None);
                    }
                    None => {
                        self.breaker.release_trial();
                        self.queue.complete(&ticket, Completion::Rejected);
                        debug!(server = %self.server_id, reason = error.reason(), "Request not attempted");
                    }
                }
                let _ = reply.send(Err(DispatchFailure::not_attempted(error)));
                return;
            }
        };

        let started = Instant::now();
        let result = tokio::select! {
            result = tokio::time::timeout(self.queue.processing_timeout(), conn.call(&request)) => Some(result),
            () = reply.closed() => None,
        };
        let Some(result) = result else {
            // The response can no longer be read off this connection
            conn.mark_broken();
            drop(conn);
            self.abandon(&ticket, "in flight");
            return;
        };
        let elapsed = started.elapsed();

        let (outcome, completion, response) = match result {
            Ok(Ok(value)) => (Outcome::Success, Completion::Success, Ok(value)),
            Ok(Err(CallError::Protocol { code, message })) => (
                Outcome::Failure,
                Completion::Error,
                Err(RoutingError::Protocol {
                    server_id: self.server_id.clone(),
                    code,
                    message,
                }),
            ),
            Ok(Err(other)) => {
                conn.mark_broken();
                (
                    Outcome::Failure,
                    Completion::Error,
                    Err(RoutingError::Transport {
                        server_id: self.server_id.clone(),
                        message: other.to_string(),
                    }),
                )
            }
            Err(_) => {
                conn.mark_broken();
                pool.record_timeout();
                (
                    Outcome::Timeout,
                    Completion::Timeout,
                    Err(RoutingError::Timeout {
                        server_id: self.server_id.clone(),
                        stage: Stage::Call,
                        elapsed,
                    }),
                )
            }
        };

        conn.release();
        self.queue.complete(&ticket, completion);
        self.report(outcome, outcome.is_success().then_some(elapsed));

        if reply
            .send(response.map_err(DispatchFailure::attempted))
            .is_err()
        {
            debug!(server = %self.server_id, ticket = ticket.id, "Caller went away before the reply");
        }
    }

    /// The caller stopped waiting: give back the trial and the slot without
    /// reporting an outcome.
    fn abandon(&self, ticket: &Ticket, stage: &'static str) {
        self.breaker.release_trial();
        self.queue.complete(ticket, Completion::Cancelled);
        debug!(server = %self.server_id, ticket = ticket.id, stage, "Caller went away, request abandoned");
    }

    fn report(&self, outcome: Outcome, latency: Option<Duration>) {
        self.breaker.report_outcome(outcome);
        self.registry.update_health(
            &self.server_id,
            HealthUpdate {
                source: UpdateSource::Request,
                outcome,
                latency,
            },
        );
    }
}
