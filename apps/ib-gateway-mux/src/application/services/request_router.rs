//! Request Router
//!
//! Turns a client-tagged request into at most one gateway call. Checks run in
//! a fixed order and each has its own failure:
//!
//! 1. the client exists (`NotFound`)
//! 2. the operation is in its permissions (`PermissionDenied`)
//! 3. its rate window has room (`RateLimitExceeded`)
//! 4. a session can be acquired (`SessionUnavailable` / `FatalSession`)
//! 5. the gateway call succeeds before `call_timeout` (`Upstream`)
//!
//! A rate slot reserved in step 3 is refunded if step 4 fails. Nothing is
//! retried.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio_util::task::TaskTracker;

use crate::application::ports::{Clock, GatewayError};
use crate::application::services::client_registry::ClientRegistry;
use crate::application::services::session::{SessionHandle, SessionManager};
use crate::domain::client::ClientId;
use crate::domain::operation::Operation;
use crate::domain::request::{Params, Request, Response};
use crate::error::ProxyError;
use crate::infrastructure::metrics::{self, RequestOutcome};

// =============================================================================
// Configuration
// =============================================================================

/// How authenticated calls share the session.
///
/// The gateway accepts concurrent requests on one session, so `Concurrent` is
/// the default. `SingleFlight` pushes every call through one gate, for
/// gateways that misbehave under parallel load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// Calls run in parallel.
    #[default]
    Concurrent,
    /// One call at a time.
    SingleFlight,
}

impl DispatchMode {
    /// Configuration name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Concurrent => "concurrent",
            Self::SingleFlight => "single_flight",
        }
    }
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unrecognised dispatch mode name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown dispatch mode: {0} (expected concurrent or single_flight)")]
pub struct UnknownDispatchMode(pub String);

impl FromStr for DispatchMode {
    type Err = UnknownDispatchMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "concurrent" => Ok(Self::Concurrent),
            "single_flight" | "serial" => Ok(Self::SingleFlight),
            _ => Err(UnknownDispatchMode(s.to_string())),
        }
    }
}

/// Router timeouts and dispatch mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterConfig {
    /// How long a request waits for an authenticated session.
    pub acquire_timeout: Duration,
    /// Deadline for one gateway call.
    pub call_timeout: Duration,
    /// Parallel or serialized dispatch.
    pub dispatch_mode: DispatchMode,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(30),
            dispatch_mode: DispatchMode::Concurrent,
        }
    }
}

// =============================================================================
// Router
// =============================================================================

/// Routes client requests through the shared session.
#[derive(Debug)]
pub struct RequestRouter {
    registry: Arc<ClientRegistry>,
    sessions: Arc<SessionManager>,
    clock: Arc<dyn Clock>,
    config: RouterConfig,
    single_flight: tokio::sync::Mutex<()>,
    in_flight: TaskTracker,
    sequence: AtomicU64,
}

impl RequestRouter {
    /// Create a router over `registry` and `sessions`.
    #[must_use]
    pub fn new(
        registry: Arc<ClientRegistry>,
        sessions: Arc<SessionManager>,
        clock: Arc<dyn Clock>,
        config: RouterConfig,
    ) -> Self {
        Self {
            registry,
            sessions,
            clock,
            config,
            single_flight: tokio::sync::Mutex::new(()),
            in_flight: TaskTracker::new(),
            sequence: AtomicU64::new(0),
        }
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Build a request stamped with the current time and the next sequence
    /// number.
    #[must_use]
    pub fn request(&self, client_id: ClientId, operation: Operation, params: Params) -> Request {
        Request::new(
            client_id,
            operation,
            params,
            self.clock.now_utc(),
            self.next_sequence(),
        )
    }

    /// Answer a request that could not even be built (unknown identity or
    /// operation name).
    #[must_use]
    pub fn reject(&self, client_id: Option<ClientId>, error: ProxyError) -> Response {
        metrics::record_request(None, RequestOutcome::Error(error.code()));
        tracing::debug!(code = error.code(), error = %error, "Request rejected before routing");
        Response::rejected(client_id, self.clock.now_utc(), self.next_sequence(), error)
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Route one request and wrap the outcome.
    pub async fn route(&self, request: Request) -> Response {
        let result = self.dispatch(&request).await;

        match &result {
            Ok(_) => {
                metrics::record_request(Some(request.operation()), RequestOutcome::Success);
                tracing::debug!(
                    client_id = %request.client_id(),
                    operation = %request.operation(),
                    sequence = request.sequence(),
                    "Request completed"
                );
            }
            Err(err) => {
                metrics::record_request(Some(request.operation()), RequestOutcome::Error(err.code()));
                tracing::debug!(
                    client_id = %request.client_id(),
                    operation = %request.operation(),
                    sequence = request.sequence(),
                    code = err.code(),
                    class = %err.class(),
                    error = %err,
                    "Request failed"
                );
            }
        }

        request.respond(result)
    }

    /// Stop dispatching new calls and wait for dispatched ones to finish.
    ///
    /// Every dispatched call is bounded by `call_timeout`, so this returns
    /// within that bound.
    pub async fn shutdown(&self) {
        self.in_flight.close();
        tracing::info!(in_flight = self.in_flight.len(), "Draining dispatched gateway calls");
        self.in_flight.wait().await;
        tracing::info!("Request router drained");
    }

    /// Whether `shutdown` has begun.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.in_flight.is_closed()
    }

    /// Gateway calls currently dispatched.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    async fn dispatch(&self, request: &Request) -> Result<Value, ProxyError> {
        let operation = request.operation();

        // 1. client
        let connection = self.registry.checkout(request.client_id())?;
        connection.record_request();
        connection.touch(self.clock.monotonic_now());

        // 2. permission
        if !connection.is_permitted(operation) {
            return Err(ProxyError::denied(operation));
        }

        // 3. rate window
        let permit = connection
            .try_reserve(self.clock.monotonic_now())
            .map_err(|exhausted| ProxyError::RateLimitExceeded {
                retry_after: exhausted.retry_after,
            })?;

        if self.is_closed() {
            connection.refund(permit);
            connection.record_outcome(false);
            return Err(shutting_down());
        }

        // 4. session
        let handle = match self.sessions.acquire_session(self.config.acquire_timeout).await {
            Ok(handle) => handle,
            Err(err) => {
                connection.refund(permit);
                connection.record_outcome(false);
                return Err(err);
            }
        };

        // 5. dispatch
        let call = self
            .in_flight
            .track_future(self.call(&handle, operation, request.params()));
        if self.is_closed() {
            drop(call);
            connection.refund(permit);
            connection.record_outcome(false);
            return Err(shutting_down());
        }
        let result = call.await;
        connection.touch(self.clock.monotonic_now());

        match result {
            Ok(value) => {
                connection.record_outcome(true);
                Ok(value)
            }
            Err((cause, timed_out)) => {
                connection.record_outcome(false);
                metrics::record_gateway_error(cause.kind());
                tracing::warn!(
                    client_id = %request.client_id(),
                    operation = %operation,
                    generation = handle.generation(),
                    timed_out,
                    error = %cause,
                    "Gateway call failed"
                );
                self.sessions.report_failure(&handle, &cause);
                Err(ProxyError::Upstream { cause, timed_out })
            }
        }
    }

    async fn call(
        &self,
        handle: &SessionHandle,
        operation: Operation,
        params: &Params,
    ) -> Result<Value, (GatewayError, bool)> {
        let started = Instant::now();
        let dispatch = async {
            let _gate = match self.config.dispatch_mode {
                DispatchMode::SingleFlight => Some(self.single_flight.lock().await),
                DispatchMode::Concurrent => None,
            };
            handle.call(operation, params).await
        };

        let result = tokio::time::timeout(self.config.call_timeout, dispatch).await;
        metrics::record_gateway_call(operation, started.elapsed());

        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                let timed_out = matches!(err, GatewayError::Timeout);
                Err((err, timed_out))
            }
            Err(_) => Err((GatewayError::Timeout, true)),
        }
    }
}

fn shutting_down() -> ProxyError {
    ProxyError::SessionUnavailable {
        reason: "proxy is shutting down".to_string(),
    }
}
