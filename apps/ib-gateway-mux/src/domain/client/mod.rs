//! Client Connections
//!
//! Domain types for downstream clients sharing the gateway session.
//!
//! A `ClientConnection` never holds anything session related; it only owns
//! the client's identity, permissions, rate window and usage counters. Rate
//! state sits behind a per-connection lock so clients never contend on each
//! other's counters.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::domain::operation::{Operation, PermissionSet};
use crate::domain::rate_limit::{FixedWindow, RateLimitPolicy, RatePermit, WindowExhausted};

// =============================================================================
// Identifiers
// =============================================================================

/// Process-unique client identifier. Never reused after removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ClientId(u64);

impl ClientId {
    /// Wrap a raw id.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw numeric value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Usage
// =============================================================================

/// Point-in-time usage figures for one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientUsage {
    /// Client id.
    pub client_id: ClientId,
    /// Transport-supplied identity.
    pub identity: String,
    /// Admission time.
    pub connected_at: DateTime<Utc>,
    /// Requests charged in the current rate window.
    pub window_request_count: u32,
    /// Configured cap per window.
    pub window_max_requests: u32,
    /// Requests routed since admission, including rejected ones.
    pub total_requests: u64,
    /// Requests that returned a gateway result.
    pub succeeded: u64,
    /// Requests that failed after passing admission checks.
    pub failed: u64,
    /// Requests rejected by the rate limiter.
    pub rate_limited: u64,
    /// Requests currently being routed.
    pub in_flight: usize,
    /// Seconds since the last request completed (or admission).
    pub idle_secs: u64,
}

// =============================================================================
// Connection
// =============================================================================

/// A connected downstream client.
#[derive(Debug)]
pub struct ClientConnection {
    id: ClientId,
    identity: String,
    connected_at: DateTime<Utc>,
    permissions: PermissionSet,
    window: Mutex<FixedWindow>,
    last_activity: Mutex<Instant>,
    in_flight: AtomicUsize,
    total_requests: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    rate_limited: AtomicU64,
}

impl ClientConnection {
    /// Create a connection admitted at `now` (wall time `connected_at`).
    #[must_use]
    pub fn new(
        id: ClientId,
        identity: impl Into<String>,
        permissions: PermissionSet,
        policy: RateLimitPolicy,
        now: Instant,
        connected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            identity: identity.into(),
            connected_at,
            permissions,
            window: Mutex::new(FixedWindow::new(policy, now)),
            last_activity: Mutex::new(now),
            in_flight: AtomicUsize::new(0),
            total_requests: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
        }
    }

    /// Client id.
    #[must_use]
    pub const fn id(&self) -> ClientId {
        self.id
    }

    /// Transport-supplied identity.
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Admission time.
    #[must_use]
    pub const fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Granted permissions.
    #[must_use]
    pub const fn permissions(&self) -> &PermissionSet {
        &self.permissions
    }

    /// Whether `op` was granted at admission.
    #[must_use]
    pub fn is_permitted(&self, op: Operation) -> bool {
        self.permissions.contains(op)
    }

    /// Reserve a slot in the client's rate window.
    ///
    /// # Errors
    ///
    /// Returns `WindowExhausted` if the window is at its cap.
    pub fn try_reserve(&self, now: Instant) -> Result<RatePermit, WindowExhausted> {
        let result = self.window.lock().try_acquire(now);
        if result.is_err() {
            self.rate_limited.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Give back a reservation that never reached the gateway.
    pub fn refund(&self, permit: RatePermit) {
        self.window.lock().refund(permit);
    }

    /// Requests charged in the current window.
    #[must_use]
    pub fn window_request_count(&self) -> u32 {
        self.window.lock().request_count()
    }

    /// Start of the current rate window.
    #[must_use]
    pub fn window_start(&self) -> Instant {
        self.window.lock().window_start()
    }

    /// Mark activity at `now`.
    pub fn touch(&self, now: Instant) {
        let mut last = self.last_activity.lock();
        if now > *last {
            *last = now;
        }
    }

    /// Time since the last recorded activity.
    #[must_use]
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_activity.lock())
    }

    /// Requests currently being routed for this client.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Count a routed request.
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Count the outcome of a request that passed admission checks.
    pub fn record_outcome(&self, succeeded: bool) {
        if succeeded {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Usage figures as of `now`.
    #[must_use]
    pub fn usage(&self, now: Instant) -> ClientUsage {
        let (window_request_count, window_max_requests) = {
            let window = self.window.lock();
            (window.request_count(), window.policy().max_requests)
        };

        ClientUsage {
            client_id: self.id,
            identity: self.identity.clone(),
            connected_at: self.connected_at,
            window_request_count,
            window_max_requests,
            total_requests: self.total_requests.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            in_flight: self.in_flight(),
            idle_secs: self.idle_for(now).as_secs(),
        }
    }
}

// =============================================================================
// In-flight Guard
// =============================================================================

/// Marks a request as in flight for its client until dropped.
///
/// Idle eviction skips connections with a non-zero in-flight count, so
/// holding a guard defers eviction until the request completes.
#[derive(Debug)]
pub struct InFlightGuard {
    connection: Arc<ClientConnection>,
}

impl InFlightGuard {
    /// Register a new in-flight request on `connection`.
    #[must_use]
    pub fn begin(connection: Arc<ClientConnection>) -> Self {
        connection.in_flight.fetch_add(1, Ordering::SeqCst);
        Self { connection }
    }
}

impl Deref for InFlightGuard {
    type Target = ClientConnection;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.connection.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
