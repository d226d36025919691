//! Status Monitor
//!
//! Read-only view over the session and the client directory. Building a
//! snapshot never mutates anything and never waits on gateway work.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::application::ports::Clock;
use crate::application::services::client_registry::ClientRegistry;
use crate::application::services::session::SessionManager;
use crate::domain::client::ClientUsage;
use crate::domain::session::SessionState;

/// Coarse health derived from the session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    /// Session authenticated.
    Healthy,
    /// Session connecting, degraded or reconnecting.
    Degraded,
    /// No session.
    Unhealthy,
}

impl Health {
    /// Health for a session state.
    #[must_use]
    pub const fn from_state(state: SessionState) -> Self {
        match state {
            SessionState::Authenticated => Self::Healthy,
            SessionState::Connecting | SessionState::Degraded | SessionState::Reconnecting => {
                Self::Degraded
            }
            SessionState::Disconnected => Self::Unhealthy,
        }
    }

    /// Wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

/// Point-in-time status of the proxy.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    /// Coarse health.
    pub health: Health,
    /// Session state.
    pub session_state: SessionState,
    /// Last successful heartbeat or login.
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Failed re-login attempts.
    pub reconnect_attempts: u32,
    /// Consecutive missed heartbeats.
    pub missed_heartbeats: u32,
    /// Session generation.
    pub generation: u64,
    /// Latched fatal error.
    pub fatal_error: Option<String>,
    /// Most recent session error.
    pub last_error: Option<String>,
    /// Connected clients.
    pub connected_client_count: usize,
    /// Usage per client, ordered by id.
    pub per_client_usage: Vec<ClientUsage>,
    /// Seconds since the monitor was created.
    pub uptime_secs: u64,
    /// Time the snapshot was taken.
    pub server_time: DateTime<Utc>,
}

/// Builds status snapshots.
#[derive(Debug)]
pub struct StatusMonitor {
    sessions: Arc<SessionManager>,
    registry: Arc<ClientRegistry>,
    clock: Arc<dyn Clock>,
    started_at: Instant,
}

impl StatusMonitor {
    /// Create a monitor; uptime counts from now.
    #[must_use]
    pub fn new(
        sessions: Arc<SessionManager>,
        registry: Arc<ClientRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let started_at = clock.monotonic_now();
        Self {
            sessions,
            registry,
            clock,
            started_at,
        }
    }

    /// Current status.
    #[must_use]
    pub fn snapshot(&self) -> StatusSnapshot {
        let session = self.sessions.status();
        let per_client_usage = self.registry.usage();

        StatusSnapshot {
            health: Health::from_state(session.state),
            session_state: session.state,
            last_heartbeat_at: session.last_heartbeat_at,
            reconnect_attempts: session.reconnect_attempts,
            missed_heartbeats: session.missed_heartbeats,
            generation: session.generation,
            fatal_error: session.fatal_error,
            last_error: session.last_error,
            connected_client_count: per_client_usage.len(),
            per_client_usage,
            uptime_secs: self
                .clock
                .monotonic_now()
                .saturating_duration_since(self.started_at)
                .as_secs(),
            server_time: self.clock.now_utc(),
        }
    }

    /// Current health only.
    #[must_use]
    pub fn health(&self) -> Health {
        Health::from_state(self.sessions.state())
    }
}
