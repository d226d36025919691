//! Upstream Session State Machine
//!
//! The single authenticated channel to the gateway. Only the session manager
//! mutates a `Session`; everything else sees copies through `SessionView`.
//!
//! # State Machine
//!
//! ```text
//! DISCONNECTED  → CONNECTING     (start / first request)
//! CONNECTING    → AUTHENTICATED  (login ok)
//! CONNECTING    → DISCONNECTED   (retries exhausted / credential error)
//! AUTHENTICATED → DEGRADED       (heartbeat missed)
//! AUTHENTICATED → RECONNECTING   (session lost)
//! DEGRADED      → AUTHENTICATED  (heartbeat ok)
//! DEGRADED      → RECONNECTING   (too many consecutive misses)
//! RECONNECTING  → AUTHENTICATED  (re-login ok)
//! RECONNECTING  → DISCONNECTED   (retry budget exhausted / credential error)
//! any           → DISCONNECTED   (shutdown)
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    /// No session and no attempt in progress.
    #[default]
    Disconnected,
    /// Initial login in progress.
    Connecting,
    /// Logged in and answering heartbeats.
    Authenticated,
    /// Logged in but recent heartbeats failed.
    Degraded,
    /// Session considered lost; re-login with backoff.
    Reconnecting,
}

impl SessionState {
    /// Upper-case name used in logs and status output.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Authenticated => "AUTHENTICATED",
            Self::Degraded => "DEGRADED",
            Self::Reconnecting => "RECONNECTING",
        }
    }

    /// Numeric encoding for the state gauge.
    #[must_use]
    pub const fn as_gauge(&self) -> f64 {
        match self {
            Self::Disconnected => 0.0,
            Self::Connecting => 1.0,
            Self::Authenticated => 2.0,
            Self::Degraded => 3.0,
            Self::Reconnecting => 4.0,
        }
    }

    /// Whether a transition from `self` to `next` is part of the machine.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (_, Self::Disconnected)
                | (Self::Disconnected, Self::Connecting)
                | (
                    Self::Connecting | Self::Degraded | Self::Reconnecting,
                    Self::Authenticated
                )
                | (Self::Authenticated, Self::Degraded)
                | (Self::Authenticated | Self::Degraded, Self::Reconnecting)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state change that actually happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// State before.
    pub from: SessionState,
    /// State after.
    pub to: SessionState,
}

/// Read-only copy of the session, published to watchers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionView {
    /// Current state.
    pub state: SessionState,
    /// Last successful heartbeat or login.
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Failed re-login attempts since the session was lost.
    pub reconnect_attempts: u32,
    /// Consecutive missed heartbeats.
    pub missed_heartbeats: u32,
    /// Incremented every time the session becomes authenticated.
    pub generation: u64,
    /// Latched error that requires an explicit restart.
    pub fatal_error: Option<String>,
    /// Most recent non-fatal error.
    pub last_error: Option<String>,
    /// When the state last changed.
    pub last_transition_at: DateTime<Utc>,
}

impl SessionView {
    /// Whether requests can be dispatched right now.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self.state, SessionState::Authenticated)
    }

    /// Whether a fatal error is latched.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        self.fatal_error.is_some()
    }
}

/// The upstream session.
#[derive(Debug, Clone)]
pub struct Session {
    state: SessionState,
    credentials_ref: String,
    last_heartbeat_at: Option<DateTime<Utc>>,
    reconnect_attempts: u32,
    missed_heartbeats: u32,
    generation: u64,
    fatal_error: Option<String>,
    last_error: Option<String>,
    last_transition_at: DateTime<Utc>,
}

impl Session {
    /// A disconnected session for the given credential reference.
    #[must_use]
    pub fn new(credentials_ref: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            state: SessionState::Disconnected,
            credentials_ref: credentials_ref.into(),
            last_heartbeat_at: None,
            reconnect_attempts: 0,
            missed_heartbeats: 0,
            generation: 0,
            fatal_error: None,
            last_error: None,
            last_transition_at: now,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Credential reference this session logs in with.
    #[must_use]
    pub fn credentials_ref(&self) -> &str {
        &self.credentials_ref
    }

    /// Current generation.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Failed re-login attempts.
    #[must_use]
    pub const fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// Consecutive missed heartbeats.
    #[must_use]
    pub const fn missed_heartbeats(&self) -> u32 {
        self.missed_heartbeats
    }

    /// Latched fatal error, if any.
    #[must_use]
    pub fn fatal_error(&self) -> Option<&str> {
        self.fatal_error.as_deref()
    }

    /// Snapshot for watchers.
    #[must_use]
    pub fn view(&self) -> SessionView {
        SessionView {
            state: self.state,
            last_heartbeat_at: self.last_heartbeat_at,
            reconnect_attempts: self.reconnect_attempts,
            missed_heartbeats: self.missed_heartbeats,
            generation: self.generation,
            fatal_error: self.fatal_error.clone(),
            last_error: self.last_error.clone(),
            last_transition_at: self.last_transition_at,
        }
    }

    /// DISCONNECTED → CONNECTING. No-op from any other state or while a
    /// fatal error is latched.
    pub fn begin_connecting(&mut self, now: DateTime<Utc>) -> Option<Transition> {
        if self.fatal_error.is_some() || self.state != SessionState::Disconnected {
            return None;
        }
        self.last_error = None;
        self.move_to(SessionState::Connecting, now)
    }

    /// Login succeeded.
    pub fn authenticated(&mut self, now: DateTime<Utc>) -> Option<Transition> {
        if !self.state.can_transition_to(SessionState::Authenticated) {
            return None;
        }
        self.generation += 1;
        self.reconnect_attempts = 0;
        self.missed_heartbeats = 0;
        self.last_heartbeat_at = Some(now);
        self.last_error = None;
        self.move_to(SessionState::Authenticated, now)
    }

    /// Heartbeat answered. Recovers DEGRADED → AUTHENTICATED.
    pub fn heartbeat_ok(&mut self, now: DateTime<Utc>) -> Option<Transition> {
        if !matches!(
            self.state,
            SessionState::Authenticated | SessionState::Degraded
        ) {
            return None;
        }
        self.missed_heartbeats = 0;
        self.last_heartbeat_at = Some(now);
        if self.state == SessionState::Degraded {
            self.last_error = None;
            return self.move_to(SessionState::Authenticated, now);
        }
        None
    }

    /// Heartbeat missed. AUTHENTICATED → DEGRADED on the first miss,
    /// → RECONNECTING once `max_missed` consecutive misses accumulate.
    pub fn heartbeat_missed(
        &mut self,
        now: DateTime<Utc>,
        max_missed: u32,
        reason: &str,
    ) -> Option<Transition> {
        if !matches!(
            self.state,
            SessionState::Authenticated | SessionState::Degraded
        ) {
            return None;
        }
        self.missed_heartbeats += 1;
        self.last_error = Some(reason.to_string());

        if self.missed_heartbeats >= max_missed.max(1) {
            return self.begin_reconnecting(now, reason);
        }
        if self.state == SessionState::Authenticated {
            return self.move_to(SessionState::Degraded, now);
        }
        None
    }

    /// A call failure pointed at a transport problem.
    pub fn degrade(&mut self, now: DateTime<Utc>, reason: &str) -> Option<Transition> {
        if self.state != SessionState::Authenticated {
            return None;
        }
        self.last_error = Some(reason.to_string());
        self.move_to(SessionState::Degraded, now)
    }

    /// Session is gone; start re-login.
    pub fn begin_reconnecting(&mut self, now: DateTime<Utc>, reason: &str) -> Option<Transition> {
        if !self.state.can_transition_to(SessionState::Reconnecting) {
            return None;
        }
        self.reconnect_attempts = 0;
        self.last_error = Some(reason.to_string());
        self.move_to(SessionState::Reconnecting, now)
    }

    /// Count a failed re-login attempt. Returns the new attempt count.
    pub fn reconnect_failed(&mut self, reason: &str) -> u32 {
        self.reconnect_attempts += 1;
        self.last_error = Some(reason.to_string());
        self.reconnect_attempts
    }

    /// Drop to DISCONNECTED, remembering `reason` as the last error.
    pub fn disconnect(&mut self, now: DateTime<Utc>, reason: Option<&str>) -> Option<Transition> {
        if let Some(reason) = reason {
            self.last_error = Some(reason.to_string());
        }
        self.missed_heartbeats = 0;
        self.move_to(SessionState::Disconnected, now)
    }

    /// Give up on the session and latch `reason` until `clear_fatal`.
    pub fn fail(&mut self, now: DateTime<Utc>, reason: &str) -> Option<Transition> {
        self.fatal_error = Some(reason.to_string());
        self.disconnect(now, Some(reason))
    }

    /// Clear a latched fatal error so the session can start again.
    pub fn clear_fatal(&mut self) -> bool {
        let had = self.fatal_error.take().is_some();
        if had {
            self.reconnect_attempts = 0;
        }
        had
    }

    fn move_to(&mut self, next: SessionState, now: DateTime<Utc>) -> Option<Transition> {
        let from = self.state;
        if from == next {
            return None;
        }
        debug_assert!(from.can_transition_to(next), "{from} -> {next}");
        self.state = next;
        self.last_transition_at = now;
        Some(Transition { from, to: next })
    }
}
