//! Session Management
//!
//! Owns the one upstream gateway session: login, heartbeat probes,
//! reconnection with backoff, fatal lockout and logout.

mod backoff;
mod manager;

use std::time::Duration;

pub use backoff::BackoffPolicy;
pub use manager::{SessionHandle, SessionManager};

/// Session manager tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Time between heartbeat probes.
    pub heartbeat_interval: Duration,
    /// Deadline for a single heartbeat probe.
    pub heartbeat_timeout: Duration,
    /// Consecutive misses before the session counts as lost.
    pub max_missed_heartbeats: u32,
    /// Immediate login retries for the initial connect.
    pub connect_attempts: u32,
    /// Deadline for a single login or logout.
    pub login_timeout: Duration,
    /// Failed re-logins before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
    /// Delay between re-login attempts.
    pub backoff: BackoffPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(60),
            heartbeat_timeout: Duration::from_secs(60),
            max_missed_heartbeats: 3,
            connect_attempts: 3,
            login_timeout: Duration::from_secs(30),
            max_reconnect_attempts: 5,
            backoff: BackoffPolicy::default(),
        }
    }
}
