//! Session Manager
//!
//! The only component that touches the upstream session. State lives behind a
//! short synchronous lock; anything that talks to the gateway (login, probe,
//! logout) additionally holds an async gate so at most one of them is in
//! flight. Every change is published on a watch channel, which is how
//! acquirers and the status monitor observe the session.
//!
//! ```text
//!  acquire_session ──► watch::Receiver ◄── publish ◄── mutate(Session)
//!        │                                               ▲
//!        └── start() ──► wake ──► run() ── connect / probe / reconnect_once
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::SessionConfig;
use crate::application::ports::{Clock, Credentials, GatewayError, SharedGatewayClient};
use crate::domain::operation::Operation;
use crate::domain::request::Params;
use crate::domain::session::{Session, SessionState, SessionView, Transition};
use crate::error::ProxyError;
use crate::infrastructure::metrics;

// =============================================================================
// Session Handle
// =============================================================================

/// Permission to use the session as it was at acquisition time.
///
/// The handle does not keep the session alive. If the session is re-created
/// in the meantime, failures reported against an old handle are ignored.
#[derive(Clone)]
pub struct SessionHandle {
    generation: u64,
    gateway: SharedGatewayClient,
}

impl SessionHandle {
    /// Generation the handle was issued for.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Dispatch one operation over the session.
    ///
    /// # Errors
    ///
    /// Whatever the gateway returns.
    pub async fn call(&self, operation: Operation, params: &Params) -> Result<Value, GatewayError> {
        self.gateway.call(operation, params).await
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Session Manager
// =============================================================================

/// Owner of the single upstream session.
pub struct SessionManager {
    gateway: SharedGatewayClient,
    credentials: Credentials,
    config: SessionConfig,
    clock: Arc<dyn Clock>,
    session: Mutex<Session>,
    gate: tokio::sync::Mutex<()>,
    state_tx: watch::Sender<SessionView>,
    wake: Notify,
    probe_requested: AtomicBool,
    closed: AtomicBool,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("credentials", &self.credentials)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Create a manager with a disconnected session.
    #[must_use]
    pub fn new(
        gateway: SharedGatewayClient,
        credentials: Credentials,
        config: SessionConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let session = Session::new(credentials.reference(), clock.now_utc());
        let (state_tx, _) = watch::channel(session.view());
        metrics::set_session_state(SessionState::Disconnected);

        Self {
            gateway,
            credentials,
            config,
            clock,
            session: Mutex::new(session),
            gate: tokio::sync::Mutex::new(()),
            state_tx,
            wake: Notify::new(),
            probe_requested: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Watch session changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionView> {
        self.state_tx.subscribe()
    }

    /// Current session snapshot.
    #[must_use]
    pub fn status(&self) -> SessionView {
        self.state_tx.borrow().clone()
    }

    /// Current session state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state_tx.borrow().state
    }

    /// Begin connecting if the session is disconnected.
    ///
    /// Returns `false` when already busy, shut down, or a fatal error is
    /// latched.
    pub fn start(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let moved = self.mutate(Session::begin_connecting).is_some();
        if moved {
            self.wake.notify_one();
        }
        moved
    }

    /// Clear a latched fatal error and start connecting again.
    pub fn restart(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let mut cleared = false;
        self.mutate(|session, _| {
            cleared = session.clear_fatal();
            None
        });
        if cleared {
            tracing::info!("Fatal session error cleared by restart");
        }
        self.start()
    }

    /// Wait up to `timeout` for an authenticated session.
    ///
    /// Kicks off a connect if the session is disconnected. Giving up on the
    /// wait leaves retry state untouched.
    ///
    /// # Errors
    ///
    /// - `FatalSession` immediately when a fatal error is latched, or if one
    ///   is latched while waiting.
    /// - `SessionUnavailable` when connecting fails or `timeout` elapses.
    pub async fn acquire_session(&self, timeout: Duration) -> Result<SessionHandle, ProxyError> {
        let mut rx = self.state_tx.subscribe();
        let view = rx.borrow_and_update().clone();
        if let Some(result) = self.evaluate(&view) {
            return result;
        }
        if view.state == SessionState::Disconnected {
            self.start();
        }

        let wait = async {
            loop {
                if rx.changed().await.is_err() {
                    return Err(unavailable("session manager dropped"));
                }
                let view = rx.borrow_and_update().clone();
                if let Some(result) = self.evaluate(&view) {
                    return result;
                }
                if view.state == SessionState::Disconnected {
                    return Err(unavailable(
                        view.last_error
                            .unwrap_or_else(|| "session disconnected".to_string()),
                    ));
                }
            }
        };

        tokio::time::timeout(timeout, wait).await.unwrap_or_else(|_| {
            Err(unavailable(format!(
                "no authenticated session within {}ms",
                timeout.as_millis()
            )))
        })
    }

    /// Tell the manager a call made with `handle` failed.
    ///
    /// Stale handles are ignored. Session loss starts reconnecting; transport
    /// failures degrade the session and trigger an immediate probe. Anything
    /// else only affects the call that saw it.
    pub fn report_failure(&self, handle: &SessionHandle, cause: &GatewayError) {
        let session_lost = cause.indicates_session_loss();
        let transport = cause.is_transport();
        if !session_lost && !transport {
            return;
        }

        let reason = cause.to_string();
        let mut stale = false;
        self.mutate(|session, now| {
            if session.generation() != handle.generation {
                stale = true;
                return None;
            }
            if session_lost {
                session.begin_reconnecting(now, &reason)
            } else {
                session.degrade(now, &reason)
            }
        });

        if stale {
            tracing::debug!(
                handle_generation = handle.generation,
                error = %cause,
                "Ignoring failure reported against a stale session"
            );
            return;
        }
        if transport {
            self.probe_requested.store(true, Ordering::SeqCst);
        }
        self.wake.notify_one();
    }

    // =========================================================================
    // Step Operations
    // =========================================================================

    /// Log in from CONNECTING (or DISCONNECTED), retrying transient failures
    /// up to `connect_attempts` times.
    ///
    /// # Errors
    ///
    /// - `FatalSession` if the credentials are refused or already latched.
    /// - `SessionUnavailable` if every attempt failed.
    pub async fn connect(&self) -> Result<SessionHandle, ProxyError> {
        let _gate = self.gate.lock().await;
        self.start();

        let view = self.status();
        match view.state {
            SessionState::Authenticated => return Ok(self.handle(view.generation)),
            SessionState::Connecting => {}
            _ => return Err(not_ready(&view)),
        }

        let attempts = self.config.connect_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.login().await {
                Ok(()) => return Ok(self.authenticated()),
                Err(err) if err.is_credential() => {
                    let reason = format!("login rejected: {err}");
                    self.mutate(|session, now| session.fail(now, &reason));
                    return Err(ProxyError::FatalSession { reason });
                }
                Err(err) => {
                    tracing::warn!(attempt, max_attempts = attempts, error = %err, "Login attempt failed");
                    last_error = Some(err);
                }
            }
        }

        let reason = last_error.map_or_else(
            || "login failed".to_string(),
            |err| format!("login failed after {attempts} attempts: {err}"),
        );
        self.mutate(|session, now| session.disconnect(now, Some(&reason)));
        Err(unavailable(reason))
    }

    /// Run one heartbeat probe while AUTHENTICATED or DEGRADED.
    pub async fn probe(&self) -> Option<Transition> {
        let _gate = self.gate.lock().await;
        self.probe_requested.store(false, Ordering::SeqCst);

        if !matches!(
            self.state(),
            SessionState::Authenticated | SessionState::Degraded
        ) {
            return None;
        }

        let result = tokio::time::timeout(self.config.heartbeat_timeout, self.gateway.heartbeat())
            .await
            .unwrap_or(Err(GatewayError::Timeout));

        match result {
            Ok(()) => self.mutate(Session::heartbeat_ok),
            Err(err) if err.indicates_session_loss() || err.is_credential() => {
                tracing::warn!(error = %err, "Heartbeat reports the session is gone");
                let reason = err.to_string();
                self.mutate(|session, now| session.begin_reconnecting(now, &reason))
            }
            Err(err) => {
                metrics::record_missed_heartbeat();
                let max_missed = self.config.max_missed_heartbeats;
                let reason = format!("heartbeat failed: {err}");
                let mut missed = 0;
                let transition = self.mutate(|session, now| {
                    let transition = session.heartbeat_missed(now, max_missed, &reason);
                    missed = session.missed_heartbeats();
                    transition
                });
                tracing::warn!(missed, max_missed, error = %err, "Heartbeat missed");
                transition
            }
        }
    }

    /// Make one re-login attempt while RECONNECTING.
    ///
    /// # Errors
    ///
    /// - `FatalSession` on refused credentials or once the retry budget is
    ///   spent.
    /// - `SessionUnavailable` when the attempt failed but retries remain.
    pub async fn reconnect_once(&self) -> Result<SessionHandle, ProxyError> {
        let _gate = self.gate.lock().await;

        let view = self.status();
        match view.state {
            SessionState::Authenticated => return Ok(self.handle(view.generation)),
            SessionState::Reconnecting => {}
            _ => return Err(not_ready(&view)),
        }

        match self.login().await {
            Ok(()) => {
                metrics::record_reconnect(true);
                Ok(self.authenticated())
            }
            Err(err) if err.is_credential() => {
                metrics::record_reconnect(false);
                let reason = format!("re-login rejected: {err}");
                self.mutate(|session, now| session.fail(now, &reason));
                Err(ProxyError::FatalSession { reason })
            }
            Err(err) => {
                metrics::record_reconnect(false);
                let max_attempts = self.config.max_reconnect_attempts;
                let reason = err.to_string();
                let mut attempts = 0;
                let mut fatal = None;
                self.mutate(|session, now| {
                    attempts = session.reconnect_failed(&reason);
                    if max_attempts > 0 && attempts >= max_attempts {
                        let message =
                            format!("reconnect failed after {attempts} attempts: {reason}");
                        let transition = session.fail(now, &message);
                        fatal = Some(message);
                        return transition;
                    }
                    None
                });

                if let Some(reason) = fatal {
                    return Err(ProxyError::FatalSession { reason });
                }
                tracing::warn!(attempt = attempts, max_attempts, error = %err, "Re-login attempt failed");
                Err(unavailable(reason))
            }
        }
    }

    /// Log out (best effort) and drop to DISCONNECTED for good.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _gate = self.gate.lock().await;

        if matches!(
            self.state(),
            SessionState::Authenticated | SessionState::Degraded
        ) {
            match tokio::time::timeout(self.config.login_timeout, self.gateway.logout()).await {
                Ok(Ok(())) => tracing::info!("Logged out of gateway"),
                Ok(Err(err)) => tracing::warn!(error = %err, "Gateway logout failed"),
                Err(_) => tracing::warn!("Gateway logout timed out"),
            }
        }

        self.mutate(|session, now| session.disconnect(now, Some("shutdown")));
        self.wake.notify_one();
    }

    // =========================================================================
    // Supervisor
    // =========================================================================

    /// Drive the session until cancelled.
    ///
    /// Connects while CONNECTING, waits out the backoff and retries while
    /// RECONNECTING, probes every `heartbeat_interval` while AUTHENTICATED or
    /// DEGRADED, and sleeps while DISCONNECTED until something wakes it.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(
            heartbeat_interval_secs = self.config.heartbeat_interval.as_secs(),
            max_missed_heartbeats = self.config.max_missed_heartbeats,
            max_reconnect_attempts = self.config.max_reconnect_attempts,
            "Session supervisor started"
        );

        let interval = self.config.heartbeat_interval;
        let mut next_probe = Instant::now() + interval;
        let mut generation = self.status().generation;

        while !cancel.is_cancelled() {
            let view = self.status();
            if view.generation != generation {
                generation = view.generation;
                next_probe = Instant::now() + interval;
            }

            match view.state {
                SessionState::Connecting => {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        _ = self.connect() => {}
                    }
                }
                SessionState::Reconnecting => {
                    let delay = self.config.backoff.delay_for_attempt(view.reconnect_attempts);
                    if !delay.is_zero() {
                        tracing::debug!(
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            failures = view.reconnect_attempts,
                            "Waiting before next re-login"
                        );
                        tokio::select! {
                            () = cancel.cancelled() => break,
                            () = tokio::time::sleep(delay) => {}
                        }
                    }
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        _ = self.reconnect_once() => {}
                    }
                }
                SessionState::Authenticated | SessionState::Degraded => {
                    if !self.probe_requested.load(Ordering::SeqCst) {
                        tokio::select! {
                            () = cancel.cancelled() => break,
                            () = self.wake.notified() => continue,
                            () = tokio::time::sleep_until(next_probe) => {}
                        }
                    }
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        _ = self.probe() => {}
                    }
                    next_probe = Instant::now() + interval;
                }
                SessionState::Disconnected => {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = self.wake.notified() => {}
                    }
                }
            }
        }

        tracing::info!("Session supervisor stopped");
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn login(&self) -> Result<(), GatewayError> {
        tracing::debug!(credentials = self.credentials.reference(), "Logging in to gateway");
        tokio::time::timeout(self.config.login_timeout, self.gateway.login(&self.credentials))
            .await
            .unwrap_or(Err(GatewayError::Timeout))
    }

    fn authenticated(&self) -> SessionHandle {
        let mut generation = 0;
        self.mutate(|session, now| {
            let transition = session.authenticated(now);
            generation = session.generation();
            transition
        });
        self.handle(generation)
    }

    fn handle(&self, generation: u64) -> SessionHandle {
        SessionHandle {
            generation,
            gateway: Arc::clone(&self.gateway),
        }
    }

    fn evaluate(&self, view: &SessionView) -> Option<Result<SessionHandle, ProxyError>> {
        if let Some(reason) = &view.fatal_error {
            return Some(Err(ProxyError::FatalSession {
                reason: reason.clone(),
            }));
        }
        match view.state {
            SessionState::Authenticated => Some(Ok(self.handle(view.generation))),
            SessionState::Disconnected if self.closed.load(Ordering::SeqCst) => {
                Some(Err(unavailable("session manager is shut down")))
            }
            _ => None,
        }
    }

    /// Apply `f` to the session under the lock, stamped with the clock's
    /// current time, and publish the result.
    fn mutate<F>(&self, f: F) -> Option<Transition>
    where
        F: FnOnce(&mut Session, DateTime<Utc>) -> Option<Transition>,
    {
        let now = self.clock.now_utc();
        let (transition, view) = {
            let mut session = self.session.lock();
            let transition = f(&mut session, now);
            let view = session.view();
            self.state_tx.send_if_modified(|current| {
                if *current == view {
                    false
                } else {
                    *current = view.clone();
                    true
                }
            });
            (transition, view)
        };

        if let Some(transition) = transition {
            log_transition(transition, &view);
        }
        transition
    }
}

fn log_transition(transition: Transition, view: &SessionView) {
    metrics::record_session_transition(transition);

    let from = transition.from.as_str();
    let to = transition.to.as_str();
    match transition.to {
        SessionState::Disconnected if view.fatal_error.is_some() => tracing::error!(
            from,
            reason = view.fatal_error.as_deref().unwrap_or_default(),
            "Session disabled until restart"
        ),
        SessionState::Degraded | SessionState::Reconnecting | SessionState::Disconnected => {
            tracing::warn!(
                from,
                to,
                reason = view.last_error.as_deref().unwrap_or_default(),
                "Session state changed"
            );
        }
        SessionState::Connecting | SessionState::Authenticated => {
            tracing::info!(from, to, generation = view.generation, "Session state changed");
        }
    }
}

fn unavailable(reason: impl Into<String>) -> ProxyError {
    ProxyError::SessionUnavailable {
        reason: reason.into(),
    }
}

fn not_ready(view: &SessionView) -> ProxyError {
    view.fatal_error.as_ref().map_or_else(
        || unavailable(format!("session is {}", view.state)),
        |reason| ProxyError::FatalSession {
            reason: reason.clone(),
        },
    )
}
