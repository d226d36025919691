//! Shared test fixtures: a scriptable in-memory gateway with call counters.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};

use ib_gateway_mux::{
    BackoffPolicy, Credentials, GatewayClient, GatewayError, GatewayMux, ManualClock, MuxConfig,
    Operation, Params,
};

/// In-memory gateway.
///
/// Logins succeed unless scripted otherwise; heartbeats fail while a
/// heartbeat error is set; calls echo the operation and parameters.
#[derive(Debug, Default)]
pub struct FakeGateway {
    pub logins: AtomicU32,
    pub heartbeats: AtomicU32,
    pub calls: AtomicU32,
    pub logouts: AtomicU32,
    pub completed_calls: AtomicU32,
    login_script: Mutex<VecDeque<Result<(), GatewayError>>>,
    login_fallback: Mutex<Option<GatewayError>>,
    heartbeat_error: Mutex<Option<GatewayError>>,
    call_error: Mutex<Option<GatewayError>>,
    call_delay: Mutex<Duration>,
    heartbeat_delay: Mutex<Duration>,
    active_calls: AtomicUsize,
    max_active_calls: AtomicUsize,
}

impl FakeGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue results for the next logins, then fall back to the default.
    pub fn script_logins(&self, results: impl IntoIterator<Item = Result<(), GatewayError>>) {
        self.login_script.lock().extend(results);
    }

    /// Make every unscripted login fail with `err` (or succeed with `None`).
    pub fn fail_logins(&self, err: Option<GatewayError>) {
        *self.login_fallback.lock() = err;
    }

    pub fn fail_heartbeats(&self, err: Option<GatewayError>) {
        *self.heartbeat_error.lock() = err;
    }

    pub fn fail_calls(&self, err: Option<GatewayError>) {
        *self.call_error.lock() = err;
    }

    pub fn delay_calls(&self, delay: Duration) {
        *self.call_delay.lock() = delay;
    }

    /// Make every heartbeat take `delay` before answering.
    pub fn delay_heartbeats(&self, delay: Duration) {
        *self.heartbeat_delay.lock() = delay;
    }

    pub fn logins(&self) -> u32 {
        self.logins.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_active_calls(&self) -> usize {
        self.max_active_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GatewayClient for FakeGateway {
    async fn login(&self, _credentials: &Credentials) -> Result<(), GatewayError> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        if let Some(result) = self.login_script.lock().pop_front() {
            return result;
        }
        self.login_fallback.lock().clone().map_or(Ok(()), Err)
    }

    async fn heartbeat(&self) -> Result<(), GatewayError> {
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        let delay = *self.heartbeat_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.heartbeat_error.lock().clone().map_or(Ok(()), Err)
    }

    async fn call(&self, operation: Operation, params: &Params) -> Result<Value, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let active = self.active_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_calls.fetch_max(active, Ordering::SeqCst);

        let delay = *self.call_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.active_calls.fetch_sub(1, Ordering::SeqCst);
        self.completed_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(err) = self.call_error.lock().clone() {
            return Err(err);
        }
        Ok(json!({"operation": operation.as_str(), "params": params}))
    }

    async fn logout(&self) -> Result<(), GatewayError> {
        self.logouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Config with short timers so supervisor-driven tests finish quickly.
pub fn fast_config() -> MuxConfig {
    let mut config = MuxConfig::default();
    config.session.heartbeat_interval = Duration::from_millis(20);
    config.session.heartbeat_timeout = Duration::from_millis(20);
    config.session.login_timeout = Duration::from_millis(200);
    config.session.backoff = BackoffPolicy {
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        ..BackoffPolicy::default()
    }
    .without_jitter();
    config.router.acquire_timeout = Duration::from_millis(500);
    config.router.call_timeout = Duration::from_secs(2);
    config
}

pub fn mux_with(gateway: &Arc<FakeGateway>, config: MuxConfig, clock: &ManualClock) -> GatewayMux {
    GatewayMux::new(
        Arc::clone(gateway) as Arc<dyn GatewayClient>,
        Credentials::new("ib-test", None),
        config,
        Arc::new(clock.clone()),
    )
}

pub fn no_params() -> Params {
    Params::new()
}
