//! Prometheus Metrics Module
//!
//! Exposes multiplexer metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Requests**: Routed requests by operation and outcome
//! - **Gateway**: Upstream call latency and errors
//! - **Session**: State gauge, transitions, reconnects, missed heartbeats
//! - **Clients**: Connected clients, admissions and evictions
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! functions are no-ops until `init_metrics` installs the recorder.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::domain::operation::Operation;
use crate::domain::session::{SessionState, Transition};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if the recorder cannot be installed.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let builder = PrometheusBuilder::new();
            let handle = builder
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Requests
    describe_counter!(
        "ib_mux_requests_total",
        "Total requests routed, by operation and outcome"
    );
    describe_histogram!(
        "ib_mux_gateway_call_seconds",
        "Latency of gateway calls dispatched for clients"
    );
    describe_counter!(
        "ib_mux_gateway_errors_total",
        "Gateway errors by kind"
    );

    // Session
    describe_gauge!(
        "ib_mux_session_state",
        "Session state (0=disconnected 1=connecting 2=authenticated 3=degraded 4=reconnecting)"
    );
    describe_counter!(
        "ib_mux_session_transitions_total",
        "Session state transitions"
    );
    describe_counter!(
        "ib_mux_reconnect_attempts_total",
        "Re-login attempts by result"
    );
    describe_counter!(
        "ib_mux_missed_heartbeats_total",
        "Heartbeat probes that failed or timed out"
    );

    // Clients
    describe_gauge!(
        "ib_mux_connected_clients",
        "Number of connected downstream clients"
    );
    describe_counter!(
        "ib_mux_client_admissions_total",
        "Client admission attempts by result"
    );
    describe_counter!(
        "ib_mux_client_evictions_total",
        "Clients removed for being idle"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Outcome label for routed requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Gateway returned a result.
    Success,
    /// Rejected before dispatch or failed upstream; carries the error code.
    Error(&'static str),
}

impl RequestOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error(code) => code,
        }
    }
}

/// Record a routed request.
pub fn record_request(operation: Option<Operation>, outcome: RequestOutcome) {
    counter!(
        "ib_mux_requests_total",
        "operation" => operation.map_or("unknown", |op| op.as_str()),
        "outcome" => outcome.as_str()
    )
    .increment(1);
}

/// Record gateway call latency.
pub fn record_gateway_call(operation: Operation, duration: Duration) {
    histogram!(
        "ib_mux_gateway_call_seconds",
        "operation" => operation.as_str()
    )
    .record(duration.as_secs_f64());
}

/// Record a gateway error.
pub fn record_gateway_error(kind: &'static str) {
    counter!("ib_mux_gateway_errors_total", "kind" => kind).increment(1);
}

/// Update the session state gauge.
pub fn set_session_state(state: SessionState) {
    gauge!("ib_mux_session_state").set(state.as_gauge());
}

/// Record a session transition and update the state gauge.
pub fn record_session_transition(transition: Transition) {
    counter!(
        "ib_mux_session_transitions_total",
        "from" => transition.from.as_str(),
        "to" => transition.to.as_str()
    )
    .increment(1);
    set_session_state(transition.to);
}

/// Record a re-login attempt.
pub fn record_reconnect(succeeded: bool) {
    counter!(
        "ib_mux_reconnect_attempts_total",
        "result" => if succeeded { "success" } else { "failure" }
    )
    .increment(1);
}

/// Record a missed heartbeat.
pub fn record_missed_heartbeat() {
    counter!("ib_mux_missed_heartbeats_total").increment(1);
}

/// Update the connected client count.
#[allow(clippy::cast_precision_loss)]
pub fn set_connected_clients(count: usize) {
    gauge!("ib_mux_connected_clients").set(count as f64);
}

/// Record a client admission attempt.
pub fn record_admission(result: &'static str) {
    counter!("ib_mux_client_admissions_total", "result" => result).increment(1);
}

/// Record idle evictions.
pub fn record_evictions(count: u64) {
    counter!("ib_mux_client_evictions_total").increment(count);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_labels() {
        assert_eq!(RequestOutcome::Success.as_str(), "success");
        assert_eq!(
            RequestOutcome::Error("rate_limit_exceeded").as_str(),
            "rate_limit_exceeded"
        );
    }

    #[test]
    fn recording_without_recorder_is_noop() {
        record_request(Some(Operation::GetTrades), RequestOutcome::Success);
        record_session_transition(Transition {
            from: SessionState::Connecting,
            to: SessionState::Authenticated,
        });
        set_connected_clients(3);
    }
}
