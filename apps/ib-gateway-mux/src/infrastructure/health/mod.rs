//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, session status reporting, and Prometheus
//! metrics. Used by container orchestrators, load balancers, monitoring
//! systems and operators.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns JSON health status
//! - `GET /healthz` - Kubernetes liveness probe (simple OK)
//! - `GET /readyz` - Kubernetes readiness probe (session authenticated)
//! - `GET /status` - Full status snapshot including per-client usage
//! - `GET /metrics` - Prometheus metrics in text format
//! - `POST /session/restart` - Clear a fatal session error and reconnect

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::{GatewayMux, Health};
use crate::domain::session::SessionState;
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy", "degraded", or "unhealthy".
    pub status: Health,
    /// Proxy version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Upstream session summary.
    pub session: SessionSummary,
    /// Connected client count.
    pub clients: ClientStatus,
}

/// Upstream session summary.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    /// Session state.
    pub state: SessionState,
    /// Session generation.
    pub generation: u64,
    /// Failed re-login attempts.
    pub reconnect_attempts: u32,
    /// Consecutive missed heartbeats.
    pub missed_heartbeats: u32,
    /// Latched fatal error, if any.
    pub fatal_error: Option<String>,
}

/// Connected client information.
#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    /// Total connected clients.
    pub total: usize,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    mux: Arc<GatewayMux>,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub const fn new(version: String, mux: Arc<GatewayMux>) -> Self {
        Self { version, mux }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let app = router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

/// Build the HTTP routes over `state`.
pub fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/status", get(status_handler))
        .route("/metrics", get(metrics_handler))
        .route("/session/restart", post(restart_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        Health::Healthy | Health::Degraded => StatusCode::OK,
        Health::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    if state.mux.sessions().status().is_ready() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn status_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    Json(state.mux.get_status())
}

async fn restart_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    if state.mux.restart_session() {
        tracing::warn!("Session restart requested by operator");
        (StatusCode::ACCEPTED, "RESTARTING")
    } else {
        (StatusCode::CONFLICT, "SHUT DOWN")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            let body = handle.render();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        },
    )
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let snapshot = state.mux.get_status();

    HealthResponse {
        status: snapshot.health,
        version: state.version.clone(),
        uptime_secs: snapshot.uptime_secs,
        current_time: snapshot.server_time,
        session: SessionSummary {
            state: snapshot.session_state,
            generation: snapshot.generation,
            reconnect_attempts: snapshot.reconnect_attempts,
            missed_heartbeats: snapshot.missed_heartbeats,
            fatal_error: snapshot.fatal_error,
        },
        clients: ClientStatus {
            total: snapshot.connected_client_count,
        },
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::application::ports::{Credentials, GatewayClient, GatewayError, ManualClock};
    use crate::application::services::MuxConfig;
    use crate::domain::operation::Operation;
    use crate::domain::request::Params;

    struct StaticGateway;

    #[async_trait]
    impl GatewayClient for StaticGateway {
        async fn login(&self, _credentials: &Credentials) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn heartbeat(&self) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn call(&self, _operation: Operation, _params: &Params) -> Result<Value, GatewayError> {
            Ok(Value::Null)
        }

        async fn logout(&self) -> Result<(), GatewayError> {
            Ok(())
        }
    }

    fn state() -> Arc<HealthServerState> {
        let mux = GatewayMux::new(
            Arc::new(StaticGateway),
            Credentials::new("ib-primary", None),
            MuxConfig::default(),
            Arc::new(ManualClock::new()),
        );
        Arc::new(HealthServerState::new("0.1.0".to_string(), Arc::new(mux)))
    }

    async fn get(state: &Arc<HealthServerState>, uri: &str) -> (StatusCode, String) {
        let response = router(Arc::clone(state))
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[test]
    fn health_status_serialization() {
        assert_eq!(serde_json::to_string(&Health::Healthy).unwrap(), "\"healthy\"");
        assert_eq!(serde_json::to_string(&Health::Degraded).unwrap(), "\"degraded\"");
        assert_eq!(serde_json::to_string(&Health::Unhealthy).unwrap(), "\"unhealthy\"");
    }

    #[tokio::test]
    async fn liveness_is_always_ok() {
        let (status, body) = get(&state(), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK");
    }

    #[tokio::test]
    async fn disconnected_session_is_unhealthy_and_not_ready() {
        let state = state();

        let (status, body) = get(&state, "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let json: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "unhealthy");
        assert_eq!(json["session"]["state"], "DISCONNECTED");

        let (status, _) = get(&state, "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn authenticated_session_is_ready() {
        let state = state();
        state.mux.sessions().connect().await.unwrap();
        state.mux.connect_with_names("dash", ["get_trades"]).unwrap();

        let (status, body) = get(&state, "/readyz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "READY");

        let (status, body) = get(&state, "/health").await;
        assert_eq!(status, StatusCode::OK);
        let json: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["session"]["generation"], 1);
        assert_eq!(json["clients"]["total"], 1);
    }

    #[tokio::test]
    async fn status_lists_client_usage() {
        let state = state();
        state.mux.connect_with_names("dash", ["get_trades"]).unwrap();

        let (status, body) = get(&state, "/status").await;
        assert_eq!(status, StatusCode::OK);
        let json: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["connected_client_count"], 1);
        assert_eq!(json["per_client_usage"][0]["identity"], "dash");
    }

    #[tokio::test]
    async fn restart_is_post_only() {
        let state = state();
        let (status, _) = get(&state, "/session/restart").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);

        let response = router(Arc::clone(&state))
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/session/restart")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }
}
