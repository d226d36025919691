//! IB Gateway Mux Binary
//!
//! Starts the shared-session multiplexer.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin ib-gateway-mux
//! ```
//!
//! # Environment Variables
//!
//! ## Gateway
//! - `IB_GATEWAY_HOST` / `IB_GATEWAY_PORT`: Client Portal gateway (default: localhost:5000)
//! - `IB_API_BASE_URL`: Full API base URL, overriding host and port
//! - `IB_VERIFY_SSL`: Verify the gateway certificate (default: false)
//! - `IB_ACCOUNT_ID`: Default account for `get_portfolio`
//! - `IB_CREDENTIALS_REF` / `IB_SESSION_TOKEN`: Session credentials
//!
//! ## Multiplexer
//! - `MUX_*`: Session, client and routing tuning (see `ProxyConfig`)
//! - `MUX_HEALTH_PORT`: Health check HTTP port (default: 8080)
//!
//! ## Telemetry
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4318>)
//! - `OTEL_SERVICE_NAME`: Service name (default: ib-gateway-mux)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use ib_gateway_mux::infrastructure::health::{HealthServer, HealthServerState};
use ib_gateway_mux::infrastructure::telemetry;
use ib_gateway_mux::{ClientPortalClient, GatewayMux, ProxyConfig, SystemClock, init_metrics};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting IB Gateway Mux");

    // Initialize Prometheus metrics
    let _metrics_handle = init_metrics();

    let config = ProxyConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let gateway = ClientPortalClient::new(&config.gateway, config.mux.router.call_timeout)?;
    let mux = Arc::new(GatewayMux::new(
        Arc::new(gateway),
        config.credentials.clone(),
        config.mux.clone(),
        Arc::new(SystemClock),
    ));

    // Session supervisor and idle sweeper
    let mut background = mux.spawn_background(&shutdown_token);

    // Health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&mux),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    background.push(tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    }));

    tracing::info!("Gateway mux ready");

    await_shutdown(shutdown_token).await;

    let drain = async {
        mux.shutdown().await;
        for task in background {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }
    };
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
        tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Graceful shutdown timed out"
        );
    }

    tracing::info!("Gateway mux stopped");
    Ok(())
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_err() {
        load_dotenv_from_ancestors();
    }
}

/// Load .env file from the nearest ancestor directory that has one.
fn load_dotenv_from_ancestors() {
    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &ProxyConfig) {
    tracing::info!(
        gateway = %config.gateway.base_url(),
        verify_ssl = config.gateway.verify_ssl,
        credentials = config.credentials.reference(),
        health_port = config.server.health_port,
        "Configuration loaded"
    );
    tracing::debug!(
        heartbeat_interval_secs = config.mux.session.heartbeat_interval.as_secs(),
        max_missed_heartbeats = config.mux.session.max_missed_heartbeats,
        max_reconnect_attempts = config.mux.session.max_reconnect_attempts,
        max_clients = config.mux.registry.max_clients,
        rate_max_requests = config.mux.registry.rate_limit.max_requests,
        rate_window_secs = config.mux.registry.rate_limit.window.as_secs(),
        dispatch_mode = ?config.mux.router.dispatch_mode,
        "Multiplexer tuning"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
