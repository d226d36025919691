#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements
    )
)]

//! IB Gateway Mux - Shared Session Multiplexer
//!
//! Keeps exactly one authenticated session to an Interactive Brokers Client
//! Portal gateway and routes requests from many independent clients through
//! it, with per-client permissions, rate windows and typed failures.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: State and rules with no I/O
//!   - `operation`: Closed operation set and permission sets
//!   - `session`: Session state machine
//!   - `client`: Client connections and usage counters
//!   - `rate_limit`: Fixed rate windows
//!   - `request`: Immutable requests and correlated responses
//!
//! - **Application**: Components and port definitions
//!   - `ports`: Gateway and clock interfaces
//!   - `services`: Session manager, client registry, request router,
//!     status monitor and the `GatewayMux` facade
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `gateway`: Client Portal REST adapter
//!   - `config`: Environment configuration
//!   - `health`: Health, status and metrics HTTP endpoint
//!   - `metrics`: Prometheus recorders
//!   - `telemetry`: Tracing subscriber and OTLP export
//!
//! # Request Flow
//!
//! ```text
//! Client 1 ──┐
//! Client 2 ──┼──► GatewayMux ──► RequestRouter ──► SessionManager ──► IB gateway
//! Client N ──┘    (identity)     (permission,      (one session,
//!                                 rate window)      heartbeat, re-login)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - State and rules with no I/O.
pub mod domain;

/// Application layer - Components and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

/// Error types shared across layers.
pub mod error;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::client::{ClientId, ClientUsage};
pub use domain::operation::{Operation, PermissionSet, UnknownOperation};
pub use domain::rate_limit::RateLimitPolicy;
pub use domain::request::{Params, Request, Response};
pub use domain::session::{SessionState, SessionView};

// Errors
pub use error::{AdmissionError, ErrorClass, GatewayError, ProxyError};

// Ports
pub use application::ports::{
    Clock, Credentials, GatewayClient, ManualClock, SharedGatewayClient, SystemClock,
};

// Components
pub use application::services::{
    BackoffPolicy, ClientRegistry, DispatchMode, GatewayMux, Health, MuxConfig, RegistryConfig,
    RequestRouter, RouterConfig, SessionConfig, SessionHandle, SessionManager, StatusMonitor,
    StatusSnapshot,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, GatewaySettings, ProxyConfig, ServerSettings};

// Gateway adapter
pub use infrastructure::gateway::ClientPortalClient;

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
