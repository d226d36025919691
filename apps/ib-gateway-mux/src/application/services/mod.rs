//! Application Services
//!
//! The components behind the multiplexer, leaf-first:
//!
//! - `session`: `SessionManager`, the single upstream session
//! - `client_registry`: `ClientRegistry`, connected clients and idle eviction
//! - `request_router`: `RequestRouter`, admission checks and dispatch
//! - `status_monitor`: `StatusMonitor`, read-only status snapshots
//! - `gateway_mux`: `GatewayMux`, the inbound facade over all of the above

pub mod client_registry;
pub mod gateway_mux;
pub mod request_router;
pub mod session;
pub mod status_monitor;

pub use client_registry::{ClientRegistry, RegistryConfig};
pub use gateway_mux::{GatewayMux, MuxConfig};
pub use request_router::{DispatchMode, RequestRouter, RouterConfig, UnknownDispatchMode};
pub use session::{BackoffPolicy, SessionConfig, SessionHandle, SessionManager};
pub use status_monitor::{Health, StatusMonitor, StatusSnapshot};
