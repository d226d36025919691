//! Application Layer - Use cases and port definitions.
//!
//! Services that own the session, the client directory and request routing,
//! plus the ports they depend on.

/// Port interfaces for the gateway and the clock.
pub mod ports;

/// Session management, routing and status services.
pub mod services;
