//! Infrastructure Layer
//!
//! Adapters and external integrations.

pub mod config;
pub mod gateway;
pub mod health;
pub mod metrics;
pub mod telemetry;
