//! Configuration Module
//!
//! Configuration loading for the multiplexer service.

mod settings;

pub use settings::{ConfigError, GatewaySettings, ProxyConfig, ServerSettings};
