//! Gateway Adapters
//!
//! Implementations of the `GatewayClient` port.

mod client_portal;

pub use client_portal::{ClientPortalClient, MARKET_DATA_FIELDS};
