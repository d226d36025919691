//! Port Interfaces
//!
//! Contracts between the multiplexer and the outside world.
//!
//! ## Driven Ports (Outbound)
//!
//! - `GatewayClient`: the brokerage gateway, reached through one session
//! - `Clock`: wall and monotonic time, swappable in tests

mod clock_port;
mod gateway_port;

pub use clock_port::{Clock, ManualClock, SystemClock};
pub use gateway_port::{Credentials, GatewayClient, SharedGatewayClient};

#[cfg(test)]
pub use gateway_port::MockGatewayClient;

pub use crate::error::GatewayError;
