//! Domain Layer - Session, client and request types.
//!
//! Pure types with no I/O. The session state machine, per-client rate
//! windows and the operation allow-list all live here so they can be
//! tested without a runtime.

/// Operation kinds and permission sets.
pub mod operation;

/// Fixed-window rate limiting.
pub mod rate_limit;

/// Downstream client connections.
pub mod client;

/// Upstream session state machine.
pub mod session;

/// Immutable requests and their responses.
pub mod request;
