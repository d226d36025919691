//! Gateway Port (Driven Port)
//!
//! The brokerage gateway as an opaque capability. Implementations own the
//! wire protocol; the session manager owns when each method is called.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::operation::Operation;
use crate::domain::request::Params;
use crate::error::GatewayError;

/// Credentials the session logs in with.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    reference: String,
    session_token: Option<String>,
}

impl Credentials {
    /// Credentials identified by `reference`, with an optional bearer token.
    #[must_use]
    pub fn new(reference: impl Into<String>, session_token: Option<String>) -> Self {
        Self {
            reference: reference.into(),
            session_token: session_token.filter(|t| !t.is_empty()),
        }
    }

    /// Opaque name of the credential set (safe to log).
    #[must_use]
    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// Bearer token, if the gateway needs one.
    #[must_use]
    pub fn session_token(&self) -> Option<&str> {
        self.session_token.as_deref()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("reference", &self.reference)
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

/// The brokerage gateway.
///
/// Every method may be slow. None of them retry; retry policy belongs to
/// the session manager.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// Establish an authenticated session.
    ///
    /// # Errors
    ///
    /// `GatewayError::Auth` when the credentials are refused; any other
    /// variant is treated as transient.
    async fn login(&self, credentials: &Credentials) -> Result<(), GatewayError>;

    /// Prove the session is still alive.
    ///
    /// # Errors
    ///
    /// `GatewayError::SessionLost` when the gateway dropped the session.
    async fn heartbeat(&self) -> Result<(), GatewayError>;

    /// Run one operation against the gateway.
    ///
    /// # Errors
    ///
    /// Any `GatewayError`; the caller decides what it means for the session.
    async fn call(&self, operation: Operation, params: &Params) -> Result<Value, GatewayError>;

    /// End the session.
    ///
    /// # Errors
    ///
    /// Best effort; failures are only logged by callers.
    async fn logout(&self) -> Result<(), GatewayError>;
}

/// Shared handle to a gateway implementation.
pub type SharedGatewayClient = Arc<dyn GatewayClient>;
