//! Error Types
//!
//! `ProxyError` is what a client sees. Every variant has a stable code and a
//! class telling the caller what to do about it:
//!
//! | Class         | Variants                                        |
//! |---------------|-------------------------------------------------|
//! | `retry_later` | `SessionUnavailable`, `RateLimitExceeded`       |
//! | `fix_request` | `PermissionDenied`, `NotFound`, `CapacityExceeded` |
//! | `upstream`    | `Upstream`                                      |
//! | `operator`    | `FatalSession`                                  |
//!
//! `GatewayError` is what the gateway port returns. The session manager looks
//! at it to decide whether the session itself is affected.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::domain::operation::Operation;

// =============================================================================
// Gateway Errors
// =============================================================================

/// Errors from a `GatewayClient` implementation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Credentials were refused. Not recoverable by retrying.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The gateway no longer recognises the session.
    #[error("session lost: {0}")]
    SessionLost(String),

    /// Network or TLS failure talking to the gateway.
    #[error("transport error: {0}")]
    Transport(String),

    /// The gateway did not answer in time.
    #[error("gateway call timed out")]
    Timeout,

    /// The request parameters cannot be mapped to a gateway call.
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// The gateway answered with an error status.
    #[error("gateway rejected request: {status} - {message}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Error body or reason.
        message: String,
    },

    /// The gateway answered with something unparseable.
    #[error("decode error: {0}")]
    Decode(String),
}

impl GatewayError {
    /// Credential failure; retrying cannot help.
    #[must_use]
    pub const fn is_credential(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// The session itself is gone and must be re-established.
    #[must_use]
    pub const fn indicates_session_loss(&self) -> bool {
        matches!(self, Self::SessionLost(_))
    }

    /// The link to the gateway looks unhealthy.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout)
    }

    /// Short label for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth",
            Self::SessionLost(_) => "session_lost",
            Self::Transport(_) => "transport",
            Self::Timeout => "timeout",
            Self::InvalidParams(_) => "invalid_params",
            Self::Rejected { .. } => "rejected",
            Self::Decode(_) => "decode",
        }
    }
}

// =============================================================================
// Client-facing Errors
// =============================================================================

/// What a caller should do about an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Transient; the same request may succeed later.
    RetryLater,
    /// The request or the client's setup is wrong.
    FixRequest,
    /// The gateway failed this call.
    Upstream,
    /// Needs an operator (credentials, restart).
    Operator,
}

impl ErrorClass {
    /// Wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::RetryLater => "retry_later",
            Self::FixRequest => "fix_request",
            Self::Upstream => "upstream",
            Self::Operator => "operator",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned to clients of the proxy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProxyError {
    /// Operation unknown or outside the client's permissions.
    #[error("operation not permitted: {operation}")]
    PermissionDenied {
        /// Operation name as requested.
        operation: String,
    },

    /// Admission would exceed the client cap.
    #[error("client capacity reached ({max} clients)")]
    CapacityExceeded {
        /// Configured maximum.
        max: usize,
    },

    /// No connected client with this id or identity.
    #[error("client not found: {client}")]
    NotFound {
        /// Id or identity that failed to resolve.
        client: String,
    },

    /// The client's rate window is exhausted.
    #[error("rate limit exceeded, retry after {retry_after:?}")]
    RateLimitExceeded {
        /// Time until the window rolls over.
        retry_after: Duration,
    },

    /// No authenticated session within the acquisition timeout.
    #[error("session unavailable: {reason}")]
    SessionUnavailable {
        /// Why acquisition failed.
        reason: String,
    },

    /// The gateway call failed or timed out.
    #[error("upstream error: {cause}")]
    Upstream {
        /// Gateway error.
        cause: GatewayError,
        /// Whether the call hit its deadline.
        timed_out: bool,
    },

    /// The session gave up and needs an explicit restart.
    #[error("session disabled: {reason}")]
    FatalSession {
        /// Latched failure reason.
        reason: String,
    },
}

impl ProxyError {
    /// Stable machine-readable code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::PermissionDenied { .. } => "permission_denied",
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::NotFound { .. } => "not_found",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::SessionUnavailable { .. } => "session_unavailable",
            Self::Upstream {
                timed_out: true, ..
            } => "upstream_timeout",
            Self::Upstream { .. } => "upstream_error",
            Self::FatalSession { .. } => "fatal_session",
        }
    }

    /// Error class.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::SessionUnavailable { .. } | Self::RateLimitExceeded { .. } => {
                ErrorClass::RetryLater
            }
            Self::PermissionDenied { .. }
            | Self::NotFound { .. }
            | Self::CapacityExceeded { .. } => ErrorClass::FixRequest,
            Self::Upstream { .. } => ErrorClass::Upstream,
            Self::FatalSession { .. } => ErrorClass::Operator,
        }
    }

    /// Suggested wait before retrying, when known.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimitExceeded { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    pub(crate) fn not_found(client: impl fmt::Display) -> Self {
        Self::NotFound {
            client: client.to_string(),
        }
    }

    pub(crate) fn denied(operation: impl fmt::Display) -> Self {
        Self::PermissionDenied {
            operation: operation.to_string(),
        }
    }
}

// =============================================================================
// Admission Errors
// =============================================================================

/// Why a client could not be admitted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    /// Requested operations outside the configured allow-list.
    #[error("operations not allowed: {}", join_operations(denied))]
    PermissionDenied {
        /// The offending operations.
        denied: Vec<Operation>,
    },

    /// The registry is full.
    #[error("client capacity reached ({max} clients)")]
    CapacityExceeded {
        /// Configured maximum.
        max: usize,
    },
}

fn join_operations(ops: &[Operation]) -> String {
    ops.iter()
        .map(Operation::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

impl From<AdmissionError> for ProxyError {
    fn from(err: AdmissionError) -> Self {
        match err {
            AdmissionError::PermissionDenied { denied } => Self::PermissionDenied {
                operation: join_operations(&denied),
            },
            AdmissionError::CapacityExceeded { max } => Self::CapacityExceeded { max },
        }
    }
}
