//! Requests and Responses
//!
//! A `Request` is built once by the router and never mutated. Its response
//! carries the originating client and submission time so callers can
//! correlate out-of-order completions.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::domain::client::ClientId;
use crate::domain::operation::Operation;
use crate::error::ProxyError;

/// Operation parameters as a JSON object.
pub type Params = Map<String, Value>;

/// A client request routed through the shared session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Request {
    client_id: ClientId,
    operation: Operation,
    params: Params,
    submitted_at: DateTime<Utc>,
    sequence: u64,
}

impl Request {
    /// Build a request stamped with `submitted_at`.
    #[must_use]
    pub const fn new(
        client_id: ClientId,
        operation: Operation,
        params: Params,
        submitted_at: DateTime<Utc>,
        sequence: u64,
    ) -> Self {
        Self {
            client_id,
            operation,
            params,
            submitted_at,
            sequence,
        }
    }

    /// Originating client.
    #[must_use]
    pub const fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Requested operation.
    #[must_use]
    pub const fn operation(&self) -> Operation {
        self.operation
    }

    /// Operation parameters.
    #[must_use]
    pub const fn params(&self) -> &Params {
        &self.params
    }

    /// Submission time.
    #[must_use]
    pub const fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    /// Router-wide submission sequence number.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Pair this request with its outcome.
    #[must_use]
    pub fn respond(&self, result: Result<Value, ProxyError>) -> Response {
        Response {
            client_id: Some(self.client_id),
            operation: Some(self.operation),
            correlates_to_request_at: self.submitted_at,
            sequence: self.sequence,
            completed_at: Utc::now(),
            result,
        }
    }
}

/// Outcome of one routed request.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Client the response belongs to; `None` if the identity never resolved.
    pub client_id: Option<ClientId>,
    /// Operation that was requested; `None` if the name was unknown.
    pub operation: Option<Operation>,
    /// `submitted_at` of the originating request.
    pub correlates_to_request_at: DateTime<Utc>,
    /// Sequence number of the originating request.
    pub sequence: u64,
    /// Completion time.
    pub completed_at: DateTime<Utc>,
    /// Gateway result or a typed failure.
    pub result: Result<Value, ProxyError>,
}

impl Response {
    /// A response for a request rejected before it could be built.
    #[must_use]
    pub fn rejected(
        client_id: Option<ClientId>,
        submitted_at: DateTime<Utc>,
        sequence: u64,
        error: ProxyError,
    ) -> Self {
        Self {
            client_id,
            operation: None,
            correlates_to_request_at: submitted_at,
            sequence,
            completed_at: Utc::now(),
            result: Err(error),
        }
    }

    /// Whether the request produced a gateway result.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    /// Borrow the error, if any.
    #[must_use]
    pub fn error(&self) -> Option<&ProxyError> {
        self.result.as_ref().err()
    }

    /// Consume into the plain result.
    ///
    /// # Errors
    ///
    /// Returns the typed failure the request ended with.
    pub fn into_result(self) -> Result<Value, ProxyError> {
        self.result
    }
}
