//! Error types for the request coordinator and the pagination engine.
//!
//! Retryable failures (`RateLimited`, `Transport`) are normally absorbed by the coordinator and
//! only surface once the retry budget or the give-up deadline is exhausted. Everything else is
//! delivered to the caller that issued the request.
use std::time::Duration;
use thiserror::Error;

/// Status reported for requests that never produced an HTTP status (aborted or failed in the
/// transport).
pub const HTTP_ABORT: u16 = 0;

/// Text used when a server error carries no `OperationOutcome` diagnostics.
pub const UNKNOWN_ERROR: &str = "Unknown Error";

/// Unified error type delivered to callers of the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FhirError {
    /// The request was cancelled by its caller or discarded by a context change.
    #[error("request aborted")]
    Aborted,
    /// The server kept throttling the request until the budget or deadline ran out.
    #[error("rate limited (status {status}) after {attempts} attempts")]
    RateLimited { status: u16, attempts: usize },
    /// The transport failed before a response was received.
    #[error("transport failure: {0}")]
    Transport(String),
    /// The server answered with a non-success status.
    #[error("server error {status}: {diagnostics}")]
    Server { status: u16, diagnostics: String },
    /// The server speaks a FHIR release this client does not handle.
    #[error("unsupported FHIR version: {0}")]
    UnsupportedVersion(String),
    /// A success response whose body could not be decoded.
    #[error("invalid response body: {0}")]
    Decode(String),
    /// The server could not be reached during initialization.
    #[error("service unavailable: {0}")]
    Unavailable(String),
}

impl FhirError {
    /// Build a server error from a status and diagnostic text.
    pub fn server(status: u16, diagnostics: impl Into<String>) -> Self {
        FhirError::Server { status, diagnostics: diagnostics.into() }
    }

    /// HTTP status associated with the error; `HTTP_ABORT` when there is none.
    pub fn status(&self) -> u16 {
        match self {
            Self::RateLimited { status, .. } | Self::Server { status, .. } => *status,
            _ => HTTP_ABORT,
        }
    }

    /// Check if this error is an abort.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }

    /// Check if this error belongs to the throttling/transport class the coordinator retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Transport(_))
    }

    /// Check if this error came from the server with diagnostics.
    pub fn is_server(&self) -> bool {
        matches!(self, Self::Server { .. })
    }

    /// Check if this error reports an unhandled FHIR release.
    pub fn is_unsupported_version(&self) -> bool {
        matches!(self, Self::UnsupportedVersion(_))
    }

    /// Diagnostic text carried by the error, if any.
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            Self::Server { diagnostics, .. } => Some(diagnostics),
            _ => None,
        }
    }
}

/// Failure reported by a [`Transport`](crate::transport::Transport) implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The exchange was aborted below the coordinator (e.g. a failed CORS preflight).
    #[error("exchange aborted")]
    Aborted,
    /// The exchange did not complete in time.
    #[error("exchange timed out after {0:?}")]
    Timeout(Duration),
    /// Any other network-level failure.
    #[error("network error: {0}")]
    Network(String),
}
