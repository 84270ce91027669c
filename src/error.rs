use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Crate-wide error taxonomy. Every kernel/policy operation that can fail
/// returns one of these variants; user-visible failures are additionally
/// surfaced in `Reservation::last_error`.
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
pub enum Error {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("insufficient resources: {0}")]
    InsufficientResources(String),

    #[error("predecessor failed: {0}")]
    PredecessorFailed(String),

    #[error("timeout waiting for reply to {0}")]
    Timeout(String),

    #[error("handler failure: {0}")]
    HandlerFailure(String),

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Short tag used in `last_error` and log lines, independent of the
    /// free-form message.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidRequest(_) => "InvalidRequest",
            Error::Unauthorized(_) => "Unauthorized",
            Error::InsufficientResources(_) => "InsufficientResources",
            Error::PredecessorFailed(_) => "PredecessorFailed",
            Error::Timeout(_) => "Timeout",
            Error::HandlerFailure(_) => "HandlerFailure",
            Error::TransportError(_) => "TransportError",
            Error::Internal(_) => "Internal",
        }
    }

    /// `TransportError` is the only kind the producer pool retries; every
    /// other kind is terminal for the attempt that raised it.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TransportError(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Internal(format!("io error: {e}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidRequest(format!("malformed json: {e}"))
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::InvalidRequest(format!("malformed config: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
