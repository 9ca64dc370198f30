use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a retried operation gave up for good.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Will not succeed regardless of retry count.
    Fatal,
    /// Stop requested from outside.
    Cancelled,
    /// Overall time budget used up while only transient failures occurred.
    DeadlineExceeded,
}

/// Error returned by an outbound call such as an [`crate::InferenceGateway`] request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("fatal failure: {0}")]
    Fatal(String),
}

impl CallError {
    pub fn transient(cause: impl Into<String>) -> Self {
        Self::Transient(cause.into())
    }

    pub fn fatal(cause: impl Into<String>) -> Self {
        Self::Fatal(cause.into())
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    #[must_use]
    pub fn cause(&self) -> &str {
        match self {
            Self::Transient(cause) | Self::Fatal(cause) => cause,
        }
    }
}
