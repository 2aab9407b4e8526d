//! Failures of a generation call.

use super::ProviderStatus;
use std::time::Duration;
use thiserror::Error;

/// A generation call failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LlmError {
    /// The provider answered with a non-success status.
    #[error("Provider returned status {}", .0.status_code)]
    Status(ProviderStatus),

    /// The connection could not be established or broke.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The request exceeded its time budget.
    #[error("Request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The request was cancelled.
    #[error("Request cancelled")]
    Cancelled,

    /// A stream produced no chunk within the inactivity window.
    #[error("Stream inactive for {}ms", .0.as_millis())]
    StreamInactive(Duration),

    /// The provider answered with something that could not be understood.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl LlmError {
    /// Returns true for retryable statuses and network-level faults.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status(status) => status.is_retryable(),
            Self::Connection(_) | Self::Timeout(_) | Self::Cancelled | Self::StreamInactive(_) => {
                true
            }
            Self::InvalidResponse(_) => false,
        }
    }

    /// The provider status, for status failures.
    #[must_use]
    pub fn status(&self) -> Option<&ProviderStatus> {
        match self {
            Self::Status(status) => Some(status),
            _ => None,
        }
    }
}
