//! Shared primitives for all Rust crates in Tollgate.

#![forbid(unsafe_code)]

/// Retry hints attached to throttling errors.
pub mod retry;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use retry::RetryDirective;

/// Result type used across Tollgate crates.
pub type AppResult<T> = Result<T, AppError>;

/// A validated non-empty UTF-8 string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NonEmptyString(String);

impl NonEmptyString {
    /// Creates a validated non-empty string.
    pub fn new(value: impl Into<String>) -> AppResult<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(AppError::Validation(
                "value must not be empty or whitespace".to_owned(),
            ));
        }

        Ok(Self(value))
    }

    /// Returns the underlying string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<NonEmptyString> for String {
    fn from(value: NonEmptyString) -> Self {
        value.0
    }
}

impl std::fmt::Display for NonEmptyString {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.0.as_str())
    }
}

/// Common error categories shared by the coordinator, the task buffer and their adapters.
///
/// None of these are fatal to a worker process. Callers decide whether to retry
/// from the variant alone.
#[derive(Debug, Error)]
pub enum AppError {
    /// Invalid input or violated invariant.
    #[error("validation error: {0}")]
    Validation(String),

    /// Requested resource does not exist. Terminal for the task that produced it.
    #[error("not found: {0}")]
    NotFound(String),

    /// The local coordinator determined the scope is saturated. No network call was made.
    #[error("admission blocked locally, retry after {}ms", retry_after.as_millis())]
    AdmissionBlocked {
        /// How long the caller should sleep before retrying.
        retry_after: Duration,
    },

    /// The upstream provider throttled the request despite local admission passing.
    #[error("throttled by upstream provider ({retry})")]
    RemoteThrottled {
        /// When the caller may retry.
        retry: RetryDirective,
    },

    /// Upstream returned a status that is neither success, not-found nor throttling.
    #[error("unexpected upstream status {status}")]
    UnexpectedStatus {
        /// HTTP status code returned by the provider.
        status: u16,
    },

    /// The coordinator is shutting down and refuses new work.
    #[error("shutting down")]
    ShuttingDown,

    /// A shared resource (coordination store, broker, transport) could not be reached.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Internal unexpected error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Short delay used when a retryable error carries no explicit hint.
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(100);

impl AppError {
    /// Returns whether retrying the same operation later can succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AdmissionBlocked { .. }
                | Self::RemoteThrottled { .. }
                | Self::UnexpectedStatus { .. }
                | Self::Unavailable(_)
        )
    }

    /// Returns how long a caller should wait before retrying, for retryable errors.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::AdmissionBlocked { retry_after } => Some(*retry_after),
            Self::RemoteThrottled { retry } => Some(retry.remaining()),
            Self::UnexpectedStatus { .. } | Self::Unavailable(_) => Some(DEFAULT_RETRY_BACKOFF),
            _ => None,
        }
    }
}
