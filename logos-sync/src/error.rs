//! Error taxonomy for the connection layer and document sync.
//!
//! Transport failures never escape to callers of the document apply paths;
//! they are retried inside the connection manager or surface as
//! [`ConnectionStatus::Failed`](crate::connection::ConnectionStatus::Failed).

use std::time::Duration;

use crate::protocol::{ErrorCategory, AUTH_EXPIRED};

/// Why a connection attempt did not produce a live session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    /// Socket-level failure; retried with backoff
    #[error("network error: {0}")]
    Network(String),
    /// Attempt exceeded the connect timeout; retried with backoff
    #[error("connection attempt timed out after {0:?}")]
    Timeout(Duration),
    /// Credential rejected; goes through refresh, never through backoff
    #[error(transparent)]
    Auth(#[from] AuthError),
    /// Breaker is open and the reset timeout has not elapsed
    #[error("circuit breaker open, retry allowed in {retry_in:?}")]
    CircuitOpen { retry_in: Duration },
    /// Superseded by `disconnect()`
    #[error("connection attempt cancelled")]
    Cancelled,
    /// The manager task is gone
    #[error("connection manager shut down")]
    Shutdown,
}

impl ConnectError {
    /// Network-level errors are handled by the backoff policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConnectError::Network(_) | ConnectError::Timeout(_))
    }

    /// Map a server error frame received while opening a sub-channel.
    pub fn from_error_frame(category: ErrorCategory, code: u16) -> Self {
        match category {
            ErrorCategory::Auth if code == AUTH_EXPIRED => AuthError::Expired.into(),
            ErrorCategory::Auth => AuthError::Invalid.into(),
            ErrorCategory::Protocol | ErrorCategory::Server => {
                ConnectError::Network(format!("peer rejected open: {category:?} {code}"))
            }
        }
    }
}

/// Credential failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("no credential available")]
    Missing,
    #[error("credential rejected as invalid")]
    Invalid,
    #[error("credential expired")]
    Expired,
    #[error("credential refresh failed: {0}")]
    RefreshFailed(String),
}

/// Outcome of applying a fetched payload through a context token.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// The document context changed while the fetch was in flight
    #[error("fetch cancelled")]
    Cancelled,
    #[error("document is not open")]
    UnknownDocument,
}
