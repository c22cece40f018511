// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error taxonomy for sync operations.
//!
//! Expected offline conditions are represented as queue state (pending /
//! failed counts), not as errors returned to UI callers. These variants are
//! what transports and stores hand back to the queue, which decides whether
//! to retry, defer, pause or give up.

use thiserror::Error;

use crate::storage::traits::StorageError;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Transport-level failure (DNS, connection refused, reset). Retryable.
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    /// 4xx other than auth: the server will never accept this request as-is.
    #[error("Server rejected request ({status}): {message}")]
    ServerRejection { status: u16, message: String },

    /// 5xx, 408 or 429. Retryable.
    #[error("Server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    /// Not a failure: the mutation waits on a parent's ID mapping.
    #[error("Waiting on unresolved dependency '{temp_id}'")]
    DependencyNotReady { temp_id: String },

    /// Cross-tab transport primitive missing; callers degrade to single-tab.
    #[error("Cross-tab channel unavailable")]
    ChannelUnavailable,

    /// Session expired; draining pauses until re-auth.
    #[error("Authentication expired")]
    AuthExpired,

    /// Synchronous input validation on enqueue.
    #[error("Invalid mutation: {0}")]
    Validation(String),

    /// Malformed frame or response body.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SyncError {
    /// Map a non-success HTTP status to the taxonomy.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 419 => Self::AuthExpired,
            408 | 429 => Self::ServerError { status, message },
            400..=499 => Self::ServerRejection { status, message },
            _ => Self::ServerError { status, message },
        }
    }

    /// Whether a failed mutation should be retried with backoff.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout | Self::ServerError { .. } | Self::Storage(_)
        )
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if let Some(status) = err.status() {
            Self::from_status(status.as_u16(), err.to_string())
        } else if err.is_decode() {
            Self::Protocol(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}
