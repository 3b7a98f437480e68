// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

/// Errors surfaced by [`crate::ApiClient`] once local recovery is exhausted.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The request never produced a response (connect, TLS, timeout, body read).
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The backend answered with a non-success status that was not recovered.
    #[error("HTTP {status}: {body}")]
    Status { status: StatusCode, body: String, retry_after: Option<Duration> },

    /// The response body was not the expected JSON.
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// The request could not be built (bad path, unreadable form part, ...).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The session refresh this request depended on failed.
    #[error("session refresh failed: {0}")]
    RefreshFailed(#[source] RefreshError),

    /// Too many consecutive refresh failures; refresh is suspended.
    #[error("refresh circuit open, retry in {retry_in:?}")]
    CircuitOpen { retry_in: Duration },

    /// The refresh waiter queue is at capacity.
    #[error("refresh queue full ({capacity} waiters)")]
    QueueFull { capacity: usize },

    /// Gave up waiting for an in-flight refresh.
    #[error("timed out waiting for session refresh")]
    WaiterTimeout,
}

impl ClientError {
    /// HTTP status of the response this error came from, if any.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Transport(e) => e.status(),
            _ => None,
        }
    }

    /// True when the session was torn down as part of this failure.
    pub fn is_session_lost(&self) -> bool {
        matches!(self, Self::RefreshFailed(_) | Self::CircuitOpen { .. })
    }

    /// Stable machine-readable identifier.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Transport(_) => "TRANSPORT",
            Self::Status { status, .. } if *status == StatusCode::UNAUTHORIZED => "UNAUTHORIZED",
            Self::Status { status, .. } if *status == StatusCode::TOO_MANY_REQUESTS => {
                "RATE_LIMITED"
            }
            Self::Status { .. } => "HTTP_STATUS",
            Self::Decode(_) => "DECODE",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::RefreshFailed(_) => "REFRESH_FAILED",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::QueueFull { .. } => "QUEUE_FULL",
            Self::WaiterTimeout => "WAITER_TIMEOUT",
        }
    }
}

/// Outcome of a failed refresh, shared with every parked waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefreshError {
    /// The refresh endpoint answered with a non-success status.
    #[error("refresh rejected with HTTP {0}")]
    Rejected(u16),
    /// The refresh call did not finish within its own timeout.
    #[error("refresh timed out after {0:?}")]
    TimedOut(Duration),
    /// The refresh call failed below HTTP.
    #[error("refresh transport error: {0}")]
    Transport(String),
    /// The refreshing task went away without reporting an outcome.
    #[error("refresh abandoned before completion")]
    Abandoned,
}

impl From<RefreshError> for ClientError {
    fn from(e: RefreshError) -> Self {
        Self::RefreshFailed(e)
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
