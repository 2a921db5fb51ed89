//! Error types for the live-timing engine.
//!
//! One crate-wide error enum covers the full taxonomy: transient network
//! failures, rate limiting, missing archive resources, malformed payloads,
//! cache corruption and state-machine misuse. Callers can use
//! [`TimingError::is_retryable`] to decide between back-off and giving up.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T, E = TimingError> = std::result::Result<T, E>;

/// Main error type for live-timing operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TimingError {
    #[error("HTTP request failed: {url}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("unexpected HTTP status {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("WebSocket error: {reason}")]
    WebSocket {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("negotiate handshake failed: {reason}")]
    Negotiate { reason: String },

    #[error("parse error in {context}: {details}")]
    Parse { context: String, details: String },

    #[error("cache I/O error: {path}")]
    Cache {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("operation '{operation}' timed out after {duration:?}")]
    Timeout { operation: String, duration: Duration },

    #[error("replay error: {reason}")]
    Replay { reason: String },

    #[error("transport unavailable: {reason}")]
    TransportUnavailable { reason: String },

    #[error("schedule source error: {reason}")]
    Schedule { reason: String },
}

impl TimingError {
    /// Whether a retry with back-off has a chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        match self {
            TimingError::Http { .. } => true,
            TimingError::Status { status, .. } => *status == 429 || (500..600).contains(status),
            TimingError::WebSocket { .. } => true,
            TimingError::Negotiate { .. } => true,
            TimingError::Timeout { .. } => true,
            TimingError::Parse { .. } => false,
            TimingError::Cache { .. } => false,
            TimingError::Replay { .. } => false,
            TimingError::TransportUnavailable { .. } => false,
            TimingError::Schedule { .. } => true,
        }
    }

    pub fn parse_error(context: impl Into<String>, details: impl Into<String>) -> Self {
        TimingError::Parse { context: context.into(), details: details.into() }
    }

    pub fn status_error(url: impl Into<String>, status: u16) -> Self {
        TimingError::Status { url: url.into(), status }
    }

    pub fn negotiate_error(reason: impl Into<String>) -> Self {
        TimingError::Negotiate { reason: reason.into() }
    }

    pub fn ws_error(reason: impl Into<String>) -> Self {
        TimingError::WebSocket { reason: reason.into(), source: None }
    }

    pub fn cache_error(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TimingError::Cache { path: path.into(), source }
    }

    pub fn replay_error(reason: impl Into<String>) -> Self {
        TimingError::Replay { reason: reason.into() }
    }

    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        TimingError::Timeout { operation: operation.into(), duration }
    }

    pub fn transport_unavailable(reason: impl Into<String>) -> Self {
        TimingError::TransportUnavailable { reason: reason.into() }
    }

    pub fn schedule_error(reason: impl Into<String>) -> Self {
        TimingError::Schedule { reason: reason.into() }
    }
}

impl From<reqwest::Error> for TimingError {
    fn from(err: reqwest::Error) -> Self {
        let url = err.url().map(|u| u.to_string()).unwrap_or_else(|| "<unknown>".to_string());
        TimingError::Http { url, source: err }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TimingError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        TimingError::WebSocket { reason: err.to_string(), source: Some(Box::new(err)) }
    }
}

impl From<serde_json::Error> for TimingError {
    fn from(err: serde_json::Error) -> Self {
        TimingError::Parse { context: "json".to_string(), details: err.to_string() }
    }
}
