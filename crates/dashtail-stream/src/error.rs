//! Stream error types

use std::time::Duration;
use thiserror::Error;

/// Errors that end a stream attempt or a backend query
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("{message}")]
    OpenFailed { status: u16, message: String },

    #[error("Live streaming is not supported by this backend")]
    StreamingUnsupported,

    #[error("Live stream disconnected")]
    Disconnected,

    #[error("No data received for {0:?}")]
    Idle(Duration),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Read error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StreamError {
    /// Check if a reconnect could recover from this error
    pub fn is_retryable(&self) -> bool {
        match self {
            StreamError::OpenFailed { .. } => true,
            StreamError::Disconnected => true,
            StreamError::Idle(_) => true,
            StreamError::Network(_) => true,
            StreamError::Io(_) => true,
            StreamError::Json(_) => true,
            StreamError::Query(_) => true,
            StreamError::StreamingUnsupported => false,
            StreamError::InvalidHeader(_) => false,
        }
    }

    /// Build an open failure from a non-success response body
    pub fn open_failed(status: u16, body: &str) -> Self {
        StreamError::OpenFailed {
            status,
            message: error_message(status, body),
        }
    }
}

/// Extract a human readable message from an error response body
///
/// Prefers a JSON `error` or `message` field, then the raw body, then a
/// generic fallback.
pub(crate) fn error_message(status: u16, body: &str) -> String {
    if let Ok(serde_json::Value::Object(obj)) = serde_json::from_str::<serde_json::Value>(body) {
        for key in ["error", "message"] {
            if let Some(serde_json::Value::String(s)) = obj.get(key)
                && !s.trim().is_empty()
            {
                return s.clone();
            }
        }
    }

    let raw = body.trim();
    if !raw.is_empty() {
        return raw.to_string();
    }

    format!("Live stream request failed with status {}", status)
}
