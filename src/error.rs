//! Centralized error handling, in the same tagged-enum shape the teacher app
//! used for its frontend-facing `Error` type.

use serde::{Deserialize, Serialize};

/// Crate-wide `Result` alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Every error kind named in the engine's error-handling design.
#[derive(Debug, thiserror::Error, Serialize, Deserialize, Clone)]
#[serde(tag = "type", content = "message")]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    /// HTTP 410: resource permanently removed. Never retried; triggers
    /// cascade cleanup instead.
    #[error("gone: {0}")]
    Gone(String),

    #[error("offline: {0}")]
    Offline(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("api error ({status}): {body}")]
    ApiException { status: u16, body: String },

    #[error("duplicate task for idempotency key: {0}")]
    DuplicateTask(String),

    #[error("capacity exceeded on queue: {0}")]
    CapacityExceeded(String),

    /// Local row vanished between enqueue and replay.
    #[error("model no longer exists: {model_type}/{model_id}")]
    ModelNoLongerExists { model_type: String, model_id: String },

    /// update -> 404 -> create -> 404. A configuration problem, not a
    /// transient failure; never retried automatically.
    #[error("double fallback failed: {0}")]
    DoubleFallback(String),

    #[error("id conflict: {0}")]
    IdConflict(String),

    #[error("circular dependency or cascade-delete cycle detected: {0}")]
    CycleDetected(String),

    #[error("task exceeded max retry attempts and was dead-lettered: {0}")]
    Dead(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("unimplemented: {0}")]
    Unimplemented(String),
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Database(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            Error::Network(err.to_string())
        } else {
            Error::Network(err.to_string())
        }
    }
}

impl Error {
    /// §4.4: a task belongs to the network-error-first partition if its
    /// `lastError` matches 5xx or one of the transient-transport tokens.
    pub fn is_network_like(message: &str) -> bool {
        const TOKENS: &[&str] = &[
            "timeout",
            "connection",
            "network",
            "socket",
            "refused",
            "unreachable",
            "dns",
            "resolve",
        ];
        let lower = message.to_ascii_lowercase();
        if TOKENS.iter().any(|t| lower.contains(t)) {
            return true;
        }
        // crude 5xx detector: "50x", "51x" etc. embedded in the message.
        let bytes = message.as_bytes();
        for w in bytes.windows(3) {
            if w[0] == b'5' && w[1].is_ascii_digit() && w[2].is_ascii_digit() {
                return true;
            }
        }
        false
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network(_) | Error::Database(_) => true,
            Error::ApiException { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Outcome of a single retry-executor task attempt (redesign flag §9:
/// replace exception-based control flow with a tagged result).
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Ok,
    Skip { reason: String },
    PermanentConfigFailure(String),
    TransientFailure(Error),
    MaxAttemptsReached,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_network_like_errors() {
        assert!(Error::is_network_like("connection refused"));
        assert!(Error::is_network_like("Read Timeout"));
        assert!(Error::is_network_like("upstream returned 503"));
        assert!(!Error::is_network_like("validation failed: name required"));
    }

    #[test]
    fn api_exception_5xx_is_retryable() {
        let err = Error::ApiException { status: 503, body: "down".into() };
        assert!(err.is_retryable());
        let err = Error::ApiException { status: 404, body: "missing".into() };
        assert!(!err.is_retryable());
    }
}
