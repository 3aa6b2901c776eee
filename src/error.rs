//! Unified error type for confidant.
//!
//! All public APIs return `Result<T, ConfidantError>`. Besides the usual
//! categories, every error carries an [`ErrorClass`] so that the job queue and
//! the reconciler can decide whether a retry can ever succeed without
//! inspecting error messages.

use thiserror::Error;

/// Whether repeating the failed operation may succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient: the same call may succeed later (network, lock contention).
    Retryable,
    /// Permanent: retrying with the same inputs cannot succeed.
    Fatal,
}

/// The unified error type for all confidant operations.
#[derive(Debug, Error)]
pub enum ConfidantError {
    // ── I/O & storage ─────────────────────────────────────────────────
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    // ── Serialization ─────────────────────────────────────────────────
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    // ── Cryptography ──────────────────────────────────────────────────
    #[error("encryption error: {0}")]
    Encryption(String),

    /// Malformed envelope or a key that does not match the envelope.
    #[error("decryption failed: {0}")]
    Decryption(String),

    // ── Lookup & state ────────────────────────────────────────────────
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    AlreadyExists(String),

    /// An optimistic-concurrency check lost against a concurrent writer.
    #[error("concurrent modification of {0}")]
    Conflict(String),

    #[error("{0}")]
    Validation(String),

    // ── External side effects ─────────────────────────────────────────
    #[error("integration '{integration}': {message}")]
    Integration {
        integration: String,
        message: String,
        retryable: bool,
    },

    #[error("job queue: {0}")]
    Queue(String),

    #[error("{0}")]
    Other(String),
}

impl From<String> for ConfidantError {
    fn from(s: String) -> Self {
        ConfidantError::Other(s)
    }
}

impl From<&str> for ConfidantError {
    fn from(s: &str) -> Self {
        ConfidantError::Other(s.to_string())
    }
}

// ── Convenience constructors ───────────────────────────────────────────

impl ConfidantError {
    pub fn config(message: impl Into<String>) -> Self {
        ConfidantError::Config(message.into())
    }

    pub fn encryption(message: impl Into<String>) -> Self {
        ConfidantError::Encryption(message.into())
    }

    pub fn decryption(message: impl Into<String>) -> Self {
        ConfidantError::Decryption(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ConfidantError::NotFound(message.into())
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        ConfidantError::AlreadyExists(message.into())
    }

    pub fn conflict(what: impl Into<String>) -> Self {
        ConfidantError::Conflict(what.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        ConfidantError::Validation(message.into())
    }

    pub fn queue(message: impl Into<String>) -> Self {
        ConfidantError::Queue(message.into())
    }

    /// A handler failure that is worth retrying (timeouts, 5xx, rate limits).
    pub fn integration(integration: impl Into<String>, message: impl Into<String>) -> Self {
        ConfidantError::Integration {
            integration: integration.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// A handler failure caused by the request itself (bad config, 4xx).
    pub fn integration_rejected(
        integration: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        ConfidantError::Integration {
            integration: integration.into(),
            message: message.into(),
            retryable: false,
        }
    }

    /// Classify this error for retry decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            ConfidantError::Io(_)
            | ConfidantError::Db(_)
            | ConfidantError::Conflict(_)
            | ConfidantError::Queue(_) => ErrorClass::Retryable,
            ConfidantError::Integration { retryable, .. } => {
                if *retryable {
                    ErrorClass::Retryable
                } else {
                    ErrorClass::Fatal
                }
            }
            ConfidantError::Json(_)
            | ConfidantError::Config(_)
            | ConfidantError::Encryption(_)
            | ConfidantError::Decryption(_)
            | ConfidantError::NotFound(_)
            | ConfidantError::AlreadyExists(_)
            | ConfidantError::Validation(_)
            | ConfidantError::Other(_) => ErrorClass::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }
}

/// Convenience type alias for Results using ConfidantError.
pub type Result<T> = std::result::Result<T, ConfidantError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decryption_and_not_found_are_fatal() {
        assert_eq!(
            ConfidantError::decryption("bad mac").class(),
            ErrorClass::Fatal
        );
        assert_eq!(
            ConfidantError::not_found("no such version").class(),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn integration_errors_follow_their_flag() {
        assert!(ConfidantError::integration("slack", "timeout").is_retryable());
        assert!(!ConfidantError::integration_rejected("slack", "404").is_retryable());
    }

    #[test]
    fn conflicts_are_retryable() {
        assert!(ConfidantError::conflict("integration i-1").is_retryable());
    }
}
