//! # Learning Error Types
//!
//! This module defines the error types used throughout the layout learning engine.
//! A missing rectangle or an unmatched field is never an error here: those are
//! normal "field absent" outcomes. Errors are reserved for configuration problems,
//! persistence failures and corrupted stored data.

use std::fmt;

/// General error type for the layout learning engine
#[derive(Debug, Clone, PartialEq)]
pub enum LearningError {
    /// Configuration validation errors
    Config(String),
    /// Persistence (record/layout store) errors
    Storage(String),
    /// Stored data that could not be parsed (rectangles, field ids, snapshots)
    Format(String),
    /// Issuer identity normalized to an empty key, so nothing can be learned
    EmptyIssuerKey(String),
    /// Internal engine errors
    Internal(String),
}

impl fmt::Display for LearningError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LearningError::Config(msg) => write!(f, "[CONFIG] {}", msg),
            LearningError::Storage(msg) => write!(f, "[STORAGE] {}", msg),
            LearningError::Format(msg) => write!(f, "[FORMAT] {}", msg),
            LearningError::EmptyIssuerKey(msg) => write!(f, "[EMPTY_ISSUER_KEY] {}", msg),
            LearningError::Internal(msg) => write!(f, "[INTERNAL] {}", msg),
        }
    }
}

impl std::error::Error for LearningError {}

impl From<anyhow::Error> for LearningError {
    fn from(err: anyhow::Error) -> Self {
        LearningError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for LearningError {
    fn from(err: serde_json::Error) -> Self {
        LearningError::Format(err.to_string())
    }
}

impl From<std::io::Error> for LearningError {
    fn from(err: std::io::Error) -> Self {
        LearningError::Storage(err.to_string())
    }
}

/// Result type alias for convenience
pub type LearningResult<T> = Result<T, LearningError>;

/// Structured error logging helpers so every component reports failures the same way
pub mod error_logging {
    use tracing::{error, warn};

    /// Log a persistence failure with the issuer key involved
    pub fn log_storage_error(error: &impl std::fmt::Display, operation: &str, issuer_key: Option<&str>) {
        error!(
            error = %error,
            operation = %operation,
            issuer_key = ?issuer_key,
            "Layout store operation failed"
        );
    }

    /// Log a stored rectangle that could not be parsed; the field is treated as absent
    pub fn log_malformed_rect(raw: &str, field: &str, context: &str) {
        warn!(
            raw = %raw,
            field = %field,
            context = %context,
            "Malformed stored rectangle, treating field as absent"
        );
    }

    /// Log a snapshot value that could not be read; only that value is dropped
    pub fn log_malformed_snapshot_value(raw: &str, context: &str, error: &impl std::fmt::Display) {
        warn!(
            raw = %raw,
            context = %context,
            error = %error,
            "Malformed snapshot value, dropping it"
        );
    }

    /// Log configuration errors during startup/initialization
    pub fn log_config_error(error: &impl std::fmt::Display, config_key: &str, operation: &str) {
        error!(
            error = %error,
            config_key = %config_key,
            operation = %operation,
            "Configuration error"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_tags() {
        assert_eq!(
            LearningError::Config("bad weight".to_string()).to_string(),
            "[CONFIG] bad weight"
        );
        assert!(LearningError::EmptyIssuerKey("no tax id".to_string())
            .to_string()
            .starts_with("[EMPTY_ISSUER_KEY]"));
    }

    #[test]
    fn test_from_serde_json_is_format_error() {
        let err = serde_json::from_str::<u32>("not a number").unwrap_err();
        assert!(matches!(LearningError::from(err), LearningError::Format(_)));
    }
}
