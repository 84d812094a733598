//! Error types for reportloom.
//!
//! Library crates use [`ReportLoomError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all reportloom operations.
#[derive(Debug, thiserror::Error)]
pub enum ReportLoomError {
    /// Configuration loading or validation error. Fatal to a run.
    #[error("config error: {message}")]
    Config { message: String },

    /// Completion backend failure (transport, auth, rate limit, bad reply).
    #[error("backend error: {0}")]
    Backend(String),

    /// Collector service failure. Fatal to a run.
    #[error("collector error: {0}")]
    Collector(String),

    /// A text exceeds a hard token limit.
    #[error("budget exceeded: {tokens} tokens over limit {limit}")]
    BudgetExceeded { tokens: usize, limit: usize },

    /// Model reply could not be parsed into the expected shape.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Input validation error (malformed outline, duplicate ids, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// A spawned pipeline task panicked or was aborted.
    #[error("task failed: {0}")]
    Task(String),

    /// The run was cancelled before completion.
    #[error("run cancelled")]
    Cancelled,
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, ReportLoomError>;

impl ReportLoomError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backend(_) | Self::Parse { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = ReportLoomError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = ReportLoomError::BudgetExceeded {
            tokens: 9000,
            limit: 8000,
        };
        assert!(err.to_string().contains("9000"));
    }

    #[test]
    fn transient_classification() {
        assert!(ReportLoomError::Backend("429".into()).is_transient());
        assert!(ReportLoomError::parse("no json").is_transient());
        assert!(!ReportLoomError::Cancelled.is_transient());
        assert!(!ReportLoomError::Collector("down".into()).is_transient());
        assert!(!ReportLoomError::config("x").is_transient());
    }
}
