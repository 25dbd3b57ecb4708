//! Error types for the threat forecaster.
//!
//! Library crates use [`ForecastError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all forecaster operations.
#[derive(Debug, thiserror::Error)]
pub enum ForecastError {
    /// Configuration error: empty catalog, no sources, invalid settings.
    /// Fatal to a cycle.
    #[error("config error: {message}")]
    Config { message: String },

    /// A registered source could not be fetched this cycle.
    #[error("source unavailable: {source_name}: {reason}")]
    SourceUnavailable { source_name: String, reason: String },

    /// Capability extraction failed for a single document.
    #[error("extraction failed for document {document_id}: {reason}")]
    ExtractionFailed { document_id: String, reason: String },

    /// Scoring failed for a single capability/category pair.
    #[error("mapping failed for capability {capability_id} x {category}: {reason}")]
    MappingFailed {
        capability_id: String,
        category: String,
        reason: String,
    },

    /// Another cycle currently holds the running slot.
    #[error("cycle {run_id} is already running")]
    CycleInProgress { run_id: String },

    /// The run was marked failed as stale while it was still working.
    #[error("cycle {run_id} was abandoned as stale")]
    RunAbandoned { run_id: String },

    /// Network/HTTP error.
    #[error("network error: {0}")]
    Network(String),

    /// Feed, JSON, or LLM response parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Language-model call error (transport, API status, empty reply).
    #[error("llm error: {0}")]
    Llm(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error.
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, ForecastError>;

impl ForecastError {
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

    pub fn source_unavailable(source_name: impl Into<String>, reason: impl ToString) -> Self {
        Self::SourceUnavailable {
            source_name: source_name.into(),
            reason: reason.to_string(),
        }
    }

    pub fn extraction_failed(document_id: impl Into<String>, reason: impl ToString) -> Self {
        Self::ExtractionFailed {
            document_id: document_id.into(),
            reason: reason.to_string(),
        }
    }

    pub fn mapping_failed(
        capability_id: impl Into<String>,
        category: impl Into<String>,
        reason: impl ToString,
    ) -> Self {
        Self::MappingFailed {
            capability_id: capability_id.into(),
            category: category.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error must abort a cycle rather than being isolated to one item.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config { .. }
                | Self::Storage(_)
                | Self::CycleInProgress { .. }
                | Self::RunAbandoned { .. }
                | Self::Io { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = ForecastError::config("threat catalog is empty");
        assert_eq!(err.to_string(), "config error: threat catalog is empty");

        let err = ForecastError::source_unavailable("arXiv", "HTTP 503");
        assert_eq!(err.to_string(), "source unavailable: arXiv: HTTP 503");
    }

    #[test]
    fn item_level_errors_are_not_fatal() {
        assert!(!ForecastError::source_unavailable("a", "b").is_fatal());
        assert!(!ForecastError::extraction_failed("doc", "bad json").is_fatal());
        assert!(!ForecastError::mapping_failed("cap", "cat", "empty").is_fatal());
        assert!(!ForecastError::Llm("timeout".into()).is_fatal());
    }

    #[test]
    fn configuration_errors_are_fatal() {
        assert!(ForecastError::config("no sources").is_fatal());
        assert!(ForecastError::Storage("disk full".into()).is_fatal());
    }
}
