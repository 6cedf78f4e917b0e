//! Error types for the enricher.
//!
//! Library crates use [`EnricherError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all enricher operations.
#[derive(Debug, thiserror::Error)]
pub enum EnricherError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// The mapping source was rejected. Carries every problem found.
    #[error("mapping rejected: {}", errors.join("; "))]
    Mapping { errors: Vec<String> },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// External service error (network, status, or response shape).
    #[error("transport error: {0}")]
    Transport(String),

    /// A joint budget reservation could not be satisfied.
    #[error("quota exceeded for '{name}': requested {requested}, remaining {remaining}")]
    QuotaExceeded {
        name: String,
        requested: u64,
        remaining: u64,
    },

    /// A value does not fit the field it was meant for.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// A referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, EnricherError>;

impl EnricherError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
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

    /// Whether this error should block the orchestrator from starting.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Config { .. } | Self::Mapping { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = EnricherError::config("missing endpoint");
        assert_eq!(err.to_string(), "config error: missing endpoint");

        let err = EnricherError::QuotaExceeded {
            name: "detections".into(),
            requested: 4,
            remaining: 2,
        };
        assert_eq!(
            err.to_string(),
            "quota exceeded for 'detections': requested 4, remaining 2"
        );
    }

    #[test]
    fn mapping_error_lists_every_problem() {
        let err = EnricherError::Mapping {
            errors: vec![
                "line 1: unknown field 'Homepage'".into(),
                "line 3: unknown field 'Detected CMS'".into(),
            ],
        };
        let text = err.to_string();
        assert!(text.contains("Homepage"));
        assert!(text.contains("Detected CMS"));
        assert!(err.is_configuration());
        assert!(!EnricherError::Storage("x".into()).is_configuration());
    }
}
