//! Mapping Rule Engine.
//!
//! Maps external result categories to record fields using a small
//! line-oriented language:
//!
//! ```text
//! SourceField: Homepage
//! Result: CMS
//! Field: Detected CMS; Technologies
//! ```
//!
//! - [`validate`] is the configuration-time check: it rejects the whole text
//!   on any problem and reports all of them.
//! - [`Mapping::parse`] is the runtime entry point: it keeps every block
//!   that still resolves and silently drops the rest.
//! - [`Mapping::apply`] turns one response into additive, type-aware writes.
//!
//! Both entry points share one grammar state machine.

mod apply;
mod catalog;
mod grammar;
mod rules;

pub use apply::{ApplyOutcome, FieldWrite, PendingValue, WriteRejection};
pub use catalog::FieldCatalog;
pub use rules::{ActionBlock, Mapping, MappingRule, validate};

use enricher_shared::EnricherError;

/// One problem found in mapping text. `line` is 1-based; 0 refers to the
/// text as a whole.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}: {message}")]
pub struct MappingError {
    pub line: usize,
    pub message: String,
}

impl MappingError {
    pub(crate) fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

/// Wrap validation problems as the configuration error that blocks startup.
pub fn rejected(errors: &[MappingError]) -> EnricherError {
    EnricherError::Mapping {
        errors: errors.iter().map(ToString::to_string).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_lists_every_problem() {
        let err = rejected(&[
            MappingError::new(2, "unknown destination field 'X'"),
            MappingError::new(5, "unknown result category 'Y'"),
        ]);
        assert!(err.is_configuration());
        assert_eq!(
            err.to_string(),
            "mapping rejected: line 2: unknown destination field 'X'; line 5: unknown result category 'Y'"
        );
    }
}
