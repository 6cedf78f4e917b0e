//! Shared types, error model, configuration, and clocks for the enricher.
//!
//! This crate is the foundation depended on by all other enricher crates.
//! It provides:
//! - [`EnricherError`], the unified error type
//! - Domain types ([`RecordId`], [`FieldDef`], [`FieldValue`], [`Subject`])
//! - Configuration ([`AppConfig`], [`RunConfig`], config loading)
//! - Time sources ([`Clock`], [`SystemClock`], [`ManualClock`], [`Deadline`])

pub mod clock;
pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use clock::{Clock, Deadline, ManualClock, SystemClock};
pub use config::{
    AppConfig, BudgetConfig, CategoryConfig, DefaultsConfig, ExclusionsConfig, MappingConfig,
    RecheckConfig, RunConfig, ScheduleConfig, SelectionConfig, ServiceConfig,
    SubjectFieldConfig, SubjectSource, api_key, config_dir, config_file_path, expand_home,
    init_config, load_config, load_config_from, validate_config,
};
pub use error::{EnricherError, Result};
pub use types::{
    FieldDef, FieldId, FieldKind, FieldValue, RecordId, RecordValues, ResultMap, SchemaId,
    SelectionCriteria, Subject, SubjectKind, TermId,
};
