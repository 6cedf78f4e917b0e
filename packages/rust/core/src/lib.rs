//! Enrichment orchestration for the enricher.
//!
//! This crate composes the durable work queue, budget counters, rate limiter,
//! and recheck cache with the mapping engine into one bounded-time loop
//! ([`Orchestrator::run`]), fed by the [`CandidateSelector`].

pub mod acceptance;
pub mod budget;
pub mod orchestrator;
pub mod queue;
pub mod recheck;
pub mod selector;
pub mod store;
pub mod subjects;
pub mod throttle;
pub mod writer;

#[cfg(test)]
mod testing;

pub use acceptance::{accept_mapping, accepted_fingerprint, fingerprint, load_accepted_mapping};
pub use budget::BudgetTracker;
pub use orchestrator::{Orchestrator, RunProgress, RunReport, SilentProgress, StopReason};
pub use queue::WorkQueue;
pub use recheck::{RecheckCache, SubjectStatus};
pub use selector::{CandidateSelector, SELECTION_THROTTLE_KEY, SelectionOutcome};
pub use store::RecordStore;
pub use subjects::{HostFilter, SubjectExtractor, canonicalize_url};
pub use throttle::{RateLimiter, Readiness};
pub use writer::{WriteCounts, persist};
