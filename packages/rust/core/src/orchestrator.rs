//! The enrichment loop run once per host invocation.
//!
//! 1. Load the accepted mapping against the live field catalog (fatal on failure)
//! 2. Refresh stale budgets, prune the recheck cache, optionally select candidates
//! 3. Drain the queue snapshot record by record:
//!    subjects → time check → joint budget reservation → paced calls → writes
//!
//! The run stops early, leaving the current and later records queued, when
//! the host window is too short for the next record or a budget runs out.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use enricher_mapping::{FieldCatalog, Mapping};
use enricher_shared::{
    Clock, Deadline, EnricherError, RecordId, Result, RunConfig, Subject,
};
use enricher_storage::Storage;
use enricher_transport::{StatusSource, Transport};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::acceptance::load_accepted_mapping;
use crate::budget::BudgetTracker;
use crate::queue::WorkQueue;
use crate::recheck::RecheckCache;
use crate::selector::{CandidateSelector, SELECTION_THROTTLE_KEY, SelectionOutcome};
use crate::store::RecordStore;
use crate::subjects::SubjectExtractor;
use crate::throttle::{RateLimiter, Readiness};
use crate::writer::persist;

/// Why a run ended.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StopReason {
    /// Every queued record was handled or claimed elsewhere.
    #[default]
    QueueDrained,
    /// The host window is too short for the next unit of work.
    TimeBudget,
    /// A budget could not cover the next record.
    QuotaExceeded { budget: String },
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueDrained => f.write_str("queue drained"),
            Self::TimeBudget => f.write_str("time budget reached"),
            Self::QuotaExceeded { budget } => write!(f, "budget '{budget}' exhausted"),
        }
    }
}

/// Summary of one run, also stored as the run's stats.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected: Option<SelectionOutcome>,
    pub records_processed: usize,
    pub subjects_checked: usize,
    pub subjects_failed: usize,
    pub writes_applied: usize,
    pub writes_rejected: usize,
    pub stop_reason: StopReason,
    pub elapsed_ms: u64,
}

/// Progress callback for reporting run status.
pub trait RunProgress: Send + Sync {
    /// Called once the queue snapshot is taken.
    fn started(&self, queued: usize);
    /// Called when a record is claimed and its subjects are known.
    fn record_started(&self, record: &RecordId, current: usize, total: usize);
    /// Called after each external call.
    fn subject_done(&self, subject: &Subject, ok: bool);
    /// Called when the run completes.
    fn finished(&self, report: &RunReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl RunProgress for SilentProgress {
    fn started(&self, _queued: usize) {}
    fn record_started(&self, _record: &RecordId, _current: usize, _total: usize) {}
    fn subject_done(&self, _subject: &Subject, _ok: bool) {}
    fn finished(&self, _report: &RunReport) {}
}

enum RecordStep {
    /// Every subject was attempted (or there were none); dequeue.
    Done,
    /// Leave the record queued and end the run.
    Stop(StopReason),
}

/// Composes the queue, budgets, rate limiter, recheck cache, and mapping
/// into the enrichment loop.
pub struct Orchestrator {
    storage: Arc<Storage>,
    store: Arc<dyn RecordStore>,
    transport: Arc<dyn Transport>,
    status: Option<Arc<dyn StatusSource>>,
    clock: Arc<dyn Clock>,
    config: RunConfig,
    mapping_text: String,
    select_first: bool,
    queue: WorkQueue,
    budgets: BudgetTracker,
    limiter: RateLimiter,
    recheck: RecheckCache,
    extractor: SubjectExtractor,
    selector: CandidateSelector,
}

impl Orchestrator {
    pub fn new(
        storage: Arc<Storage>,
        store: Arc<dyn RecordStore>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        config: RunConfig,
        mapping_text: String,
    ) -> Self {
        let queue = WorkQueue::new(storage.clone(), clock.clone(), config.claim_lease);
        let budgets = BudgetTracker::new(storage.clone(), clock.clone(), config.budgets.clone());
        let limiter = RateLimiter::new(
            storage.clone(),
            clock.clone(),
            config.throttle_key.clone(),
            config.min_interval,
        );
        let recheck = RecheckCache::new(
            storage.clone(),
            clock.clone(),
            config.recheck_interval,
            config.max_retries,
            config.prune_multiplier,
        );
        let extractor = SubjectExtractor::new(config.subject_fields.clone(), &config.excluded_hosts);
        let selector = CandidateSelector::new(
            store.clone(),
            queue.clone(),
            config.selection.clone(),
            RateLimiter::new(
                storage.clone(),
                clock.clone(),
                SELECTION_THROTTLE_KEY,
                config.selection_interval,
            ),
        );

        Self {
            storage,
            store,
            transport,
            status: None,
            clock,
            config,
            mapping_text,
            select_first: true,
            queue,
            budgets,
            limiter,
            recheck,
            extractor,
            selector,
        }
    }

    /// Pull authoritative budget counts from `status` when they go stale.
    pub fn with_status_source(mut self, status: Arc<dyn StatusSource>) -> Self {
        self.status = Some(status);
        self
    }

    /// Only drain the queue; do not run a selection pass first.
    pub fn skip_selection(mut self) -> Self {
        self.select_first = false;
        self
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub fn budgets(&self) -> &BudgetTracker {
        &self.budgets
    }

    pub fn recheck(&self) -> &RecheckCache {
        &self.recheck
    }

    pub fn selector(&self) -> &CandidateSelector {
        &self.selector
    }

    /// Run one invocation until the queue is drained or a STOP condition hits.
    #[instrument(skip_all, fields(deadline = %deadline.ends_at()))]
    pub async fn run(&self, deadline: Deadline, progress: &dyn RunProgress) -> Result<RunReport> {
        let started_at = self.clock.now();

        let catalog = FieldCatalog::new(self.store.fields().await?);
        let mapping = load_accepted_mapping(&self.storage, &self.mapping_text, &catalog).await?;
        if mapping.is_empty() {
            warn!("no mapping block resolves against the current fields");
        }

        let run_id = Uuid::now_v7().to_string();
        self.storage.insert_run(&run_id).await?;
        info!(%run_id, "run started");

        let mut report = RunReport {
            run_id: run_id.clone(),
            ..RunReport::default()
        };
        let outcome = self
            .drain(&run_id, &deadline, &catalog, &mapping, progress, &mut report)
            .await;

        report.elapsed_ms = (self.clock.now() - started_at)
            .to_std()
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        let stats = serde_json::to_string(&report)
            .map_err(|e| EnricherError::Storage(format!("failed to encode run stats: {e}")))?;
        self.storage.finish_run(&run_id, &stats).await?;
        outcome?;

        progress.finished(&report);
        info!(
            %run_id,
            records = report.records_processed,
            checked = report.subjects_checked,
            failed = report.subjects_failed,
            writes = report.writes_applied,
            stop = %report.stop_reason,
            "run complete"
        );
        Ok(report)
    }

    async fn drain(
        &self,
        run_id: &str,
        deadline: &Deadline,
        catalog: &FieldCatalog,
        mapping: &Mapping,
        progress: &dyn RunProgress,
        report: &mut RunReport,
    ) -> Result<()> {
        self.budgets.ensure().await?;
        if let Some(status) = &self.status {
            self.budgets.refresh_stale(status.as_ref()).await?;
        }
        self.recheck.prune().await?;
        if self.select_first {
            report.selected = self.selector.select_if_due().await?;
        }

        let queued = self.queue.snapshot().await?;
        progress.started(queued.len());

        for (i, record) in queued.iter().enumerate() {
            if !self.queue.claim(record, run_id).await? {
                debug!(record_id = %record, "record claimed by another run, skipping");
                continue;
            }
            progress.record_started(record, i + 1, queued.len());

            let step = match self
                .process(record, deadline, catalog, mapping, progress, report)
                .await
            {
                Ok(step) => step,
                Err(e) => {
                    if let Err(release) = self.queue.release(record, run_id).await {
                        warn!(record_id = %record, error = %release, "failed to release claim");
                    }
                    return Err(e);
                }
            };

            match step {
                RecordStep::Done => {
                    self.queue.remove(record, run_id).await?;
                    report.records_processed += 1;
                }
                RecordStep::Stop(reason) => {
                    self.queue.release(record, run_id).await?;
                    report.stop_reason = reason;
                    break;
                }
            }
        }
        Ok(())
    }

    #[instrument(skip_all, fields(record_id = %record))]
    async fn process(
        &self,
        record: &RecordId,
        deadline: &Deadline,
        catalog: &FieldCatalog,
        mapping: &Mapping,
        progress: &dyn RunProgress,
        report: &mut RunReport,
    ) -> Result<RecordStep> {
        let Some(schema) = self.store.schema_of(record).await? else {
            debug!("record no longer exists");
            return Ok(RecordStep::Done);
        };
        let mut values = self.store.values(record).await?;

        let mut subjects = Vec::new();
        for subject in self.extractor.subjects_for(&schema, &values, catalog) {
            let status = self.recheck.status(&subject.key).await?;
            if status.exhausted {
                debug!(subject = %subject, "retries exhausted, skipping");
            } else if !status.due {
                debug!(subject = %subject, "checked recently, skipping");
            } else {
                subjects.push(subject);
            }
        }
        if subjects.is_empty() {
            return Ok(RecordStep::Done);
        }

        let count = subjects.len();
        let needed = self.window_for(count);
        let remaining = deadline.remaining(self.clock.as_ref());
        if remaining < needed {
            info!(subjects = count, ?remaining, ?needed, "not enough time left for this record, stopping");
            return Ok(RecordStep::Stop(StopReason::TimeBudget));
        }

        match self.budgets.reserve(count as u64).await {
            Ok(()) => {}
            Err(EnricherError::QuotaExceeded {
                name,
                requested,
                remaining,
            }) => {
                info!(budget = %name, requested, remaining, "budget exhausted, stopping");
                return Ok(RecordStep::Stop(StopReason::QuotaExceeded { budget: name }));
            }
            Err(e) => return Err(e),
        }

        // Units stay reserved only for subjects actually sent; every exit
        // path below, errors included, hands the rest back.
        let mut attempted = 0;
        let step = async {
            for subject in &subjects {
                let readiness = self
                    .limiter
                    .wait_until_ready(deadline, self.config.safety_margin)
                    .await?;
                if let Readiness::WouldExceedDeadline { wait } = readiness {
                    info!(?wait, "next call would cross the deadline, stopping");
                    return Ok(RecordStep::Stop(StopReason::TimeBudget));
                }

                let response = self.transport.request(subject).await;
                attempted += 1;
                match response {
                    Ok(results) => {
                        for source_field in &subject.source_fields {
                            let outcome = mapping.apply(&schema, source_field, &results, &values);
                            let counts =
                                persist(self.store.as_ref(), record, &outcome, &mut values).await?;
                            report.writes_applied += counts.written;
                            report.writes_rejected += counts.rejected;
                        }
                        self.recheck.mark_checked(&subject.key).await?;
                        report.subjects_checked += 1;
                        progress.subject_done(subject, true);
                    }
                    Err(e) => {
                        // Not marked: the subject stays due for the next cycle.
                        warn!(subject = %subject, error = %e, "subject check failed");
                        report.subjects_failed += 1;
                        progress.subject_done(subject, false);
                    }
                }
            }
            Ok::<_, EnricherError>(RecordStep::Done)
        }
        .await;

        let unused = (count - attempted) as u64;
        if unused > 0 {
            match self.budgets.refund(unused).await {
                Ok(()) => debug!(refunded = unused, "returned reservations for unsent subjects"),
                Err(refund) if step.is_err() => {
                    warn!(refunded = unused, error = %refund, "failed to refund reservations");
                }
                Err(refund) => return Err(refund),
            }
        }
        step
    }

    /// Minimum window a record with `subjects` subjects needs.
    pub fn window_for(&self, subjects: usize) -> Duration {
        self.config.safety_margin.saturating_add(
            self.limiter
                .min_interval()
                .saturating_mul(u32::try_from(subjects).unwrap_or(u32::MAX)),
        )
    }
}
