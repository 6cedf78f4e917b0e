//! Recheck Cache: per-subject last check time and check count.

use std::sync::Arc;
use std::time::Duration;

use enricher_shared::{Clock, Result};
use enricher_storage::{CheckedSubjectRow, Storage};
use tracing::info;

/// Whether a subject may be sent to the service now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubjectStatus {
    /// Never checked, or the recheck interval has passed.
    pub due: bool,
    /// Used up its checks; skipped for good regardless of `due`.
    pub exhausted: bool,
}

impl SubjectStatus {
    pub fn eligible(&self) -> bool {
        self.due && !self.exhausted
    }
}

#[derive(Clone)]
pub struct RecheckCache {
    storage: Arc<Storage>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    max_retries: u32,
    prune_multiplier: u32,
}

impl RecheckCache {
    pub fn new(
        storage: Arc<Storage>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        max_retries: u32,
        prune_multiplier: u32,
    ) -> Self {
        Self {
            storage,
            clock,
            interval,
            max_retries,
            prune_multiplier,
        }
    }

    pub async fn status(&self, subject: &str) -> Result<SubjectStatus> {
        let entry = self.storage.get_checked_subject(subject).await?;
        Ok(SubjectStatus {
            due: self.due(entry.as_ref()),
            exhausted: entry.is_some_and(|e| e.retry_count >= self.max_retries),
        })
    }

    pub async fn is_due(&self, subject: &str) -> Result<bool> {
        Ok(self.status(subject).await?.due)
    }

    pub async fn can_retry(&self, subject: &str) -> Result<bool> {
        Ok(!self.status(subject).await?.exhausted)
    }

    /// Record a check that got a substantive answer.
    pub async fn mark_checked(&self, subject: &str) -> Result<()> {
        self.storage
            .mark_subject_checked(subject, self.clock.now())
            .await
    }

    /// Delete entries untouched for `prune_multiplier × interval`.
    pub async fn prune(&self) -> Result<u64> {
        let horizon = self.interval.saturating_mul(self.prune_multiplier);
        let horizon = chrono::Duration::from_std(horizon).unwrap_or(chrono::Duration::MAX);
        let Some(cutoff) = self.clock.now().checked_sub_signed(horizon) else {
            return Ok(0);
        };
        let pruned = self.storage.prune_checked_subjects(cutoff).await?;
        if pruned > 0 {
            info!(pruned, "pruned recheck cache");
        }
        Ok(pruned)
    }

    fn due(&self, entry: Option<&CheckedSubjectRow>) -> bool {
        let Some(entry) = entry else {
            return true;
        };
        let elapsed_ms = self
            .clock
            .now()
            .timestamp_millis()
            .saturating_sub(entry.last_checked_at_ms);
        u128::try_from(elapsed_ms).is_ok_and(|ms| ms >= self.interval.as_millis())
    }
}
