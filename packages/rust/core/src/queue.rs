//! Work Queue: durable, idempotent set of records awaiting enrichment.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use enricher_shared::{Clock, RecordId, Result};
use enricher_storage::{QueueRow, Storage};
use tracing::debug;

/// Handle on the shared queue table.
///
/// Dispatch goes through [`claim`](Self::claim): a record is processed only
/// by the run holding its claim, so overlapping invocations never both work
/// on it. A claim whose run died is taken over once `lease` has passed.
#[derive(Clone)]
pub struct WorkQueue {
    storage: Arc<Storage>,
    clock: Arc<dyn Clock>,
    lease: Duration,
}

impl WorkQueue {
    pub fn new(storage: Arc<Storage>, clock: Arc<dyn Clock>, lease: Duration) -> Self {
        Self {
            storage,
            clock,
            lease,
        }
    }

    /// Add a record; a record already queued keeps its place.
    pub async fn enqueue(&self, id: &RecordId) -> Result<bool> {
        let inserted = self.storage.enqueue(id, self.clock.now()).await?;
        if inserted {
            debug!(record_id = %id, "enqueued");
        }
        Ok(inserted)
    }

    /// Queued record ids, oldest first. Nothing is removed.
    pub async fn snapshot(&self) -> Result<Vec<RecordId>> {
        Ok(self
            .storage
            .list_queue()
            .await?
            .into_iter()
            .map(|row| row.record_id)
            .collect())
    }

    /// Full queue rows, for status display.
    pub async fn entries(&self) -> Result<Vec<QueueRow>> {
        self.storage.list_queue().await
    }

    /// Claim a record for `run_id`. `false` means another live run holds it
    /// or it is no longer queued.
    pub async fn claim(&self, id: &RecordId, run_id: &str) -> Result<bool> {
        let now = self.clock.now();
        let lease = chrono::Duration::from_std(self.lease).unwrap_or(chrono::Duration::MAX);
        let stale_before = now.checked_sub_signed(lease).unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.storage
            .claim_queue_entry(id, run_id, now, stale_before)
            .await
    }

    /// Hand a claimed record back untouched.
    pub async fn release(&self, id: &RecordId, run_id: &str) -> Result<()> {
        self.storage.release_queue_entry(id, run_id).await
    }

    /// Remove a record claimed by `run_id`.
    pub async fn remove(&self, id: &RecordId, run_id: &str) -> Result<bool> {
        self.storage.remove_claimed_queue_entry(id, run_id).await
    }

    /// Remove a record regardless of claims (operator use).
    pub async fn discard(&self, id: &RecordId) -> Result<bool> {
        self.storage.remove_queue_entry(id).await
    }
}
