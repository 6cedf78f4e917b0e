//! Candidate Selector: finds records that need enrichment and queues them.

use std::sync::Arc;

use enricher_shared::{Result, SelectionCriteria};
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::queue::WorkQueue;
use crate::store::RecordStore;
use crate::throttle::RateLimiter;

/// Throttle cell pacing selection passes across processes.
pub const SELECTION_THROTTLE_KEY: &str = "enricher.selection";

/// Result of one selection pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SelectionOutcome {
    /// Records matching the criteria.
    pub found: usize,
    /// Of those, how many were not queued yet.
    pub enqueued: usize,
}

pub struct CandidateSelector {
    store: Arc<dyn RecordStore>,
    queue: WorkQueue,
    criteria: SelectionCriteria,
    pacer: RateLimiter,
}

impl CandidateSelector {
    /// `pacer` spaces out passes triggered by [`select_if_due`](Self::select_if_due).
    pub fn new(
        store: Arc<dyn RecordStore>,
        queue: WorkQueue,
        criteria: SelectionCriteria,
        pacer: RateLimiter,
    ) -> Self {
        Self {
            store,
            queue,
            criteria,
            pacer,
        }
    }

    /// Search the record store and enqueue every match.
    #[instrument(skip_all)]
    pub async fn select(&self) -> Result<SelectionOutcome> {
        let ids = self.store.search(&self.criteria).await?;
        let mut outcome = SelectionOutcome {
            found: ids.len(),
            enqueued: 0,
        };
        for id in &ids {
            if self.queue.enqueue(id).await? {
                outcome.enqueued += 1;
            }
        }
        info!(found = outcome.found, enqueued = outcome.enqueued, "selection pass complete");
        Ok(outcome)
    }

    /// Run [`select`](Self::select) unless a pass happened within the
    /// selection interval (in this or any other process).
    pub async fn select_if_due(&self) -> Result<Option<SelectionOutcome>> {
        if !self.pacer.try_acquire().await? {
            debug!("selection not due yet");
            return Ok(None);
        }
        self.select().await.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{manual_clock, seed_site_fields, temp_storage};
    use enricher_shared::{FieldId, FieldValue, RecordId, SchemaId};
    use std::time::Duration;

    #[tokio::test]
    async fn selection_enqueues_missing_records_once() {
        let storage = temp_storage().await;
        seed_site_fields(&storage).await;
        let clock = manual_clock();
        for id in ["r1", "r2"] {
            storage
                .insert_record(&RecordId::from(id), &SchemaId::from("site"))
                .await
                .unwrap();
        }
        storage
            .set_value(
                &RecordId::from("r2"),
                &FieldId::from("cms"),
                &FieldValue::Text("Drupal".into()),
            )
            .await
            .unwrap();

        let queue = WorkQueue::new(storage.clone(), clock.clone(), Duration::from_secs(600));
        let selector = CandidateSelector::new(
            storage.clone(),
            queue.clone(),
            SelectionCriteria {
                schemas: vec![SchemaId::from("site")],
                missing_fields: vec!["Detected CMS".into()],
                limit: None,
            },
            RateLimiter::new(storage, clock.clone(), "selection", Duration::from_secs(3600)),
        );

        let first = selector.select_if_due().await.unwrap();
        assert_eq!(first, Some(SelectionOutcome { found: 1, enqueued: 1 }));
        assert_eq!(queue.snapshot().await.unwrap(), vec![RecordId::from("r1")]);

        // Paced: nothing happens within the hour.
        assert_eq!(selector.select_if_due().await.unwrap(), None);

        // An explicit pass still runs; r1 is already queued.
        let again = selector.select().await.unwrap();
        assert_eq!(again, SelectionOutcome { found: 1, enqueued: 0 });
    }
}
