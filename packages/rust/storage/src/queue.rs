//! Work queue rows.

use chrono::{DateTime, Utc};
use enricher_shared::{EnricherError, RecordId, Result};
use libsql::params;

use crate::{Storage, db_err};

/// One queued record.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueRow {
    pub record_id: RecordId,
    pub enqueued_at: DateTime<Utc>,
    /// Run currently holding the entry, if any.
    pub claimed_by: Option<String>,
}

impl Storage {
    /// Insert a record into the queue unless it is already there.
    /// Returns `true` when a new row was created.
    pub async fn enqueue(&self, record_id: &RecordId, now: DateTime<Utc>) -> Result<bool> {
        self.check_writable()?;
        let inserted = self
            .conn
            .execute(
                "INSERT INTO queue (record_id, enqueued_at_ms) VALUES (?1, ?2)
                 ON CONFLICT(record_id) DO NOTHING",
                params![record_id.as_str(), now.timestamp_millis()],
            )
            .await
            .map_err(db_err)?;
        Ok(inserted == 1)
    }

    /// All queued records, oldest first.
    pub async fn list_queue(&self) -> Result<Vec<QueueRow>> {
        let mut rows = self
            .conn
            .query(
                "SELECT record_id, enqueued_at_ms, claimed_by FROM queue
                 ORDER BY enqueued_at_ms, record_id",
                params![],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let enqueued_ms: i64 = row.get(1).map_err(db_err)?;
            results.push(QueueRow {
                record_id: RecordId(row.get::<String>(0).map_err(db_err)?),
                enqueued_at: DateTime::from_timestamp_millis(enqueued_ms).ok_or_else(|| {
                    EnricherError::Storage(format!("invalid enqueue timestamp {enqueued_ms}"))
                })?,
                claimed_by: row.get::<String>(2).ok(),
            });
        }
        Ok(results)
    }

    /// Atomically claim a queued record for `run_id`.
    ///
    /// Succeeds when the entry is unclaimed, already held by `run_id`, or held
    /// by a claim older than `stale_before` (its run died without releasing).
    pub async fn claim_queue_entry(
        &self,
        record_id: &RecordId,
        run_id: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool> {
        self.check_writable()?;
        let claimed = self
            .conn
            .execute(
                "UPDATE queue SET claimed_by = ?2, claimed_at_ms = ?3
                 WHERE record_id = ?1
                   AND (claimed_by IS NULL OR claimed_by = ?2 OR claimed_at_ms <= ?4)",
                params![
                    record_id.as_str(),
                    run_id,
                    now.timestamp_millis(),
                    stale_before.timestamp_millis()
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(claimed == 1)
    }

    /// Give a claimed record back to the queue untouched.
    pub async fn release_queue_entry(&self, record_id: &RecordId, run_id: &str) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE queue SET claimed_by = NULL, claimed_at_ms = NULL
                 WHERE record_id = ?1 AND claimed_by = ?2",
                params![record_id.as_str(), run_id],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Delete a record's entry if `run_id` holds its claim.
    /// Returns `false` when the claim was lost to another run.
    pub async fn remove_claimed_queue_entry(&self, record_id: &RecordId, run_id: &str) -> Result<bool> {
        self.check_writable()?;
        let removed = self
            .conn
            .execute(
                "DELETE FROM queue WHERE record_id = ?1 AND claimed_by = ?2",
                params![record_id.as_str(), run_id],
            )
            .await
            .map_err(db_err)?;
        Ok(removed == 1)
    }

    /// Delete a record's entry regardless of claims.
    pub async fn remove_queue_entry(&self, record_id: &RecordId) -> Result<bool> {
        self.check_writable()?;
        let removed = self
            .conn
            .execute(
                "DELETE FROM queue WHERE record_id = ?1",
                params![record_id.as_str()],
            )
            .await
            .map_err(db_err)?;
        Ok(removed == 1)
    }
}
