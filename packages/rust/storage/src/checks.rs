//! Recheck cache rows.

use chrono::{DateTime, Utc};
use enricher_shared::Result;
use libsql::params;

use crate::{Storage, db_err};

/// When a subject was last checked and how many checks it has used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckedSubjectRow {
    pub subject: String,
    pub last_checked_at_ms: i64,
    pub retry_count: u32,
}

impl Storage {
    /// Look up a subject's cache entry.
    pub async fn get_checked_subject(&self, subject: &str) -> Result<Option<CheckedSubjectRow>> {
        let mut rows = self
            .conn
            .query(
                "SELECT subject, last_checked_at_ms, retry_count
                 FROM checked_subjects WHERE subject = ?1",
                params![subject],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(CheckedSubjectRow {
                subject: row.get::<String>(0).map_err(db_err)?,
                last_checked_at_ms: row.get::<i64>(1).map_err(db_err)?,
                retry_count: row.get::<u32>(2).map_err(db_err)?,
            })),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// Upsert a subject's check: stamp `now` (never moving backwards) and
    /// count one more check.
    pub async fn mark_subject_checked(&self, subject: &str, now: DateTime<Utc>) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO checked_subjects (subject, last_checked_at_ms, retry_count)
                 VALUES (?1, ?2, 1)
                 ON CONFLICT(subject) DO UPDATE SET
                   last_checked_at_ms = MAX(checked_subjects.last_checked_at_ms, excluded.last_checked_at_ms),
                   retry_count = checked_subjects.retry_count + 1",
                params![subject, now.timestamp_millis()],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Delete entries last checked before `cutoff`. Returns how many went.
    pub async fn prune_checked_subjects(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.check_writable()?;
        self.conn
            .execute(
                "DELETE FROM checked_subjects WHERE last_checked_at_ms < ?1",
                params![cutoff.timestamp_millis()],
            )
            .await
            .map_err(db_err)
    }

    /// Number of cache entries.
    pub async fn count_checked_subjects(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM checked_subjects", params![])
            .await
            .map_err(db_err)?;
        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).map_err(db_err)?.max(0) as u64),
            Ok(None) => Ok(0),
            Err(e) => Err(db_err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::test_support::test_storage;
    use chrono::{Duration, TimeZone, Utc};

    #[tokio::test]
    async fn mark_counts_and_never_moves_backwards() {
        let storage = test_storage().await;
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        storage.mark_subject_checked("https://example.com", t0).await.unwrap();
        storage
            .mark_subject_checked("https://example.com", t0 - Duration::days(1))
            .await
            .unwrap();

        let row = storage
            .get_checked_subject("https://example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.retry_count, 2);
        assert_eq!(row.last_checked_at_ms, t0.timestamp_millis());
    }

    #[tokio::test]
    async fn prune_removes_only_old_entries() {
        let storage = test_storage().await;
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        storage.mark_subject_checked("old", t0).await.unwrap();
        storage.mark_subject_checked("new", t0 + Duration::days(30)).await.unwrap();

        let pruned = storage
            .prune_checked_subjects(t0 + Duration::days(1))
            .await
            .unwrap();
        assert_eq!(pruned, 1);
        assert!(storage.get_checked_subject("old").await.unwrap().is_none());
        assert_eq!(storage.count_checked_subjects().await.unwrap(), 1);
    }
}
