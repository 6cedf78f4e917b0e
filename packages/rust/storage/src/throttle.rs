//! Shared dispatch stamps for rate limiting and pacing.

use chrono::{DateTime, Utc};
use enricher_shared::Result;
use libsql::params;

use crate::{Storage, db_err};

impl Storage {
    /// Last stamp written to a throttle cell, in ms since the epoch.
    pub async fn get_throttle_stamp(&self, key: &str) -> Result<Option<i64>> {
        let mut rows = self
            .conn
            .query(
                "SELECT last_at_ms FROM throttle_cells WHERE key = ?1",
                params![key],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row.get::<i64>(0).map_err(db_err)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// Compare-and-swap a throttle cell from `expected` to `now`.
    ///
    /// `expected = None` means the cell must not exist yet. Returns `false`
    /// when another process changed the cell first.
    pub async fn swap_throttle_stamp(
        &self,
        key: &str,
        expected: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.check_writable()?;
        let changed = match expected {
            None => self
                .conn
                .execute(
                    "INSERT INTO throttle_cells (key, last_at_ms) VALUES (?1, ?2)
                     ON CONFLICT(key) DO NOTHING",
                    params![key, now.timestamp_millis()],
                )
                .await
                .map_err(db_err)?,
            Some(previous) => self
                .conn
                .execute(
                    "UPDATE throttle_cells SET last_at_ms = ?3 WHERE key = ?1 AND last_at_ms = ?2",
                    params![key, previous, now.timestamp_millis()],
                )
                .await
                .map_err(db_err)?,
        };
        Ok(changed == 1)
    }
}
