//! Budget counter rows and joint reservations.

use chrono::{DateTime, Utc};
use enricher_shared::{EnricherError, Result};
use libsql::{TransactionBehavior, params};

use crate::{Storage, db_err};

/// Persisted state of one named budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BudgetRow {
    pub name: String,
    /// Units per window; 0 means unlimited.
    pub capacity: u64,
    pub remaining: u64,
    pub period_ms: i64,
    pub window_start_ms: i64,
    pub refreshed_at_ms: Option<i64>,
}

impl BudgetRow {
    pub fn is_unlimited(&self) -> bool {
        self.capacity == 0
    }

    /// Remaining units as of `now_ms`, accounting for a window rollover
    /// that has not been written yet.
    pub fn remaining_at(&self, now_ms: i64) -> u64 {
        if self.window_expired(now_ms) {
            self.capacity
        } else {
            self.remaining
        }
    }

    fn window_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.window_start_ms.saturating_add(self.period_ms)
    }
}

impl Storage {
    /// Register a budget, or update its capacity and period.
    ///
    /// Remaining is clamped to the new capacity; a budget that was unlimited
    /// starts full.
    pub async fn upsert_budget(
        &self,
        name: &str,
        capacity: u64,
        period_ms: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.check_writable()?;
        let capacity = to_i64(capacity)?;
        self.conn
            .execute(
                "INSERT INTO budget_counters (name, capacity, remaining, period_ms, window_start_ms)
                 VALUES (?1, ?2, ?2, ?3, ?4)
                 ON CONFLICT(name) DO UPDATE SET
                   remaining = CASE
                     WHEN budget_counters.capacity = 0 THEN excluded.capacity
                     ELSE MIN(budget_counters.remaining, excluded.capacity)
                   END,
                   capacity = excluded.capacity,
                   period_ms = excluded.period_ms",
                params![name, capacity, period_ms, now.timestamp_millis()],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Read one budget.
    pub async fn get_budget(&self, name: &str) -> Result<Option<BudgetRow>> {
        let mut rows = self
            .conn
            .query(
                "SELECT name, capacity, remaining, period_ms, window_start_ms, refreshed_at_ms
                 FROM budget_counters WHERE name = ?1",
                params![name],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_budget(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// All budgets, by name.
    pub async fn list_budgets(&self) -> Result<Vec<BudgetRow>> {
        let mut rows = self
            .conn
            .query(
                "SELECT name, capacity, remaining, period_ms, window_start_ms, refreshed_at_ms
                 FROM budget_counters ORDER BY name",
                params![],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_budget(&row)?);
        }
        Ok(results)
    }

    /// Take `units` from every named budget, or from none of them.
    ///
    /// Runs in one `BEGIN IMMEDIATE` transaction: expired windows are rolled
    /// over, every limited counter is checked, and only if all of them can
    /// cover `units` are they decremented together. Unlimited counters are
    /// left untouched.
    pub async fn reserve_budgets(
        &self,
        names: &[String],
        units: u64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.check_writable()?;
        let now_ms = now.timestamp_millis();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(db_err)?;

        let mut updates: Vec<(String, u64, i64)> = Vec::with_capacity(names.len());
        for name in names {
            let mut rows = tx
                .query(
                    "SELECT name, capacity, remaining, period_ms, window_start_ms, refreshed_at_ms
                     FROM budget_counters WHERE name = ?1",
                    params![name.as_str()],
                )
                .await
                .map_err(db_err)?;
            let row = match rows.next().await.map_err(db_err)? {
                Some(row) => row_to_budget(&row)?,
                None => {
                    drop(rows);
                    tx.rollback().await.map_err(db_err)?;
                    return Err(EnricherError::NotFound(format!("budget '{name}'")));
                }
            };
            drop(rows);

            if row.is_unlimited() {
                continue;
            }

            let (remaining, window_start_ms) = if row.window_expired(now_ms) {
                (row.capacity, now_ms)
            } else {
                (row.remaining, row.window_start_ms)
            };

            if remaining < units {
                tx.rollback().await.map_err(db_err)?;
                return Err(EnricherError::QuotaExceeded {
                    name: name.clone(),
                    requested: units,
                    remaining,
                });
            }
            updates.push((name.clone(), remaining - units, window_start_ms));
        }

        for (name, remaining, window_start_ms) in &updates {
            tx.execute(
                "UPDATE budget_counters SET remaining = ?1, window_start_ms = ?2 WHERE name = ?3",
                params![to_i64(*remaining)?, *window_start_ms, name.as_str()],
            )
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    /// Give back `units` to every named limited budget, never exceeding capacity.
    pub async fn refund_budgets(&self, names: &[String], units: u64) -> Result<()> {
        self.check_writable()?;
        let units = to_i64(units)?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(db_err)?;
        for name in names {
            tx.execute(
                "UPDATE budget_counters SET remaining = MIN(capacity, remaining + ?1)
                 WHERE name = ?2 AND capacity > 0",
                params![units, name.as_str()],
            )
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    /// Overwrite a limited budget's remaining count with an authoritative value.
    ///
    /// The value describes the current window, so an expired window is rolled
    /// forward to `now` in the same statement.
    pub async fn set_budget_remaining(
        &self,
        name: &str,
        remaining: u64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE budget_counters SET
                   remaining = MIN(capacity, ?1),
                   refreshed_at_ms = ?2,
                   window_start_ms = CASE
                     WHEN ?2 >= window_start_ms + period_ms THEN ?2
                     ELSE window_start_ms
                   END
                 WHERE name = ?3 AND capacity > 0",
                params![to_i64(remaining)?, now.timestamp_millis(), name],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| EnricherError::validation(format!("budget value {value} out of range")))
}

/// Convert a database row to a [`BudgetRow`].
fn row_to_budget(row: &libsql::Row) -> Result<BudgetRow> {
    let capacity: i64 = row.get(1).map_err(db_err)?;
    let remaining: i64 = row.get(2).map_err(db_err)?;
    Ok(BudgetRow {
        name: row.get::<String>(0).map_err(db_err)?,
        capacity: capacity.max(0) as u64,
        remaining: remaining.max(0) as u64,
        period_ms: row.get::<i64>(3).map_err(db_err)?,
        window_start_ms: row.get::<i64>(4).map_err(db_err)?,
        refreshed_at_ms: row.get::<i64>(5).ok(),
    })
}
