//! Budget Tracker: named consumable counters with joint reservation.

use std::sync::Arc;

use enricher_shared::{BudgetConfig, Clock, EnricherError, Result};
use enricher_storage::{BudgetRow, Storage};
use enricher_transport::StatusSource;
use tracing::{debug, info, instrument, warn};

const HOUR_MS: i64 = 3_600_000;
const MINUTE_MS: i64 = 60_000;

/// Tracks the configured budgets in shared storage.
#[derive(Clone)]
pub struct BudgetTracker {
    storage: Arc<Storage>,
    clock: Arc<dyn Clock>,
    budgets: Vec<BudgetConfig>,
}

impl BudgetTracker {
    pub fn new(storage: Arc<Storage>, clock: Arc<dyn Clock>, budgets: Vec<BudgetConfig>) -> Self {
        Self {
            storage,
            clock,
            budgets,
        }
    }

    /// Create or update the counters for every configured budget.
    pub async fn ensure(&self) -> Result<()> {
        let now = self.clock.now();
        for budget in &self.budgets {
            let period_ms = i64::try_from(budget.period_hours)
                .ok()
                .and_then(|h| h.checked_mul(HOUR_MS))
                .ok_or_else(|| {
                    EnricherError::config(format!("budget '{}' period is too long", budget.name))
                })?;
            self.storage
                .upsert_budget(&budget.name, budget.capacity, period_ms, now)
                .await?;
        }
        Ok(())
    }

    pub fn names(&self) -> Vec<String> {
        self.budgets.iter().map(|b| b.name.clone()).collect()
    }

    /// Units left in the current window; `None` for an unlimited budget.
    pub async fn remaining(&self, name: &str) -> Result<Option<u64>> {
        let row = self
            .storage
            .get_budget(name)
            .await?
            .ok_or_else(|| EnricherError::NotFound(format!("budget '{name}'")))?;
        if row.is_unlimited() {
            return Ok(None);
        }
        Ok(Some(row.remaining_at(self.clock.now().timestamp_millis())))
    }

    /// Stored state of every budget.
    pub async fn snapshot(&self) -> Result<Vec<BudgetRow>> {
        self.storage.list_budgets().await
    }

    /// Take `units` from every configured budget, or fail with
    /// [`EnricherError::QuotaExceeded`] having taken nothing.
    pub async fn reserve(&self, units: u64) -> Result<()> {
        self.reserve_from(&self.names(), units).await
    }

    /// Take `units` from each of `names` jointly.
    pub async fn reserve_from(&self, names: &[String], units: u64) -> Result<()> {
        if names.is_empty() || units == 0 {
            return Ok(());
        }
        self.storage
            .reserve_budgets(names, units, self.clock.now())
            .await?;
        debug!(units, budgets = ?names, "budget reserved");
        Ok(())
    }

    /// Return `units` reserved but never spent.
    pub async fn refund(&self, units: u64) -> Result<()> {
        let names = self.names();
        if names.is_empty() || units == 0 {
            return Ok(());
        }
        self.storage.refund_budgets(&names, units).await?;
        debug!(units, "budget refunded");
        Ok(())
    }

    /// Replace a budget's remaining count with the service's own figure.
    ///
    /// When the service cannot be reached the stored value is kept and
    /// `Ok(None)` is returned; neither exhaustion nor abundance is assumed.
    #[instrument(skip_all, fields(budget = %name))]
    pub async fn refresh(&self, name: &str, status: &dyn StatusSource) -> Result<Option<u64>> {
        match status.remaining(name).await {
            Ok(remaining) => {
                self.storage
                    .set_budget_remaining(name, remaining, self.clock.now())
                    .await?;
                info!(remaining, "budget refreshed from service");
                Ok(Some(remaining))
            }
            Err(e) => {
                warn!(error = %e, "budget refresh failed, keeping previous value");
                Ok(None)
            }
        }
    }

    /// Refresh every limited budget whose last refresh is older than its
    /// configured interval. Returns how many were refreshed.
    pub async fn refresh_stale(&self, status: &dyn StatusSource) -> Result<usize> {
        let now_ms = self.clock.now().timestamp_millis();
        let mut refreshed = 0;
        for budget in &self.budgets {
            if budget.capacity == 0 {
                continue;
            }
            let interval_ms = i64::try_from(budget.refresh_interval_mins)
                .unwrap_or(i64::MAX)
                .saturating_mul(MINUTE_MS);
            let last = self
                .storage
                .get_budget(&budget.name)
                .await?
                .and_then(|row| row.refreshed_at_ms);
            let due = match last {
                Some(at) => now_ms.saturating_sub(at) >= interval_ms,
                None => true,
            };
            if due && self.refresh(&budget.name, status).await?.is_some() {
                refreshed += 1;
            }
        }
        Ok(refreshed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeStatus, manual_clock, temp_storage};
    use std::time::Duration;

    fn budget(name: &str, capacity: u64) -> BudgetConfig {
        BudgetConfig {
            name: name.into(),
            capacity,
            period_hours: 24 * 30,
            refresh_interval_mins: 60,
        }
    }

    #[tokio::test]
    async fn failed_joint_reservation_leaves_counters_unchanged() {
        let storage = temp_storage().await;
        let tracker = BudgetTracker::new(
            storage,
            manual_clock(),
            vec![budget("detections", 5)],
        );
        tracker.ensure().await.unwrap();

        // R1 needs 3 subjects, R2 needs 4.
        tracker.reserve(3).await.unwrap();
        assert_eq!(tracker.remaining("detections").await.unwrap(), Some(2));

        let err = tracker.reserve(4).await.unwrap_err();
        assert!(matches!(err, EnricherError::QuotaExceeded { remaining: 2, .. }));
        assert_eq!(tracker.remaining("detections").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn joint_reservation_spans_every_budget() {
        let storage = temp_storage().await;
        let tracker = BudgetTracker::new(
            storage,
            manual_clock(),
            vec![budget("detections", 10), budget("questions", 2), budget("free", 0)],
        );
        tracker.ensure().await.unwrap();

        tracker.reserve(2).await.unwrap();
        assert!(tracker.reserve(1).await.is_err());
        assert_eq!(tracker.remaining("detections").await.unwrap(), Some(8));
        assert_eq!(tracker.remaining("questions").await.unwrap(), Some(0));
        assert_eq!(tracker.remaining("free").await.unwrap(), None);

        tracker.refund(1).await.unwrap();
        assert_eq!(tracker.remaining("detections").await.unwrap(), Some(9));
        assert_eq!(tracker.remaining("questions").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn window_resets_after_period() {
        let storage = temp_storage().await;
        let clock = manual_clock();
        let tracker = BudgetTracker::new(
            storage,
            clock.clone(),
            vec![BudgetConfig {
                period_hours: 24,
                ..budget("detections", 3)
            }],
        );
        tracker.ensure().await.unwrap();
        tracker.reserve(3).await.unwrap();
        assert_eq!(tracker.remaining("detections").await.unwrap(), Some(0));

        clock.advance(Duration::from_secs(24 * 3600));
        assert_eq!(tracker.remaining("detections").await.unwrap(), Some(3));
        tracker.reserve(1).await.unwrap();
        assert_eq!(tracker.remaining("detections").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn refreshed_value_survives_window_boundary() {
        let storage = temp_storage().await;
        let clock = manual_clock();
        let tracker = BudgetTracker::new(
            storage,
            clock.clone(),
            vec![BudgetConfig {
                period_hours: 24,
                ..budget("detections", 10)
            }],
        );
        tracker.ensure().await.unwrap();
        tracker.reserve(10).await.unwrap();

        clock.advance(Duration::from_secs(25 * 3600));
        let mut status = FakeStatus::default();
        status.remaining.insert("detections".into(), 4);
        assert_eq!(tracker.refresh("detections", &status).await.unwrap(), Some(4));
        assert_eq!(tracker.remaining("detections").await.unwrap(), Some(4));

        tracker.reserve(1).await.unwrap();
        assert_eq!(tracker.remaining("detections").await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn refresh_failure_keeps_prior_value() {
        let storage = temp_storage().await;
        let tracker = BudgetTracker::new(
            storage,
            manual_clock(),
            vec![budget("detections", 100), budget("questions", 50)],
        );
        tracker.ensure().await.unwrap();
        tracker.reserve(10).await.unwrap();

        let mut status = FakeStatus::default();
        status.remaining.insert("detections".into(), 70);

        assert_eq!(tracker.refresh("detections", &status).await.unwrap(), Some(70));
        assert_eq!(tracker.refresh("questions", &status).await.unwrap(), None);
        assert_eq!(tracker.remaining("detections").await.unwrap(), Some(70));
        assert_eq!(tracker.remaining("questions").await.unwrap(), Some(40));
    }

    #[tokio::test]
    async fn refresh_stale_respects_interval() {
        let storage = temp_storage().await;
        let clock = manual_clock();
        let tracker = BudgetTracker::new(
            storage,
            clock.clone(),
            vec![budget("detections", 100), budget("free", 0)],
        );
        tracker.ensure().await.unwrap();

        let mut status = FakeStatus::default();
        status.remaining.insert("detections".into(), 90);

        assert_eq!(tracker.refresh_stale(&status).await.unwrap(), 1);
        // Fresh now: nothing to do within the hour.
        clock.advance(Duration::from_secs(30 * 60));
        assert_eq!(tracker.refresh_stale(&status).await.unwrap(), 0);
        clock.advance(Duration::from_secs(31 * 60));
        assert_eq!(tracker.refresh_stale(&status).await.unwrap(), 1);

        // Unlimited budgets are never asked about.
        assert!(!status.asked.lock().unwrap().iter().any(|b| b == "free"));
    }
}
