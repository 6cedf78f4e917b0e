//! Rate Limiter: minimum spacing between dispatches sharing one key.
//!
//! The last dispatch instant lives in a shared throttle cell and is only
//! moved by compare-and-swap, so concurrent processes using the same key
//! cannot both believe they are first. The cell is stamped when a call is
//! dispatched, not when its response arrives.

use std::sync::Arc;
use std::time::Duration;

use enricher_shared::{Clock, Deadline, Result};
use enricher_storage::Storage;
use tracing::{debug, trace};

/// Outcome of [`RateLimiter::wait_until_ready`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The caller owns the current slot and must dispatch now.
    Ready,
    /// Waiting for the next slot would run past the deadline. Nothing was
    /// stamped.
    WouldExceedDeadline { wait: Duration },
}

#[derive(Clone)]
pub struct RateLimiter {
    storage: Arc<Storage>,
    clock: Arc<dyn Clock>,
    key: String,
    min_interval: Duration,
}

impl RateLimiter {
    pub fn new(
        storage: Arc<Storage>,
        clock: Arc<dyn Clock>,
        key: impl Into<String>,
        min_interval: Duration,
    ) -> Self {
        Self {
            storage,
            clock,
            key: key.into(),
            min_interval,
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait until `min_interval` has passed since the last dispatch, then
    /// claim the slot.
    ///
    /// The wait is never shortened: if it would leave less than `margin`
    /// before `deadline`, returns [`Readiness::WouldExceedDeadline`] instead
    /// of sleeping.
    pub async fn wait_until_ready(&self, deadline: &Deadline, margin: Duration) -> Result<Readiness> {
        loop {
            let seen = self.storage.get_throttle_stamp(&self.key).await?;
            let wait = self.wait_after(seen);

            if !wait.is_zero() {
                let remaining = deadline.remaining(self.clock.as_ref());
                if wait.saturating_add(margin) > remaining {
                    debug!(key = %self.key, ?wait, ?remaining, "rate limit wait would cross the deadline");
                    return Ok(Readiness::WouldExceedDeadline { wait });
                }
                trace!(key = %self.key, ?wait, "waiting for rate limit slot");
                self.clock.sleep(wait).await;
                continue;
            }

            let now = self.clock.now();
            if self.storage.swap_throttle_stamp(&self.key, seen, now).await? {
                return Ok(Readiness::Ready);
            }
            // Another process took the slot between read and swap.
            trace!(key = %self.key, "lost rate limit slot, retrying");
        }
    }

    /// Claim the slot only if it is free right now. Never waits.
    pub async fn try_acquire(&self) -> Result<bool> {
        let seen = self.storage.get_throttle_stamp(&self.key).await?;
        if !self.wait_after(seen).is_zero() {
            return Ok(false);
        }
        self.storage
            .swap_throttle_stamp(&self.key, seen, self.clock.now())
            .await
    }

    /// Time still to wait after a dispatch stamped at `last_ms`. A stamp in
    /// the future (clock skew between hosts) counts as "just now".
    fn wait_after(&self, last_ms: Option<i64>) -> Duration {
        let Some(last_ms) = last_ms else {
            return Duration::ZERO;
        };
        let now_ms = self.clock.now().timestamp_millis();
        let elapsed = Duration::from_millis(u64::try_from(now_ms.saturating_sub(last_ms)).unwrap_or(0));
        self.min_interval.saturating_sub(elapsed)
    }
}
