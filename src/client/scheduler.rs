//! Proactive token refresh timer.
//!
//! At most one timer is live per scheduler: `arm` always cancels the previous
//! one first. The timer only fires the callback; performing the refresh and
//! handling its failure is the engine's job, and nothing here retries.

use crate::client::runtime::{self, MaybeSend, now_millis};
use crate::client::token_storage::TokenRecord;
use futures::future::{AbortHandle, abortable};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Computes how long to wait before refreshing `record`.
///
/// Returns `None` when proactive refresh is impossible, i.e. the record has
/// no `expires_at` or no refresh token. Overdue records yield zero.
pub fn refresh_delay(record: &TokenRecord, threshold: Duration, now: i64) -> Option<Duration> {
    let expires_at = record.expires_at?;
    record.refresh_token.as_ref()?;

    let delay = expires_at - now - threshold.as_millis() as i64;
    Some(Duration::from_millis(delay.max(0) as u64))
}

/// Armed timer slot, tagged so a fired timer only clears itself.
type TimerSlot = Arc<Mutex<Option<(u64, AbortHandle)>>>;

/// Single-shot refresh timer.
#[derive(Default)]
pub struct RefreshScheduler {
    timer: TimerSlot,
    next_id: AtomicU64,
}

impl RefreshScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms the timer for `record`, replacing any armed timer.
    ///
    /// Returns the chosen delay, or `None` if nothing was armed.
    pub fn arm<F>(&self, record: &TokenRecord, threshold: Duration, on_due: F) -> Option<Duration>
    where
        F: FnOnce() + MaybeSend + 'static,
    {
        self.disarm();

        let Some(delay) = refresh_delay(record, threshold, now_millis()) else {
            tracing::trace!("Refresh timer not armed: no expiry or refresh token");
            return None;
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = self.timer.clone();
        let (timer, handle) = abortable(async move {
            runtime::sleep(delay).await;
            {
                let mut slot = slot.lock();
                if slot.as_ref().is_some_and(|(current, _)| *current == id) {
                    *slot = None;
                }
            }
            tracing::trace!("Refresh timer fired");
            on_due();
        });
        *self.timer.lock() = Some((id, handle));
        runtime::spawn(async move {
            let _ = timer.await;
        });

        tracing::trace!("Refresh timer armed for {}ms", delay.as_millis());
        Some(delay)
    }

    /// Cancels the armed timer, if any.
    pub fn disarm(&self) {
        if let Some((_, handle)) = self.timer.lock().take() {
            handle.abort();
            tracing::trace!("Refresh timer disarmed");
        }
    }

    /// Returns true while a timer is armed and has neither fired nor been
    /// cancelled.
    pub fn is_armed(&self) -> bool {
        self.timer
            .lock()
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_aborted())
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.disarm();
    }
}
