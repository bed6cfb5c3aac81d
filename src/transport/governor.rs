use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;

use super::RateInfo;

/// Remaining-quota assumed at startup, before the first response reports
/// the real figure.
const INITIAL_QUOTA: u32 = 5000;
/// Calls kept in reserve; the governor pauses before dipping into them.
const QUOTA_BUFFER: u32 = 100;
/// Pause when the quota is low but no reset time is known.
const FALLBACK_PAUSE_SECS: u64 = 10;
/// Upper bound on any single voluntary pause. Must admit the fetch
/// layer's largest backoff step.
const MAX_PAUSE_SECS: u64 = 240;

/// Tracks the remaining call quota and enforces pauses before exhaustion.
///
/// One instance is created per comparison run and shared by every worker
/// in that run; the quota state sits behind a mutex that is never held
/// across an await point. This is the only component that sleeps for
/// flow control.
pub struct RateGovernor {
    state: Mutex<GovernorState>,
    min_retry_after_secs: u64,
}

struct GovernorState {
    remaining: u32,
    reset_epoch: Option<u64>,
}

impl RateGovernor {
    /// `min_retry_after_secs` is the platform-specific floor applied to
    /// explicit "retry after" signals.
    pub fn new(min_retry_after_secs: u64) -> Self {
        Self {
            state: Mutex::new(GovernorState {
                remaining: INITIAL_QUOTA,
                reset_epoch: None,
            }),
            min_retry_after_secs,
        }
    }

    /// Block until it is safe to issue another call.
    pub async fn before_call(&self) {
        let pause = {
            let mut state = self.state.lock().expect("governor lock poisoned");
            if state.remaining >= QUOTA_BUFFER {
                None
            } else {
                let wait = pause_until_reset(state.reset_epoch);
                // Assume a refreshed quota after the pause; the next
                // response corrects the estimate.
                state.remaining = INITIAL_QUOTA;
                state.reset_epoch = None;
                Some(wait)
            }
        };
        if let Some(wait) = pause {
            log::warn!(
                "Approaching rate limit; pausing {}s until quota reset",
                wait.as_secs()
            );
            tokio::time::sleep(wait).await;
        }
    }

    /// Record quota metadata from a successful response.
    pub fn record(&self, rate: &RateInfo) {
        let mut state = self.state.lock().expect("governor lock poisoned");
        if let Some(remaining) = rate.remaining {
            state.remaining = remaining;
        } else {
            state.remaining = state.remaining.saturating_sub(1);
        }
        if rate.reset_epoch.is_some() {
            state.reset_epoch = rate.reset_epoch;
        }
    }

    /// Block for an explicit "retry after" signal, honoring the platform
    /// minimum. `fallback_secs` is used when the server gave no hint.
    pub async fn hold_for_retry(&self, retry_after: Option<u64>, fallback_secs: u64) {
        let wait = retry_after
            .unwrap_or(fallback_secs)
            .max(self.min_retry_after_secs)
            .min(MAX_PAUSE_SECS);
        log::warn!("Rate limited; waiting {wait}s before retry");
        tokio::time::sleep(Duration::from_secs(wait)).await;
    }
}

fn pause_until_reset(reset_epoch: Option<u64>) -> Duration {
    let secs = match reset_epoch {
        Some(epoch) => {
            let now = Utc::now().timestamp().max(0) as u64;
            epoch.saturating_sub(now).max(1)
        }
        None => FALLBACK_PAUSE_SECS,
    };
    Duration::from_secs(secs.min(MAX_PAUSE_SECS))
}
