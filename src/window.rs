use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::error::{Error, Result};

/// An inclusive calendar window `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start >= end {
            return Err(Error::InvalidWindow(format!(
                "window start {start} is not before end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start && instant <= self.end
    }

    /// Window length in weeks, as a fraction.
    pub fn weeks(&self) -> f64 {
        (self.end - self.start).num_seconds() as f64 / (7.0 * 86_400.0)
    }
}

impl std::fmt::Display for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} to {}",
            self.start.format("%Y-%m-%dT%H:%M:%SZ"),
            self.end.format("%Y-%m-%dT%H:%M:%SZ")
        )
    }
}

/// The before/after window pair bracketing an automation instant.
#[derive(Debug, Clone, Copy)]
pub struct WindowPlan {
    pub automation_at: DateTime<Utc>,
    pub before: Window,
    pub after: Window,
}

/// Derive the comparison windows from an automation instant and a lookback
/// duration in weeks.
///
/// "Before" ends one week ahead of the automation instant, leaving a buffer
/// week so in-flight PRs do not straddle the boundary:
/// `[A - 1w - L, A - 1w]`. "After" is `[A, A + L]`.
///
/// When no automation instant is supplied the current instant is
/// substituted, which makes the "after" window cover the future and
/// normally come back empty. Kept for parity with prior tooling.
pub fn plan_windows(
    automation_at: Option<DateTime<Utc>>,
    lookback_weeks: u32,
) -> Result<WindowPlan> {
    if lookback_weeks == 0 {
        return Err(Error::Config("lookback must be at least one week".into()));
    }

    let automation_at = match automation_at {
        Some(at) => at,
        None => {
            log::warn!(
                "No automation date supplied; using the current time. \
                 The \"after\" window will cover the future and likely be empty."
            );
            Utc::now()
        }
    };

    let lookback = Duration::weeks(lookback_weeks as i64);
    let before_end = automation_at - Duration::weeks(1);
    let before = Window::new(before_end - lookback, before_end)?;
    let after = Window::new(automation_at, automation_at + lookback)?;

    Ok(WindowPlan {
        automation_at,
        before,
        after,
    })
}
