use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::window::Window;

/// Per-record timeline metrics, in hours. Each value is `None` when the
/// record has no qualifying event for it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TimelineMetrics {
    pub time_to_first_comment_hours: Option<f64>,
    pub first_comment_to_followup_hours: Option<f64>,
    pub time_to_merge_hours: Option<f64>,
}

/// Aggregate over one calendar window.
///
/// Averages are `None` when no record in the window had a defined value;
/// records without a value are excluded from the denominator, never
/// treated as zero. `completed == false` together with failures
/// distinguishes "could not measure" from the all-zero "no activity".
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeriodSummary {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub total_prs: u64,
    pub merged_prs: u64,
    pub prs_per_week: f64,
    pub merged_per_week: f64,
    pub avg_comments_per_pr: Option<f64>,
    pub avg_time_to_merge_hours: Option<f64>,
    pub avg_time_to_first_comment_hours: Option<f64>,
    pub avg_first_comment_to_followup_hours: Option<f64>,
    pub unique_contributors: u64,
    pub failed_records: u64,
    pub completed: bool,
}

impl PeriodSummary {
    /// An empty summary for a window that produced nothing.
    pub fn empty(window: &Window, failed: u64, completed: bool) -> Self {
        Self {
            window_start: window.start,
            window_end: window.end,
            total_prs: 0,
            merged_prs: 0,
            prs_per_week: 0.0,
            merged_per_week: 0.0,
            avg_comments_per_pr: None,
            avg_time_to_merge_hours: None,
            avg_time_to_first_comment_hours: None,
            avg_first_comment_to_followup_hours: None,
            unique_contributors: 0,
            failed_records: failed,
            completed,
        }
    }

    /// True when the window saw no activity at all, as opposed to having
    /// failed to measure it.
    pub fn is_quiet(&self) -> bool {
        self.total_prs == 0 && self.failed_records == 0 && self.completed
    }
}

/// Two labeled period summaries bracketing the automation instant.
#[derive(Debug, Clone, Serialize)]
pub struct ComparativeResult {
    pub automation_at: DateTime<Utc>,
    pub branch: Option<String>,
    pub before: PeriodSummary,
    pub after: PeriodSummary,
}
