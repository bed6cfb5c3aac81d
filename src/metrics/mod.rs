pub mod types;

pub use types::*;

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::model::{PrRecord, PrState};
use crate::window::Window;

const SECS_PER_HOUR: f64 = 3600.0;

/// Compute the timeline metrics for one record.
///
/// Pure function of the record alone; safe to evaluate in parallel across
/// records.
pub fn compute_timeline(record: &PrRecord) -> TimelineMetrics {
    let first_comment_at = first_qualifying_comment(record);

    TimelineMetrics {
        time_to_first_comment_hours: first_comment_at
            .map(|at| hours_between(record.created_at, at)),
        first_comment_to_followup_hours: first_comment_at.and_then(|first| {
            followup_commit_after(record, first).map(|at| hours_between(first, at))
        }),
        time_to_merge_hours: match record.state {
            PrState::Merged => record
                .merged_at
                .map(|at| hours_between(record.created_at, at)),
            _ => None,
        },
    }
}

/// Earliest comment or review submission by a non-automated identity other
/// than the PR's own author.
fn first_qualifying_comment(record: &PrRecord) -> Option<DateTime<Utc>> {
    record
        .comments
        .iter()
        .filter(|c| !c.author_is_bot && c.author != record.author)
        .map(|c| c.at)
        .min()
}

/// Earliest commit by the PR author strictly after `first`.
///
/// Matches on the commit's login when the platform supplies one, falling
/// back to the raw author name otherwise.
fn followup_commit_after(record: &PrRecord, first: DateTime<Utc>) -> Option<DateTime<Utc>> {
    record
        .commits
        .iter()
        .filter(|c| match &c.author_login {
            Some(login) => login == &record.author,
            None => c.author_name == record.author,
        })
        .filter(|c| c.committed_at > first)
        .map(|c| c.committed_at)
        .min()
}

fn hours_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_seconds() as f64 / SECS_PER_HOUR
}

/// Reduce a window's records into one period summary.
///
/// The reduction is commutative: input order does not affect any field.
/// Averages run over the defined subset only.
pub fn summarize(
    window: &Window,
    records: &[PrRecord],
    failed: u64,
    completed: bool,
) -> PeriodSummary {
    if records.is_empty() {
        return PeriodSummary::empty(window, failed, completed);
    }

    let weeks = window.weeks();
    let total = records.len() as u64;
    let merged = records
        .iter()
        .filter(|r| r.state == PrState::Merged)
        .count() as u64;

    let total_comments: u64 = records.iter().map(|r| r.comment_count).sum();

    let mut contributors: BTreeSet<&str> = BTreeSet::new();
    for record in records {
        if !record.author_is_bot {
            contributors.insert(record.author.as_str());
        }
        contributors.extend(record.reviewers.iter().map(String::as_str));
        contributors.extend(record.commenters.iter().map(String::as_str));
    }

    let mut merge_hours = Vec::new();
    let mut first_comment_hours = Vec::new();
    let mut followup_hours = Vec::new();
    for record in records {
        let timeline = compute_timeline(record);
        if let Some(v) = timeline.time_to_merge_hours {
            merge_hours.push(v);
        }
        if let Some(v) = timeline.time_to_first_comment_hours {
            first_comment_hours.push(v);
        }
        if let Some(v) = timeline.first_comment_to_followup_hours {
            followup_hours.push(v);
        }
    }

    PeriodSummary {
        window_start: window.start,
        window_end: window.end,
        total_prs: total,
        merged_prs: merged,
        prs_per_week: total as f64 / weeks,
        merged_per_week: merged as f64 / weeks,
        avg_comments_per_pr: Some(total_comments as f64 / total as f64),
        avg_time_to_merge_hours: mean(&merge_hours),
        avg_time_to_first_comment_hours: mean(&first_comment_hours),
        avg_first_comment_to_followup_hours: mean(&followup_hours),
        unique_contributors: contributors.len() as u64,
        failed_records: failed,
        completed,
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}
