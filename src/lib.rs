//! Comparative pull-request velocity metrics.
//!
//! Fetches PRs from a hosting platform for two calendar windows bracketing
//! an automation rollout, normalizes them into canonical records, and
//! reduces each window to a period summary so the before/after deltas can
//! be read side by side.

pub mod adapter;
pub mod error;
pub mod fetch;
pub mod metrics;
pub mod model;
pub mod normalize;
pub mod transport;
pub mod window;

pub use adapter::{AzureAdapter, BitbucketAdapter, GithubAdapter, GitlabAdapter, PlatformAdapter};
pub use error::{Error, Result};
pub use fetch::{Fetcher, NoopProgress, Progress, WindowFetch};
pub use metrics::{ComparativeResult, PeriodSummary, TimelineMetrics};
pub use model::{PrRecord, PrState};
pub use transport::{HttpTransport, Transport};
pub use window::{plan_windows, Window, WindowPlan};

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::transport::cache::ResponseCache;
use crate::transport::governor::RateGovernor;

/// Options for one comparative analysis run.
#[derive(Debug, Clone)]
pub struct AnalysisOptions {
    /// When the automation went live. `None` substitutes the current time.
    pub automation_at: Option<DateTime<Utc>>,
    /// Length of each comparison window, in whole weeks.
    pub lookback_weeks: u32,
    /// Concurrent detail-fetch limit. `None` keeps the default.
    pub max_in_flight: Option<usize>,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            automation_at: None,
            lookback_weeks: 4,
            max_in_flight: None,
        }
    }
}

/// Main entry point: runs the full fetch/normalize/aggregate pipeline
/// against one platform adapter.
pub struct VelocityAnalyzer {
    transport: Arc<dyn Transport>,
}

impl VelocityAnalyzer {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Fetch both windows and reduce them into a comparative result.
    ///
    /// The response cache and rate governor are scoped to the run, shared
    /// between the two windows so overlapping requests are paid for once
    /// and the platform quota is respected globally.
    pub async fn compare(
        &self,
        adapter: &dyn PlatformAdapter,
        options: &AnalysisOptions,
        progress: &dyn Progress,
    ) -> Result<ComparativeResult> {
        let plan = plan_windows(options.automation_at, options.lookback_weeks)?;

        let cache = Arc::new(ResponseCache::new());
        let governor = Arc::new(RateGovernor::new(adapter.min_retry_after_secs()));
        let mut fetcher = Fetcher::new(self.transport.clone(), cache, governor);
        if let Some(limit) = options.max_in_flight {
            fetcher = fetcher.with_max_in_flight(limit);
        }

        log::info!(
            "Comparing {} activity around {}",
            adapter.label(),
            plan.automation_at.format("%Y-%m-%d")
        );

        let (before_fetch, after_fetch) = tokio::join!(
            fetcher.fetch_window(adapter, &plan.before, "before", progress),
            fetcher.fetch_window(adapter, &plan.after, "after", progress),
        );

        let before = metrics::summarize(
            &plan.before,
            &before_fetch.records,
            before_fetch.failed,
            !before_fetch.aborted,
        );
        let after = metrics::summarize(
            &plan.after,
            &after_fetch.records,
            after_fetch.failed,
            !after_fetch.aborted,
        );

        Ok(ComparativeResult {
            automation_at: plan.automation_at,
            branch: adapter.branch().map(str::to_string),
            before,
            after,
        })
    }
}
