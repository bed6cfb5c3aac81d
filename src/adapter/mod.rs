pub mod azure;
pub mod bitbucket;
pub mod github;
pub mod gitlab;

pub use azure::AzureAdapter;
pub use bitbucket::BitbucketAdapter;
pub use github::GithubAdapter;
pub use gitlab::GitlabAdapter;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::Result;
use crate::model::PrRecord;
use crate::transport::Request;
use crate::window::Window;

/// Pagination position. Offset platforms count pages from 1; cursor
/// platforms follow an opaque continuation token (`None` before the first
/// page).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageCursor {
    Offset { page: u32 },
    Cursor { after: Option<String> },
}

impl PageCursor {
    pub fn is_cursor(&self) -> bool {
        matches!(self, PageCursor::Cursor { .. })
    }

    /// The position after a page that could not be fetched. Offset pages
    /// are self-derivable; a lost cursor page takes its continuation token
    /// with it.
    pub fn skip_failed_page(&self) -> Option<PageCursor> {
        match self {
            PageCursor::Offset { page } => Some(PageCursor::Offset { page: page + 1 }),
            PageCursor::Cursor { .. } => None,
        }
    }
}

/// One parsed page of raw PR items, newest first, plus the position of the
/// next page (`None` when the server reports no further page).
#[derive(Debug, Clone)]
pub struct RawPage {
    pub items: Vec<Value>,
    pub next: Option<PageCursor>,
}

/// Platform-specific request construction and record normalization.
///
/// Adapters are pure: they build request descriptors and map raw payloads
/// to canonical records. All network traffic, caching, rate governance,
/// and retry policy live in the fetch layer.
pub trait PlatformAdapter: Send + Sync {
    /// Short platform label used in logs and progress output.
    fn label(&self) -> &'static str;

    fn initial_cursor(&self) -> PageCursor;

    /// Build the request for one page of PRs, newest first.
    fn page_request(&self, window: &Window, cursor: &PageCursor) -> Request;

    fn parse_page(&self, payload: &Value, cursor: &PageCursor) -> Result<RawPage>;

    /// Sequence number of a raw item, for logs and failure attribution.
    fn item_number(&self, item: &Value) -> Result<u64>;

    /// Creation instant of a raw item; drives the early-stop predicate.
    fn item_created_at(&self, item: &Value) -> Result<DateTime<Utc>>;

    /// Branch-filter predicate. Items out of scope are skipped silently.
    fn item_in_scope(&self, item: &Value) -> bool;

    /// Requests for per-record details (commits, comments, reviewers) not
    /// embedded in the page item. Empty when everything is embedded.
    fn detail_requests(&self, item: &Value) -> Result<Vec<Request>>;

    /// Request for the following page of a detail endpoint, judged from
    /// the page just fetched. `None` when that page was the last.
    /// Platforms whose details arrive whole keep the default.
    fn detail_next(&self, request: &Request, payload: &Value) -> Option<Request> {
        let _ = (request, payload);
        None
    }

    /// Fold one additional detail page into the accumulated payload.
    fn append_detail_page(&self, acc: &mut Value, page: Value) {
        let _ = (acc, page);
    }

    /// Map one raw item plus its detail payloads (in `detail_requests`
    /// order) to a canonical record.
    fn normalize(&self, item: &Value, details: &[Value]) -> Result<PrRecord>;

    /// Platform floor for explicit "retry after" waits, in seconds.
    fn min_retry_after_secs(&self) -> u64 {
        3
    }

    /// The branch filter in effect, if any.
    fn branch(&self) -> Option<&str>;
}

/// The same request pointed at the following page number.
pub(crate) fn next_page_request(request: &Request, param: &str) -> Request {
    let mut next = request.clone();
    for (key, value) in next.query.iter_mut() {
        if key == param {
            let page: u32 = value.parse().unwrap_or(1);
            *value = (page + 1).to_string();
            return next;
        }
    }
    // First page carried no page parameter
    next.query.push((param.to_string(), "2".to_string()));
    next
}
