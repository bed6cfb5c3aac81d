//! End-to-end pipeline tests over a scripted transport and the GitLab
//! adapter: window derivation, early-stop pagination, caching, partial
//! failures, and aggregation all working together.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use prvelocity::adapter::{GithubAdapter, GitlabAdapter, PageCursor, PlatformAdapter};
use prvelocity::fetch::{Fetcher, NoopProgress};
use prvelocity::metrics::summarize;
use prvelocity::transport::cache::ResponseCache;
use prvelocity::transport::governor::RateGovernor;
use prvelocity::transport::{ApiResponse, CallError, RateInfo, Request, Transport};
use prvelocity::{plan_windows, AnalysisOptions, Error, VelocityAnalyzer, Window};

/// Transport whose responses are scripted per request. Requests marked
/// transient fail retryably every time; unscripted requests fail fatally
/// so a test notices any call it did not plan for.
struct ScriptedTransport {
    responses: HashMap<String, Value>,
    transient: HashSet<String>,
    calls: AtomicUsize,
}

impl ScriptedTransport {
    fn new() -> Self {
        Self {
            responses: HashMap::new(),
            transient: HashSet::new(),
            calls: AtomicUsize::new(0),
        }
    }

    fn script(&mut self, request: &Request, payload: Value) {
        self.responses.insert(key_of(request), payload);
    }

    fn script_transient(&mut self, request: &Request) {
        self.transient.insert(key_of(request));
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn key_of(request: &Request) -> String {
    let mut query = request.query.clone();
    query.sort();
    let body = request
        .body
        .as_ref()
        .map(|b| b.to_string())
        .unwrap_or_default();
    format!("{} {} {query:?} {body}", request.op, request.url)
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(&self, request: &Request) -> Result<ApiResponse, CallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.transient.contains(&key_of(request)) {
            return Err(CallError::Transient {
                reason: "server error 503".into(),
                retry_after: Some(0),
            });
        }
        match self.responses.get(&key_of(request)) {
            Some(payload) => Ok(ApiResponse {
                payload: payload.clone(),
                rate: RateInfo::default(),
            }),
            None => Err(CallError::Fatal(Error::NotFound(format!(
                "unscripted request: {}",
                key_of(request)
            )))),
        }
    }
}

fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

fn mr(iid: u64, created: &str, author: &str, state: &str) -> Value {
    let merged_at = if state == "merged" {
        // Merged a day after creation
        let merged = ts(created) + chrono::Duration::days(1);
        json!(merged.to_rfc3339())
    } else {
        Value::Null
    };
    json!({
        "iid": iid,
        "created_at": created,
        "merged_at": merged_at,
        "closed_at": null,
        "state": state,
        "target_branch": "main",
        "author": {"username": author},
        "reviewers": []
    })
}

/// Script one MR's notes and commits.
fn script_details(
    transport: &mut ScriptedTransport,
    adapter: &GitlabAdapter,
    item: &Value,
    notes: Value,
    commits: Value,
) {
    let requests = adapter.detail_requests(item).unwrap();
    transport.script(&requests[0], notes);
    transport.script(&requests[1], commits);
}

fn script_page(
    transport: &mut ScriptedTransport,
    adapter: &GitlabAdapter,
    window: &Window,
    page: u32,
    items: Vec<Value>,
) {
    let request = adapter.page_request(window, &PageCursor::Offset { page });
    transport.script(&request, Value::Array(items));
}

fn adapter() -> GitlabAdapter {
    GitlabAdapter::new("42", None, None).unwrap()
}

fn fetcher(transport: Arc<dyn Transport>) -> Fetcher {
    Fetcher::new(
        transport,
        Arc::new(ResponseCache::new()),
        Arc::new(RateGovernor::new(0)),
    )
}

#[tokio::test]
async fn test_compare_end_to_end() {
    let a = adapter();
    let automation = ts("2024-06-15T00:00:00Z");
    let plan = plan_windows(Some(automation), 2).unwrap();

    let mut transport = ScriptedTransport::new();

    // Before window [2024-05-25, 2024-06-08]: one merged human MR and one
    // bot MR. Newest first.
    let before_human = mr(1, "2024-06-01T00:00:00Z", "alice", "merged");
    let before_bot = mr(2, "2024-05-28T00:00:00Z", "dependabot", "merged");
    script_page(
        &mut transport,
        &a,
        &plan.before,
        1,
        vec![before_human.clone(), before_bot.clone()],
    );
    script_details(
        &mut transport,
        &a,
        &before_human,
        json!([{"system": false, "author": {"username": "bob"},
                "created_at": "2024-06-01T02:00:00Z"}]),
        json!([]),
    );
    script_details(&mut transport, &a, &before_bot, json!([]), json!([]));

    // After window [2024-06-15, 2024-06-29]: one open MR.
    let after_open = mr(3, "2024-06-20T00:00:00Z", "carol", "opened");
    script_page(&mut transport, &a, &plan.after, 1, vec![after_open.clone()]);
    script_details(&mut transport, &a, &after_open, json!([]), json!([]));

    let analyzer = VelocityAnalyzer::new(Arc::new(transport));
    let options = AnalysisOptions {
        automation_at: Some(automation),
        lookback_weeks: 2,
        max_in_flight: None,
    };
    let result = analyzer
        .compare(&a, &options, &NoopProgress)
        .await
        .unwrap();

    assert_eq!(result.automation_at, automation);
    assert_eq!(result.before.total_prs, 2);
    assert_eq!(result.before.merged_prs, 2);
    assert!(result.before.completed);
    // alice + bob; dependabot is excluded
    assert_eq!(result.before.unique_contributors, 2);
    assert_eq!(result.before.avg_time_to_merge_hours, Some(24.0));
    assert_eq!(result.before.avg_time_to_first_comment_hours, Some(2.0));

    assert_eq!(result.after.total_prs, 1);
    assert_eq!(result.after.merged_prs, 0);
    assert_eq!(result.after.avg_time_to_merge_hours, None);
    assert!((result.after.prs_per_week - 0.5).abs() < 1e-9);
}

#[tokio::test]
async fn test_early_stop_never_requests_older_pages() {
    let a = adapter();
    let window = Window::new(ts("2024-06-01T00:00:00Z"), ts("2024-06-08T00:00:00Z")).unwrap();

    // A full page (so pagination would normally continue) whose tail item
    // predates the window. Only the in-window item gets details scripted;
    // page 2 is deliberately unscripted.
    let in_window = mr(1, "2024-06-02T00:00:00Z", "alice", "opened");
    let mut items = vec![in_window.clone()];
    for i in 0..99u64 {
        items.push(mr(100 + i, "2024-05-01T00:00:00Z", "alice", "opened"));
    }

    let mut transport = ScriptedTransport::new();
    script_page(&mut transport, &a, &window, 1, items);
    script_details(&mut transport, &a, &in_window, json!([]), json!([]));

    let transport = Arc::new(transport);
    let f = fetcher(transport.clone());
    let fetch = f.fetch_window(&a, &window, "before", &NoopProgress).await;

    assert!(!fetch.aborted);
    assert_eq!(fetch.pages_fetched, 1);
    assert_eq!(fetch.records.len(), 1);
    // One page call plus two detail calls
    assert_eq!(transport.calls(), 3);
}

#[tokio::test]
async fn test_cache_makes_rerun_free() {
    let a = adapter();
    let window = Window::new(ts("2024-06-01T00:00:00Z"), ts("2024-06-08T00:00:00Z")).unwrap();

    let item = mr(1, "2024-06-02T00:00:00Z", "alice", "merged");
    let mut transport = ScriptedTransport::new();
    script_page(&mut transport, &a, &window, 1, vec![item.clone()]);
    script_details(&mut transport, &a, &item, json!([]), json!([]));

    let transport = Arc::new(transport);
    let f = fetcher(transport.clone());

    let first = f.fetch_window(&a, &window, "before", &NoopProgress).await;
    let calls_after_first = transport.calls();
    let second = f.fetch_window(&a, &window, "before", &NoopProgress).await;

    assert_eq!(transport.calls(), calls_after_first);
    assert_eq!(first.records, second.records);
}

#[tokio::test]
async fn test_bad_record_is_tallied_not_fatal() {
    let a = adapter();
    let window = Window::new(ts("2024-06-01T00:00:00Z"), ts("2024-06-08T00:00:00Z")).unwrap();

    // Ten MRs in the window, two with unusable detail payloads
    let mut transport = ScriptedTransport::new();
    let mut items = Vec::new();
    for iid in 1..=10u64 {
        let item = mr(iid, "2024-06-03T00:00:00Z", "alice", "merged");
        if iid == 4 || iid == 7 {
            // Notes payload is an object instead of an array:
            // normalization fails
            script_details(&mut transport, &a, &item, json!({}), json!([]));
        } else {
            script_details(&mut transport, &a, &item, json!([]), json!([]));
        }
        items.push(item);
    }
    script_page(&mut transport, &a, &window, 1, items);

    let f = fetcher(Arc::new(transport));
    let fetch = f.fetch_window(&a, &window, "before", &NoopProgress).await;

    assert!(!fetch.aborted);
    assert_eq!(fetch.failed, 2);
    assert_eq!(fetch.records.len(), 8);
    assert!(fetch.records.iter().all(|r| r.number != 4 && r.number != 7));
}

#[tokio::test]
async fn test_detail_pages_beyond_first_are_followed() {
    let a = adapter();
    let window = Window::new(ts("2024-06-01T00:00:00Z"), ts("2024-06-08T00:00:00Z")).unwrap();

    let item = mr(1, "2024-06-02T00:00:00Z", "alice", "opened");
    let mut transport = ScriptedTransport::new();
    script_page(&mut transport, &a, &window, 1, vec![item.clone()]);

    // 100 notes fill the first page; the 50 on the second page include the
    // earliest human comment, which must not be lost
    let requests = a.detail_requests(&item).unwrap();
    let notes_page1 = Value::Array(vec![
        json!({"system": false, "author": {"username": "bob"},
               "created_at": "2024-06-02T03:00:00Z"});
        100
    ]);
    let notes_page2 = Value::Array(vec![
        json!({"system": false, "author": {"username": "carol"},
               "created_at": "2024-06-02T02:00:00Z"});
        50
    ]);
    let page2_req = a.detail_next(&requests[0], &notes_page1).unwrap();
    transport.script(&requests[0], notes_page1);
    transport.script(&page2_req, notes_page2);
    transport.script(&requests[1], json!([]));

    let f = fetcher(Arc::new(transport));
    let fetch = f.fetch_window(&a, &window, "before", &NoopProgress).await;

    assert_eq!(fetch.records.len(), 1);
    let record = &fetch.records[0];
    assert_eq!(record.comment_count, 150);
    assert!(record.commenters.contains("carol"));
    // The earliest comment lives on the second page
    assert_eq!(record.comments[0].author, "carol");
}

#[tokio::test]
async fn test_lost_offset_page_is_skipped() {
    let a = adapter();
    let window = Window::new(ts("2024-06-01T00:00:00Z"), ts("2024-06-08T00:00:00Z")).unwrap();

    // Page 1 is full (pagination continues) but every item is newer than
    // the window, so nothing needs details. Page 2 fails transiently every
    // time; page 3 holds the one in-window item.
    let mut page1 = Vec::new();
    for iid in 0..100u64 {
        page1.push(mr(1000 + iid, "2024-06-20T00:00:00Z", "alice", "opened"));
    }
    let in_window = mr(7, "2024-06-04T00:00:00Z", "bob", "opened");

    let mut transport = ScriptedTransport::new();
    script_page(&mut transport, &a, &window, 1, page1);
    transport.script_transient(&a.page_request(&window, &PageCursor::Offset { page: 2 }));
    script_page(&mut transport, &a, &window, 3, vec![in_window.clone()]);
    script_details(&mut transport, &a, &in_window, json!([]), json!([]));

    let transport = Arc::new(transport);
    let f = fetcher(transport.clone());
    let fetch = f.fetch_window(&a, &window, "after", &NoopProgress).await;

    // The lost page is tallied and pagination continues past it
    assert!(!fetch.aborted);
    assert_eq!(fetch.failed, 1);
    assert_eq!(fetch.pages_fetched, 3);
    assert_eq!(fetch.records.len(), 1);
    assert_eq!(fetch.records[0].number, 7);
    // Pages 1 and 3, four attempts on page 2, two detail calls
    assert_eq!(transport.calls(), 8);
}

#[tokio::test]
async fn test_lost_cursor_page_aborts_with_partial_results() {
    let a = GithubAdapter::new("acme/widgets", None, None).unwrap();
    let window = Window::new(ts("2024-06-01T00:00:00Z"), ts("2024-06-15T00:00:00Z")).unwrap();

    let node = json!({
        "number": 1,
        "createdAt": "2024-06-05T00:00:00Z",
        "state": "OPEN",
        "author": {"login": "alice", "__typename": "User"}
    });
    let page1 = json!({"data": {"repository": {"pullRequests": {
        "pageInfo": {"hasNextPage": true, "endCursor": "c1"},
        "nodes": [node]
    }}}});

    let mut transport = ScriptedTransport::new();
    transport.script(
        &a.page_request(&window, &PageCursor::Cursor { after: None }),
        page1,
    );
    // The continuation token died with this page
    transport.script_transient(&a.page_request(
        &window,
        &PageCursor::Cursor {
            after: Some("c1".into()),
        },
    ));

    let transport = Arc::new(transport);
    let f = fetcher(transport.clone());
    let fetch = f.fetch_window(&a, &window, "before", &NoopProgress).await;

    assert!(fetch.aborted);
    assert_eq!(fetch.failed, 1);
    assert_eq!(fetch.records.len(), 1);
    assert_eq!(transport.calls(), 5);

    // Partial results still aggregate, marked as incomplete
    let summary = summarize(&window, &fetch.records, fetch.failed, !fetch.aborted);
    assert!(!summary.completed);
    assert_eq!(summary.total_prs, 1);
    assert_eq!(summary.failed_records, 1);
    assert!(!summary.is_quiet());
}

#[tokio::test]
async fn test_out_of_window_items_are_skipped_individually() {
    let a = adapter();
    let window = Window::new(ts("2024-06-01T00:00:00Z"), ts("2024-06-08T00:00:00Z")).unwrap();

    // Newest first: a too-new item, then an in-window one
    let too_new = mr(1, "2024-06-10T00:00:00Z", "alice", "opened");
    let in_window = mr(2, "2024-06-05T00:00:00Z", "bob", "opened");

    let mut transport = ScriptedTransport::new();
    script_page(
        &mut transport,
        &a,
        &window,
        1,
        vec![too_new, in_window.clone()],
    );
    script_details(&mut transport, &a, &in_window, json!([]), json!([]));

    let f = fetcher(Arc::new(transport));
    let fetch = f.fetch_window(&a, &window, "after", &NoopProgress).await;

    assert_eq!(fetch.failed, 0);
    assert_eq!(fetch.records.len(), 1);
    assert_eq!(fetch.records[0].number, 2);
}
