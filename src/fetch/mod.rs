use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde_json::Value;

use crate::adapter::PlatformAdapter;
use crate::error::{Error, Result};
use crate::model::PrRecord;
use crate::transport::cache::{CacheKey, ResponseCache};
use crate::transport::governor::RateGovernor;
use crate::transport::{CallError, Request, Transport};
use crate::window::Window;

const MAX_RETRIES: u32 = 3;
const BACKOFF_SECONDS: &[u64] = &[60, 120, 240];
/// Maximum concurrent in-flight detail fetches, independent of page size.
const DEFAULT_MAX_IN_FLIGHT: usize = 10;

/// Periodic progress callbacks. Side-effect free from the engine's
/// perspective; every method has a no-op default.
pub trait Progress: Send + Sync {
    fn on_page(&self, _label: &str, _page: u32, _items: usize) {}
    fn on_record(&self, _label: &str, _processed: usize, _total: usize) {}
}

/// Progress reporter that reports nowhere.
pub struct NoopProgress;

impl Progress for NoopProgress {}

/// Everything gathered for one window, partial results included.
///
/// `aborted` marks a window whose pagination could not complete; the
/// records collected before the abort are still present and still count.
#[derive(Debug)]
pub struct WindowFetch {
    pub records: Vec<PrRecord>,
    pub failed: u64,
    pub aborted: bool,
    pub pages_fetched: u32,
}

/// Drives transport, cache, and rate governor across a window's pages.
///
/// Page fetching is sequential (the early-stop predicate needs pages in
/// order); per-record detail fetches run through a bounded pool. The cache
/// and governor are the only shared mutable state.
pub struct Fetcher {
    transport: Arc<dyn Transport>,
    cache: Arc<ResponseCache>,
    governor: Arc<RateGovernor>,
    max_in_flight: usize,
}

impl Fetcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        cache: Arc<ResponseCache>,
        governor: Arc<RateGovernor>,
    ) -> Self {
        Self {
            transport,
            cache,
            governor,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    /// One memoized, governed, retried API call.
    ///
    /// The cache is consulted first; transient failures are retried up to
    /// `MAX_RETRIES` times behind governor-mediated waits; only successful
    /// payloads are cached.
    pub async fn call(&self, request: &Request) -> Result<Value> {
        let key = CacheKey::for_request(request);
        if let Some(hit) = self.cache.get(&key).await {
            log::debug!("Cache hit for {}", request.op);
            return Ok(hit);
        }

        let mut attempt: u32 = 0;
        loop {
            self.governor.before_call().await;
            match self.transport.execute(request).await {
                Ok(response) => {
                    self.governor.record(&response.rate);
                    self.cache.put(key, response.payload.clone()).await;
                    return Ok(response.payload);
                }
                Err(CallError::Transient {
                    reason,
                    retry_after,
                }) => {
                    if attempt >= MAX_RETRIES {
                        return Err(Error::RetriesExhausted(format!(
                            "{reason} (after {MAX_RETRIES} retries)"
                        )));
                    }
                    log::warn!(
                        "{reason}; retry {}/{MAX_RETRIES}",
                        attempt + 1
                    );
                    let fallback = BACKOFF_SECONDS
                        .get(attempt as usize)
                        .copied()
                        .unwrap_or(240);
                    self.governor.hold_for_retry(retry_after, fallback).await;
                    attempt += 1;
                }
                Err(CallError::Fatal(e)) => return Err(e),
            }
        }
    }

    /// Fetch, filter, and normalize every PR created inside `window`.
    ///
    /// Pages are assumed newest-first. An item created before the window
    /// start halts pagination (all further pages are older); an item
    /// created after the window end is skipped individually. Failures
    /// follow the per-record / per-window split: bad items are tallied and
    /// skipped, an unrecoverable page fetch aborts with partial results.
    pub async fn fetch_window(
        &self,
        adapter: &dyn PlatformAdapter,
        window: &Window,
        label: &str,
        progress: &dyn Progress,
    ) -> WindowFetch {
        let mut items: Vec<Value> = Vec::new();
        let mut failed: u64 = 0;
        let mut aborted = false;
        let mut pages_fetched: u32 = 0;
        let mut cursor = Some(adapter.initial_cursor());

        log::info!("{label}: fetching {} PRs for {window}", adapter.label());

        'pages: while let Some(position) = cursor.take() {
            let request = adapter.page_request(window, &position);
            pages_fetched += 1;

            let payload = match self.call(&request).await {
                Ok(payload) => payload,
                Err(Error::RetriesExhausted(msg)) => {
                    failed += 1;
                    match position.skip_failed_page() {
                        Some(next) => {
                            log::warn!("{label}: skipping lost page: {msg}");
                            cursor = Some(next);
                            continue;
                        }
                        None => {
                            log::error!(
                                "{label}: continuation token lost, aborting pagination: {msg}"
                            );
                            aborted = true;
                            break;
                        }
                    }
                }
                Err(e) => {
                    log::error!("{label}: fatal error fetching page: {e}");
                    failed += 1;
                    aborted = true;
                    break;
                }
            };

            let page = match adapter.parse_page(&payload, &position) {
                Ok(page) => page,
                Err(e) => {
                    log::error!("{label}: unparsable page: {e}");
                    failed += 1;
                    aborted = true;
                    break;
                }
            };
            progress.on_page(label, pages_fetched, page.items.len());

            for item in page.items {
                let created = match adapter.item_created_at(&item) {
                    Ok(created) => created,
                    Err(e) => {
                        log::warn!("{label}: item without creation time: {e}");
                        failed += 1;
                        continue;
                    }
                };
                if created < window.start {
                    // Descending creation order: every remaining item and
                    // page is older than the window.
                    break 'pages;
                }
                if created > window.end {
                    continue;
                }
                if !adapter.item_in_scope(&item) {
                    continue;
                }
                items.push(item);
            }

            cursor = page.next;
        }

        let total = items.len();
        log::info!("{label}: {total} PRs in window across {pages_fetched} page(s)");

        // Detail fetch + normalization through a bounded pool. `buffered`
        // keeps API item order in the output.
        let mut records: Vec<PrRecord> = Vec::with_capacity(total);
        let mut hydrated = stream::iter(
            items
                .into_iter()
                .map(|item| self.hydrate(adapter, item)),
        )
        .buffered(self.max_in_flight);

        let mut processed = 0usize;
        while let Some(result) = hydrated.next().await {
            processed += 1;
            match result {
                Ok(record) => records.push(record),
                Err(e) => {
                    log::warn!("{label}: record dropped: {e}");
                    failed += 1;
                }
            }
            progress.on_record(label, processed, total);
        }

        WindowFetch {
            records,
            failed,
            aborted,
            pages_fetched,
        }
    }

    /// Fetch a record's detail payloads, following detail pagination, then
    /// normalize. Each entry of `detail_requests` accumulates all of its
    /// pages into one payload before normalization sees it.
    async fn hydrate(&self, adapter: &dyn PlatformAdapter, item: Value) -> Result<PrRecord> {
        let requests = adapter.detail_requests(&item)?;
        let mut details = Vec::with_capacity(requests.len());
        for request in requests {
            let first = self.call(&request).await?;
            let mut next = adapter.detail_next(&request, &first);
            let mut acc = first;
            while let Some(request) = next {
                let page = self.call(&request).await?;
                next = adapter.detail_next(&request, &page);
                adapter.append_detail_page(&mut acc, page);
            }
            details.push(acc);
        }
        adapter.normalize(&item, &details)
    }
}
