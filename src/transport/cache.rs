use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::RwLock;

use super::Request;

/// Deterministic cache key for one API call: operation identity plus every
/// request parameter, pagination token included.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct CacheKey {
    op: &'static str,
    url: String,
    query: Vec<(String, String)>,
    body: Option<String>,
}

impl CacheKey {
    pub fn for_request(request: &Request) -> Self {
        let mut query = request.query.clone();
        query.sort();
        Self {
            op: request.op,
            url: request.url.clone(),
            query,
            body: request.body.as_ref().map(|b| b.to_string()),
        }
    }
}

/// In-memory memoization of successful transport calls, scoped to one
/// comparison run. Shared by all in-flight workers; transient failures are
/// never stored.
#[derive(Default)]
pub struct ResponseCache {
    entries: RwLock<HashMap<CacheKey, Value>>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &CacheKey) -> Option<Value> {
        self.entries.read().await.get(key).cloned()
    }

    pub async fn put(&self, key: CacheKey, payload: Value) {
        self.entries.write().await.insert(key, payload);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
