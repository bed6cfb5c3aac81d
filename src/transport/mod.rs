pub mod cache;
pub mod governor;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde_json::Value;

use crate::error::Error;

/// A fully-specified API request: operation name, target URL, query
/// parameters, and an optional JSON body (GraphQL). The operation name
/// participates in cache keying alongside the parameters.
#[derive(Debug, Clone)]
pub struct Request {
    pub op: &'static str,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl Request {
    pub fn get(op: &'static str, url: impl Into<String>) -> Self {
        Self {
            op,
            url: url.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn post(op: &'static str, url: impl Into<String>, body: Value) -> Self {
        Self {
            op,
            url: url.into(),
            query: Vec::new(),
            body: Some(body),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }
}

/// Rate-limit metadata read from response headers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RateInfo {
    pub remaining: Option<u32>,
    pub reset_epoch: Option<u64>,
}

/// A successful, parsed API response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub payload: Value,
    pub rate: RateInfo,
}

/// Classified failure of one transport call.
///
/// Transient failures are retried by the fetch layer; fatal failures
/// surface immediately.
#[derive(Debug)]
pub enum CallError {
    Transient {
        reason: String,
        retry_after: Option<u64>,
    },
    Fatal(Error),
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallError::Transient { reason, .. } => write!(f, "transient: {reason}"),
            CallError::Fatal(e) => write!(f, "fatal: {e}"),
        }
    }
}

/// One authenticated network call. Implemented over HTTP for production
/// and scripted in-memory for tests.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: &Request) -> Result<ApiResponse, CallError>;
}

/// HTTP transport over a shared `reqwest::Client`.
///
/// Credential headers are constructed by the caller and passed in whole;
/// this type never inspects them.
pub struct HttpTransport {
    client: reqwest::Client,
    headers: HeaderMap,
    basic_auth: Option<(String, String)>,
}

impl HttpTransport {
    pub fn new(headers: HeaderMap) -> Self {
        Self {
            client: reqwest::Client::new(),
            headers,
            basic_auth: None,
        }
    }

    /// HTTP basic credentials, for platforms that authenticate that way
    /// (Bitbucket app passwords, Azure DevOps PATs).
    pub fn with_basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.basic_auth = Some((username.into(), password.into()));
        self
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, request: &Request) -> Result<ApiResponse, CallError> {
        let mut builder = match &request.body {
            Some(body) => self.client.post(&request.url).json(body),
            None => self.client.get(&request.url),
        };
        if let Some((user, pass)) = &self.basic_auth {
            builder = builder.basic_auth(user, Some(pass));
        }
        let response = builder
            .headers(self.headers.clone())
            .query(&request.query)
            .send()
            .await
            .map_err(|e| CallError::Transient {
                reason: format!("{} request failed: {e}", request.op),
                retry_after: None,
            })?;

        let status = response.status();
        let rate = read_rate_info(response.headers());
        let retry_after = header_u64(response.headers(), "Retry-After");

        match classify_status(status, rate) {
            StatusClass::Ok => {
                let payload: Value = response.json().await.map_err(|e| {
                    CallError::Fatal(Error::MalformedResponse(format!(
                        "{}: body is not valid JSON: {e}",
                        request.op
                    )))
                })?;
                Ok(ApiResponse { payload, rate })
            }
            StatusClass::RateLimited => Err(CallError::Transient {
                reason: format!("{}: rate limited ({status})", request.op),
                retry_after,
            }),
            StatusClass::ServerError => Err(CallError::Transient {
                reason: format!("{}: server error {status}", request.op),
                retry_after: None,
            }),
            StatusClass::Unauthorized => Err(CallError::Fatal(Error::Unauthorized(format!(
                "{}: {status}",
                request.op
            )))),
            StatusClass::NotFound => Err(CallError::Fatal(Error::NotFound(format!(
                "{}: {}",
                request.op, request.url
            )))),
            StatusClass::BadRequest => Err(CallError::Fatal(Error::Transport(format!(
                "{}: request rejected with {status}",
                request.op
            )))),
        }
    }
}

enum StatusClass {
    Ok,
    RateLimited,
    ServerError,
    Unauthorized,
    NotFound,
    BadRequest,
}

fn classify_status(status: StatusCode, rate: RateInfo) -> StatusClass {
    match status {
        s if s.is_success() => StatusClass::Ok,
        StatusCode::TOO_MANY_REQUESTS => StatusClass::RateLimited,
        // GitHub signals secondary rate limits with 403 + zero remaining
        StatusCode::FORBIDDEN if rate.remaining == Some(0) => StatusClass::RateLimited,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StatusClass::Unauthorized,
        StatusCode::NOT_FOUND => StatusClass::NotFound,
        s if s.is_server_error() => StatusClass::ServerError,
        _ => StatusClass::BadRequest,
    }
}

fn read_rate_info(headers: &HeaderMap) -> RateInfo {
    RateInfo {
        remaining: header_u64(headers, "X-RateLimit-Remaining").map(|v| v as u32),
        reset_epoch: header_u64(headers, "X-RateLimit-Reset"),
    }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}
