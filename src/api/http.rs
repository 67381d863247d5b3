// src/api/http.rs
//! HTTP transport used by the market data clients.

use async_trait::async_trait;
use log::debug;
use reqwest::{header::HeaderMap, Client, StatusCode};
use serde_json::Value;
use std::time::Duration;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Successful response with a JSON body
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Value,
}

/// Failure of a single HTTP call
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("HTTP request failed (status {status:?}): {message}")]
pub struct FetchError {
    /// `None` when the request never got a response
    pub status: Option<u16>,
    /// Parsed `Retry-After` header, when the upstream sent one
    pub retry_after: Option<Duration>,
    pub message: String,
}

impl FetchError {
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            status: None,
            retry_after: None,
            message: message.into(),
        }
    }

    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            retry_after: None,
            message: message.into(),
        }
    }

    pub fn too_many_requests(retry_after: Option<Duration>) -> Self {
        Self {
            status: Some(StatusCode::TOO_MANY_REQUESTS.as_u16()),
            retry_after,
            message: "Too Many Requests".to_string(),
        }
    }

    /// 429 responses are handled like a local limiter trip, never retried
    pub fn is_rate_limited(&self) -> bool {
        self.status == Some(StatusCode::TOO_MANY_REQUESTS.as_u16())
    }
}

/// Minimal transport seam so clients can be tested without a network
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get_json(&self, url: &str, query: &[(String, String)])
        -> Result<HttpResponse, FetchError>;
}

/// `reqwest` backed transport
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, FetchError> {
        Self::with_timeout(DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::network(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get_json(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<HttpResponse, FetchError> {
        debug!("🌐 GET {} {:?}", url, query);
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| FetchError::network(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(FetchError::too_many_requests(parse_retry_after(
                response.headers(),
            )));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(FetchError::status(status.as_u16(), text));
        }

        let body = response
            .json::<Value>()
            .await
            .map_err(|e| FetchError::status(status.as_u16(), format!("Invalid JSON body: {}", e)))?;

        Ok(HttpResponse {
            status: status.as_u16(),
            body,
        })
    }
}

/// Parse a delta-seconds `Retry-After` header. HTTP-date values are ignored.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Deterministic request fingerprint: `METHOD:path[:k=v&k=v]`, params sorted
pub fn fingerprint(method: &str, path: &str, params: &[(&str, &str)]) -> String {
    let mut key = format!("{}:{}", method.to_ascii_uppercase(), path);
    if !params.is_empty() {
        let mut sorted: Vec<_> = params.to_vec();
        sorted.sort();
        let query = sorted
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        key.push(':');
        key.push_str(&query);
    }
    key
}
