//! Scripted HTTP transport for exercising the cached clients

use crate::api::http::{FetchError, HttpResponse, HttpTransport};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Replays queued responses, then falls back to a fixed one
#[derive(Default)]
pub struct MockTransport {
    scripted: Mutex<VecDeque<Result<Value, FetchError>>>,
    fallback: Mutex<Option<Result<Value, FetchError>>>,
    requests: Mutex<Vec<(String, Vec<(String, String)>)>>,
    calls: AtomicU32,
    latency: Mutex<Option<Duration>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer with `body` once the script runs out
    pub fn always_ok(body: Value) -> Self {
        let transport = Self::new();
        *locked(&transport.fallback) = Some(Ok(body));
        transport
    }

    pub fn push_ok(&self, body: Value) {
        locked(&self.scripted).push_back(Ok(body));
    }

    pub fn push_err(&self, error: FetchError) {
        locked(&self.scripted).push_back(Err(error));
    }

    pub fn set_fallback(&self, response: Result<Value, FetchError>) {
        *locked(&self.fallback) = Some(response);
    }

    pub fn set_latency(&self, latency: Duration) {
        *locked(&self.latency) = Some(latency);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// `(url, query)` of every call, in order
    pub fn requests(&self) -> Vec<(String, Vec<(String, String)>)> {
        locked(&self.requests).clone()
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn get_json(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<HttpResponse, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        locked(&self.requests).push((url.to_string(), query.to_vec()));

        let latency = *locked(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let next = locked(&self.scripted).pop_front();
        let response = match next {
            Some(response) => response,
            None => locked(&self.fallback)
                .clone()
                .unwrap_or_else(|| Err(FetchError::network("no scripted response"))),
        };

        response.map(|body| HttpResponse { status: 200, body })
    }
}
