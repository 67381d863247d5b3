// src/error/mod.rs
//! Crate-wide error type.
//!
//! Retryable variants (transport failures, handshake timeouts, probe
//! failures) are handled inside the connection manager and the cached
//! client; only terminal variants are expected to reach callers.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DashboardError {
    /// Every endpoint/attempt was exhausted
    #[error("Failed to connect to any endpoint (tried: {endpoints_tried:?}): {last_error}")]
    ConnectionFailed {
        endpoints_tried: Vec<String>,
        last_error: String,
    },

    /// Handshake did not complete before the deadline
    #[error("Handshake with {endpoint} timed out after {timeout_secs}s")]
    HandshakeTimeout { endpoint: String, timeout_secs: u64 },

    /// Socket or handshake level failure
    #[error("Transport Error ({endpoint}): {message}")]
    Transport { endpoint: String, message: String },

    /// Endpoint accepted the socket but does not serve a required method
    #[error("Endpoint {endpoint} does not expose required method {method}")]
    MethodUnavailable { endpoint: String, method: String },

    /// JSON-RPC error object returned by the node
    #[error("RPC Error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// No cache fallback available while the rate limit is tripped
    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimitExceeded { retry_after_secs: u64 },

    /// Upstream HTTP failure after retries
    #[error("Upstream Error (status {status:?}): {message}")]
    Upstream { status: Option<u16>, message: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Not connected")]
    NotConnected,

    #[error("Parse Error: {0}")]
    Parse(String),

    #[error("Config Error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for DashboardError {
    fn from(err: serde_json::Error) -> Self {
        DashboardError::Parse(format!("JSON serialization/deserialization error: {}", err))
    }
}

impl From<url::ParseError> for DashboardError {
    fn from(err: url::ParseError) -> Self {
        DashboardError::Config(format!("Invalid URL: {}", err))
    }
}

impl DashboardError {
    /// Determines if an error is recoverable through retry
    pub fn is_recoverable(&self) -> bool {
        match self {
            DashboardError::ConnectionFailed { .. } => false, // budget exhausted, caller decides
            DashboardError::HandshakeTimeout { .. } => true,
            DashboardError::Transport { .. } => true,
            DashboardError::MethodUnavailable { .. } => true, // try another endpoint
            DashboardError::Rpc { .. } => true, // usually a bad/incompatible node
            DashboardError::RateLimitExceeded { .. } => true, // after retry_after
            DashboardError::Upstream { .. } => true, // 429s surface as RateLimitExceeded
            DashboardError::Cancelled => false,
            DashboardError::NotConnected => true,
            DashboardError::Parse(_) => false,
            DashboardError::Config(_) => false,
        }
    }

    /// Seconds the caller should wait before retrying, when known
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            DashboardError::RateLimitExceeded { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// Short category name used in log lines
    pub fn category(&self) -> &'static str {
        match self {
            DashboardError::ConnectionFailed { .. } => "connection",
            DashboardError::HandshakeTimeout { .. } => "timeout",
            DashboardError::Transport { .. } => "transport",
            DashboardError::MethodUnavailable { .. } => "probe",
            DashboardError::Rpc { .. } => "rpc",
            DashboardError::RateLimitExceeded { .. } => "rate_limit",
            DashboardError::Upstream { .. } => "upstream",
            DashboardError::Cancelled => "cancelled",
            DashboardError::NotConnected => "not_connected",
            DashboardError::Parse(_) => "parse",
            DashboardError::Config(_) => "config",
        }
    }
}
