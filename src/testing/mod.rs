//! Test doubles for the chain and HTTP seams
//!
//! - `MockConnector` / `MockHandle`: per-endpoint scripted connect outcomes
//! - `MockTransport`: queued HTTP responses with a call counter

pub mod mock_chain;
pub mod mock_http;

pub use mock_chain::{MockConnector, MockEndpoint, MockHandle};
pub use mock_http::MockTransport;

/// Route `log` output to the test harness. Safe to call from every test.
pub fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
