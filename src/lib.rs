pub mod api;
pub mod chain;
pub mod config;
pub mod error;
pub mod testing; // Scripted connector / transport doubles
pub mod utils;

// Re-export the two resilience components and their configuration
pub use api::{CachedRateLimitedClient, MarketDataClient, Served, ServedFrom, UpstreamConfig};
pub use chain::{
    ChainConnector, ChainHandle, ConnectionConfig, ConnectionEvent, ConnectionManager,
    ConnectionState, WsRpcConnector,
};
pub use error::DashboardError;
