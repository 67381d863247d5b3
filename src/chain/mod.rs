// src/chain/mod.rs
//! Chain connectivity
//!
//! - `connector`: the narrow seam to the chain RPC library
//! - `ws`: JSON-RPC over WebSocket implementation of that seam
//! - `manager`: failover, reconnect and connection state on top of it

pub mod connector;
pub mod manager;
pub mod ws;

pub use connector::{ChainConnector, ChainHandle, ConnectionEvent, ConnectionState};
pub use manager::{ConnectionConfig, ConnectionManager};
pub use ws::{WsRpcConnector, WsRpcHandle, DEFAULT_REQUIRED_METHODS};
