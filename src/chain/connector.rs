// src/chain/connector.rs
//! Narrow interface to the chain RPC library.
//!
//! The connection manager only needs to open a handle, wait for it to be
//! ready, probe that it serves the expected protocol, listen for liveness
//! events and tear it down.

use crate::error::DashboardError;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Liveness events emitted by handles and re-emitted by the manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ConnectionEvent {
    Connected { endpoint: String },
    Disconnected { endpoint: String },
    Error { endpoint: String, message: String },
}

impl ConnectionEvent {
    pub fn endpoint(&self) -> &str {
        match self {
            ConnectionEvent::Connected { endpoint }
            | ConnectionEvent::Disconnected { endpoint }
            | ConnectionEvent::Error { endpoint, .. } => endpoint,
        }
    }
}

/// Lifecycle state of the managed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn is_connecting(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Reconnecting)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(label)
    }
}

/// Opens handles to chain endpoints
#[async_trait]
pub trait ChainConnector: Send + Sync {
    /// One-time library setup (crypto/WASM init). Called once per manager.
    async fn initialize(&self) -> Result<(), DashboardError> {
        Ok(())
    }

    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn ChainHandle>, DashboardError>;
}

/// A live connection to one endpoint
#[async_trait]
pub trait ChainHandle: Send + Sync {
    fn endpoint(&self) -> &str;

    fn is_connected(&self) -> bool;

    /// Subscribe to this handle's liveness events
    fn events(&self) -> broadcast::Receiver<ConnectionEvent>;

    /// Resolves once the handle can serve requests
    async fn ready(&self) -> Result<(), DashboardError>;

    /// Cheap read confirming the endpoint serves the expected protocol
    async fn probe(&self) -> Result<(), DashboardError>;

    async fn request(&self, method: &str, params: Value) -> Result<Value, DashboardError>;

    async fn disconnect(&self);
}
