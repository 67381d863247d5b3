//! Scripted chain connector for exercising the connection manager
//!
//! Each endpoint gets a `MockEndpoint` behavior. Unknown endpoints refuse
//! connections. Every `connect` call is recorded in order.

use crate::chain::connector::{ChainConnector, ChainHandle, ConnectionEvent};
use crate::error::DashboardError;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;

/// How a mock endpoint responds to a connect attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockEndpoint {
    /// Connects, becomes ready and passes the probe
    Healthy,
    /// `connect` fails with a transport error
    Refuse,
    /// `connect` never resolves
    Hang,
    /// Connects but the probe reports a missing method
    ProbeFail,
    /// Passes the probe, but the socket closes while the probe is answered
    DropDuringProbe,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
pub struct MockConnector {
    behaviors: Mutex<HashMap<String, MockEndpoint>>,
    attempts: Mutex<Vec<String>>,
    handles: Mutex<Vec<Arc<MockHandle>>>,
    initialize_calls: AtomicU32,
    connect_delay: Mutex<Option<Duration>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_behavior(&self, endpoint: &str, behavior: MockEndpoint) {
        locked(&self.behaviors).insert(endpoint.to_string(), behavior);
    }

    /// Sleep this long inside every `connect` before acting on the behavior
    pub fn set_connect_delay(&self, delay: Duration) {
        *locked(&self.connect_delay) = Some(delay);
    }

    /// Endpoints passed to `connect`, in call order
    pub fn attempts(&self) -> Vec<String> {
        locked(&self.attempts).clone()
    }

    pub fn initialize_calls(&self) -> u32 {
        self.initialize_calls.load(Ordering::SeqCst)
    }

    /// Every handle this connector produced, oldest first
    pub fn handles(&self) -> Vec<Arc<MockHandle>> {
        locked(&self.handles).clone()
    }

    pub fn last_handle(&self) -> Option<Arc<MockHandle>> {
        locked(&self.handles).last().cloned()
    }
}

#[async_trait]
impl ChainConnector for MockConnector {
    async fn initialize(&self) -> Result<(), DashboardError> {
        self.initialize_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn ChainHandle>, DashboardError> {
        locked(&self.attempts).push(endpoint.to_string());
        let behavior = locked(&self.behaviors)
            .get(endpoint)
            .copied()
            .unwrap_or(MockEndpoint::Refuse);
        let delay = *locked(&self.connect_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match behavior {
            MockEndpoint::Refuse => Err(DashboardError::Transport {
                endpoint: endpoint.to_string(),
                message: "connection refused".to_string(),
            }),
            MockEndpoint::Hang => {
                futures::future::pending::<()>().await;
                Err(DashboardError::NotConnected)
            }
            MockEndpoint::Healthy | MockEndpoint::ProbeFail | MockEndpoint::DropDuringProbe => {
                let handle = Arc::new(MockHandle::new(endpoint, behavior));
                locked(&self.handles).push(Arc::clone(&handle));
                Ok(handle)
            }
        }
    }
}

pub struct MockHandle {
    endpoint: String,
    connected: AtomicBool,
    behavior: MockEndpoint,
    events_tx: broadcast::Sender<ConnectionEvent>,
    disconnect_calls: AtomicU32,
}

impl MockHandle {
    fn new(endpoint: &str, behavior: MockEndpoint) -> Self {
        let (events_tx, _) = broadcast::channel(16);
        Self {
            endpoint: endpoint.to_string(),
            connected: AtomicBool::new(true),
            behavior,
            events_tx,
            disconnect_calls: AtomicU32::new(0),
        }
    }

    /// Simulate the remote side closing the socket
    pub fn drop_connection(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.events_tx.send(ConnectionEvent::Disconnected {
                endpoint: self.endpoint.clone(),
            });
        }
    }

    /// Emit a non-fatal transport error
    pub fn emit_error(&self, message: &str) {
        let _ = self.events_tx.send(ConnectionEvent::Error {
            endpoint: self.endpoint.clone(),
            message: message.to_string(),
        });
    }

    pub fn disconnect_calls(&self) -> u32 {
        self.disconnect_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainHandle for MockHandle {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events_tx.subscribe()
    }

    async fn ready(&self) -> Result<(), DashboardError> {
        Ok(())
    }

    async fn probe(&self) -> Result<(), DashboardError> {
        match self.behavior {
            MockEndpoint::ProbeFail => Err(DashboardError::MethodUnavailable {
                endpoint: self.endpoint.clone(),
                method: "state_getRuntimeVersion".to_string(),
            }),
            MockEndpoint::DropDuringProbe => {
                self.drop_connection();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn request(&self, method: &str, _params: Value) -> Result<Value, DashboardError> {
        if !self.is_connected() {
            return Err(DashboardError::NotConnected);
        }
        match method {
            "system_chain" => Ok(json!("Polkadot")),
            _ => Ok(Value::Null),
        }
    }

    async fn disconnect(&self) {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }
}
