// src/chain/ws.rs
//! JSON-RPC over WebSocket chain connector.
//!
//! Each handle owns two tasks:
//! - a writer forwarding queued frames to the socket sink
//! - a reader routing responses to pending requests by id
//!
//! When the socket closes on its own the handle flips to disconnected and
//! emits `ConnectionEvent::Disconnected`, which is what the manager watches
//! to trigger a reconnect.

use crate::chain::connector::{ChainConnector, ChainHandle, ConnectionEvent};
use crate::error::DashboardError;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Methods a node must expose for the dashboard to work
pub const DEFAULT_REQUIRED_METHODS: &[&str] =
    &["chain_getHeader", "state_getRuntimeVersion", "system_chain"];

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const OUTGOING_BUFFER: usize = 256;
const EVENT_BUFFER: usize = 64;

type PendingRequests = DashMap<u64, oneshot::Sender<Result<Value, DashboardError>>>;

/// Opens `WsRpcHandle`s
#[derive(Debug, Clone)]
pub struct WsRpcConnector {
    required_methods: Vec<String>,
    request_timeout: Duration,
}

impl WsRpcConnector {
    pub fn new(required_methods: Vec<String>) -> Self {
        Self {
            required_methods,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn required_methods(&self) -> &[String] {
        &self.required_methods
    }
}

impl Default for WsRpcConnector {
    fn default() -> Self {
        Self::new(
            DEFAULT_REQUIRED_METHODS
                .iter()
                .map(|m| m.to_string())
                .collect(),
        )
    }
}

#[async_trait]
impl ChainConnector for WsRpcConnector {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn ChainHandle>, DashboardError> {
        let handle = WsRpcHandle::open(
            endpoint,
            self.required_methods.clone(),
            self.request_timeout,
        )
        .await?;
        Ok(Arc::new(handle))
    }
}

/// Live WebSocket JSON-RPC connection
pub struct WsRpcHandle {
    endpoint: String,
    outgoing: mpsc::Sender<Message>,
    pending: Arc<PendingRequests>,
    next_id: AtomicU64,
    connected: Arc<AtomicBool>,
    events_tx: broadcast::Sender<ConnectionEvent>,
    required_methods: Vec<String>,
    request_timeout: Duration,
    tasks: Vec<JoinHandle<()>>,
}

impl WsRpcHandle {
    pub async fn open(
        endpoint: &str,
        required_methods: Vec<String>,
        request_timeout: Duration,
    ) -> Result<Self, DashboardError> {
        info!("🌐 Opening WebSocket to {}", endpoint);
        let (stream, _) = connect_async(endpoint)
            .await
            .map_err(|e| DashboardError::Transport {
                endpoint: endpoint.to_string(),
                message: format!("Failed to connect: {}", e),
            })?;

        let (mut write, mut read) = stream.split();
        let (outgoing, mut outgoing_rx) = mpsc::channel::<Message>(OUTGOING_BUFFER);
        let (events_tx, _) = broadcast::channel(EVENT_BUFFER);
        let pending: Arc<PendingRequests> = Arc::new(DashMap::new());
        let connected = Arc::new(AtomicBool::new(true));

        let writer_endpoint = endpoint.to_string();
        let writer = tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = write.send(message).await {
                    error!("❌ WebSocket write to {} failed: {}", writer_endpoint, e);
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let reader_endpoint = endpoint.to_string();
        let reader_pending = Arc::clone(&pending);
        let reader_connected = Arc::clone(&connected);
        let reader_events = events_tx.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => route_response(&reader_pending, &text),
                    Ok(Message::Close(_)) => {
                        debug!("WebSocket {} sent close frame", reader_endpoint);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("⚠️ WebSocket read from {} failed: {}", reader_endpoint, e);
                        let _ = reader_events.send(ConnectionEvent::Error {
                            endpoint: reader_endpoint.clone(),
                            message: e.to_string(),
                        });
                        break;
                    }
                }
            }

            // Dropping the senders fails every in-flight request
            reader_pending.clear();
            if reader_connected.swap(false, Ordering::SeqCst) {
                info!("🔚 WebSocket {} closed", reader_endpoint);
                let _ = reader_events.send(ConnectionEvent::Disconnected {
                    endpoint: reader_endpoint,
                });
            }
        });

        Ok(Self {
            endpoint: endpoint.to_string(),
            outgoing,
            pending,
            next_id: AtomicU64::new(1),
            connected,
            events_tx,
            required_methods,
            request_timeout,
            tasks: vec![writer, reader],
        })
    }

    fn transport_error(&self, message: impl Into<String>) -> DashboardError {
        DashboardError::Transport {
            endpoint: self.endpoint.clone(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl ChainHandle for WsRpcHandle {
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
        // The socket handshake already completed inside `open`
        if self.is_connected() {
            Ok(())
        } else {
            Err(DashboardError::NotConnected)
        }
    }

    async fn probe(&self) -> Result<(), DashboardError> {
        let listing = self.request("rpc_methods", json!([])).await?;
        let available: Vec<&str> = listing
            .get("methods")
            .and_then(Value::as_array)
            .ok_or_else(|| DashboardError::Parse("rpc_methods returned no method list".to_string()))?
            .iter()
            .filter_map(Value::as_str)
            .collect();

        if let Some(missing) = self
            .required_methods
            .iter()
            .find(|method| !available.contains(&method.as_str()))
        {
            return Err(DashboardError::MethodUnavailable {
                endpoint: self.endpoint.clone(),
                method: missing.clone(),
            });
        }

        let chain = self.request("system_chain", json!([])).await?;
        debug!("🔍 {} serves chain {}", self.endpoint, chain);
        Ok(())
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, DashboardError> {
        if !self.is_connected() {
            return Err(DashboardError::NotConnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        if self
            .outgoing
            .send(Message::Text(payload.to_string()))
            .await
            .is_err()
        {
            self.pending.remove(&id);
            return Err(self.transport_error("WebSocket writer is closed"));
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.transport_error(format!(
                "Connection closed before {} responded",
                method
            ))),
            Err(_) => {
                self.pending.remove(&id);
                Err(self.transport_error(format!(
                    "{} timed out after {:?}",
                    method, self.request_timeout
                )))
            }
        }
    }

    async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            debug!("Closing WebSocket {}", self.endpoint);
            let _ = self.outgoing.try_send(Message::Close(None));
        }
        // Writer exits on its own after flushing the close frame
        if let Some(reader) = self.tasks.last() {
            reader.abort();
        }
        self.pending.clear();
    }
}

impl Drop for WsRpcHandle {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Deliver one JSON-RPC response to whoever is waiting on its id
fn route_response(pending: &PendingRequests, text: &str) {
    let message: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            debug!("Ignoring non-JSON WebSocket frame: {}", e);
            return;
        }
    };

    let Some(id) = message.get("id").and_then(Value::as_u64) else {
        // Subscription notifications carry no id
        return;
    };
    let Some((_, waiter)) = pending.remove(&id) else {
        debug!("Response for unknown request id {}", id);
        return;
    };

    let outcome = match message.get("error") {
        Some(err) => Err(DashboardError::Rpc {
            code: err.get("code").and_then(Value::as_i64).unwrap_or_default(),
            message: err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown RPC error")
                .to_string(),
        }),
        None => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
    };
    let _ = waiter.send(outcome);
}
