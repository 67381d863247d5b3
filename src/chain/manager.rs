// src/chain/manager.rs
//! Resilient chain connection manager.
//!
//! Owns a single logical connection to one of several RPC endpoints:
//! - endpoint failover in strict round-robin order
//! - bounded attempts with a configurable delay between them
//! - handshake raced against a timeout
//! - automatic reconnect when the live handle reports a disconnect
//! - liveness events and state changes broadcast to dependents
//!
//! Every connect sequence runs while holding `sequence`, so at most one is in
//! flight; concurrent callers wait on the mutex and then get the same handle.
//! `disconnect()` fires the sequence's cancel token before taking the lock,
//! so it never waits out a running retry loop.

use crate::api::backoff::BackoffStrategy;
use crate::chain::connector::{ChainConnector, ChainHandle, ConnectionEvent, ConnectionState};
use crate::error::DashboardError;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, OnceCell};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Connection manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Candidate endpoints, the first one is preferred
    pub endpoints: Vec<String>,
    /// Total attempts across all endpoints before giving up
    pub max_attempts: u32,
    /// Delay between failed attempts
    pub reconnect_backoff: BackoffStrategy,
    pub handshake_timeout: Duration,
}

impl ConnectionConfig {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self {
            endpoints,
            ..Self::default()
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![
                "wss://rpc.polkadot.io".to_string(),
                "wss://polkadot-rpc.dwellir.com".to_string(),
                "wss://polkadot.api.onfinality.io/public-ws".to_string(),
            ],
            max_attempts: 5,
            reconnect_backoff: BackoffStrategy::fixed(Duration::from_secs(2)),
            handshake_timeout: Duration::from_secs(60),
        }
    }
}

/// Owned by whoever holds the sequence lock
struct SequenceState {
    watcher: Option<JoinHandle<()>>,
    /// Bumped on every successful connect so stale watchers can be told apart
    generation: u64,
}

struct Shared {
    config: ConnectionConfig,
    connector: Arc<dyn ChainConnector>,
    sequence: Mutex<SequenceState>,
    /// Fired by `disconnect()` and swapped for a fresh token
    cancel: RwLock<CancellationToken>,
    active_handle: RwLock<Option<Arc<dyn ChainHandle>>>,
    current_endpoint_index: AtomicUsize,
    attempt_count: AtomicU32,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<ConnectionEvent>,
    initialized: OnceCell<()>,
}

/// Single logical chain connection with failover and reconnect
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        connector: Arc<dyn ChainConnector>,
    ) -> Result<Self, DashboardError> {
        if config.endpoints.is_empty() {
            return Err(DashboardError::Config(
                "At least one RPC endpoint is required".to_string(),
            ));
        }
        if config.max_attempts == 0 {
            return Err(DashboardError::Config(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        info!(
            "🔗 Connection manager with {} endpoint(s), max {} attempts",
            config.endpoints.len(),
            config.max_attempts
        );

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                connector,
                sequence: Mutex::new(SequenceState {
                    watcher: None,
                    generation: 0,
                }),
                cancel: RwLock::new(CancellationToken::new()),
                active_handle: RwLock::new(None),
                current_endpoint_index: AtomicUsize::new(0),
                attempt_count: AtomicU32::new(0),
                state_tx,
                events_tx,
                initialized: OnceCell::new(),
            }),
        })
    }

    /// Return the live handle, connecting first if needed
    pub async fn connect(&self) -> Result<Arc<dyn ChainHandle>, DashboardError> {
        let mut sequence = self.shared.sequence.lock().await;
        if let Some(handle) = self.live_handle() {
            return Ok(handle);
        }
        self.run_connect_sequence(&mut sequence).await
    }

    /// Current handle if connected, otherwise `connect()`
    pub async fn get_handle(&self) -> Result<Arc<dyn ChainHandle>, DashboardError> {
        self.connect().await
    }

    /// Tear down the connection and reset counters. Safe to call repeatedly.
    ///
    /// An in-flight connect or background reconnect is interrupted and its
    /// caller gets `DashboardError::Cancelled`.
    pub async fn disconnect(&self) {
        let interrupted = {
            let mut cancel = self
                .shared
                .cancel
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *cancel, CancellationToken::new())
        };
        interrupted.cancel();

        let mut sequence = self.shared.sequence.lock().await;
        let endpoint = self
            .active()
            .map(|handle| handle.endpoint().to_string());

        self.cleanup(&mut sequence).await;
        self.shared.attempt_count.store(0, Ordering::SeqCst);
        self.set_state(ConnectionState::Disconnected);

        if let Some(endpoint) = endpoint {
            info!("🛑 Disconnected from {}", endpoint);
            self.emit(ConnectionEvent::Disconnected { endpoint });
        }
    }

    /// Live handle without triggering a connect
    pub async fn current_handle(&self) -> Option<Arc<dyn ChainHandle>> {
        self.live_handle()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events_tx.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    pub fn is_connecting(&self) -> bool {
        self.state().is_connecting()
    }

    pub fn endpoints(&self) -> &[String] {
        &self.shared.config.endpoints
    }

    pub async fn attempt_count(&self) -> u32 {
        self.shared.attempt_count.load(Ordering::SeqCst)
    }

    /// Endpoint the next attempt (or the live handle) uses
    pub async fn current_endpoint(&self) -> String {
        let index = self.shared.current_endpoint_index.load(Ordering::SeqCst);
        self.shared.config.endpoints[index].clone()
    }

    fn active(&self) -> Option<Arc<dyn ChainHandle>> {
        self.shared
            .active_handle
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_active(&self, handle: Option<Arc<dyn ChainHandle>>) -> Option<Arc<dyn ChainHandle>> {
        let mut active = self
            .shared
            .active_handle
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *active, handle)
    }

    fn cancel_token(&self) -> CancellationToken {
        self.shared
            .cancel
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn live_handle(&self) -> Option<Arc<dyn ChainHandle>> {
        match self.active() {
            Some(handle) if handle.is_connected() && self.state() == ConnectionState::Connected => {
                Some(handle)
            }
            _ => None,
        }
    }

    async fn run_connect_sequence(
        &self,
        sequence: &mut SequenceState,
    ) -> Result<Arc<dyn ChainHandle>, DashboardError> {
        let shared = &self.shared;
        let max_attempts = shared.config.max_attempts;
        let cancel = self.cancel_token();
        let reconnecting =
            self.active().is_some() || self.state() == ConnectionState::Reconnecting;
        self.set_state(if reconnecting {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        });

        self.cleanup(sequence).await;
        if shared.attempt_count.load(Ordering::SeqCst) >= max_attempts {
            // Previous sequence was exhausted; an explicit call starts a new budget
            shared.attempt_count.store(0, Ordering::SeqCst);
        }

        let connector = Arc::clone(&shared.connector);
        if let Err(err) = shared
            .initialized
            .get_or_try_init(|| async move { connector.initialize().await })
            .await
        {
            error!("❌ Chain library initialization failed: {}", err);
            self.set_state(ConnectionState::Disconnected);
            return Err(DashboardError::ConnectionFailed {
                endpoints_tried: Vec::new(),
                last_error: err.to_string(),
            });
        }

        let endpoint_count = shared.config.endpoints.len();
        let mut endpoints_tried = Vec::new();
        let mut last_error: Option<DashboardError> = None;

        while shared.attempt_count.load(Ordering::SeqCst) < max_attempts {
            let attempt_number = shared.attempt_count.load(Ordering::SeqCst) + 1;
            let index = shared.current_endpoint_index.load(Ordering::SeqCst);
            let endpoint = shared.config.endpoints[index].clone();
            info!(
                "🔌 Connecting to {} (attempt {}/{})",
                endpoint, attempt_number, max_attempts
            );
            endpoints_tried.push(endpoint.clone());

            match self.attempt(&endpoint, &cancel).await {
                Ok((handle, events)) => {
                    shared.attempt_count.store(0, Ordering::SeqCst);
                    sequence.generation += 1;
                    sequence.watcher = Some(self.spawn_watcher(events, sequence.generation));
                    self.set_active(Some(Arc::clone(&handle)));
                    self.set_state(ConnectionState::Connected);
                    info!("✅ Connected to {}", endpoint);
                    self.emit(ConnectionEvent::Connected { endpoint });
                    return Ok(handle);
                }
                Err(DashboardError::Cancelled) => return Err(self.interrupted(&endpoint)),
                Err(err) => {
                    warn!(
                        "⚠️ Attempt {}/{} on {} failed [{}]: {}",
                        attempt_number,
                        max_attempts,
                        endpoint,
                        err.category(),
                        err
                    );
                    self.emit(ConnectionEvent::Error {
                        endpoint: endpoint.clone(),
                        message: err.to_string(),
                    });
                    self.cleanup(sequence).await;
                    shared
                        .current_endpoint_index
                        .store((index + 1) % endpoint_count, Ordering::SeqCst);
                    shared.attempt_count.store(attempt_number, Ordering::SeqCst);
                    last_error = Some(err);

                    if attempt_number < max_attempts {
                        let delay = shared.config.reconnect_backoff.delay_for(attempt_number - 1);
                        debug!("⏳ Next attempt in {:?}", delay);
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(self.interrupted(&endpoint)),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
        let last_error = last_error
            .map(|err| err.to_string())
            .unwrap_or_else(|| "no attempts made".to_string());
        error!(
            "❌ Failed to connect to any endpoint after {} attempts: {}",
            max_attempts, last_error
        );
        Err(DashboardError::ConnectionFailed {
            endpoints_tried,
            last_error,
        })
    }

    fn interrupted(&self, endpoint: &str) -> DashboardError {
        info!("🛑 Connect sequence on {} interrupted by disconnect", endpoint);
        self.set_state(ConnectionState::Disconnected);
        DashboardError::Cancelled
    }

    /// One handshake: open, wait ready, probe. Raced against the timeout
    /// and the cancel token.
    ///
    /// The event receiver is taken right after open so nothing the handle
    /// emits during the handshake is missed by the watcher.
    async fn attempt(
        &self,
        endpoint: &str,
        cancel: &CancellationToken,
    ) -> Result<(Arc<dyn ChainHandle>, broadcast::Receiver<ConnectionEvent>), DashboardError> {
        let timeout = self.shared.config.handshake_timeout;
        // Holds the handle while the handshake runs so an abandoned attempt can still close it
        let opened: std::sync::Mutex<Option<Arc<dyn ChainHandle>>> = std::sync::Mutex::new(None);

        let handshake = async {
            let handle = self.shared.connector.connect(endpoint).await?;
            let events = handle.events();
            if let Ok(mut slot) = opened.lock() {
                *slot = Some(Arc::clone(&handle));
            }
            let checked = async {
                handle.ready().await?;
                handle.probe().await
            }
            .await;
            match checked {
                Ok(()) => Ok::<_, DashboardError>((handle, events)),
                Err(err) => {
                    handle.disconnect().await;
                    Err(err)
                }
            }
        };

        let abandoned = tokio::select! {
            result = tokio::time::timeout(timeout, handshake) => match result {
                Ok(result) => return result,
                Err(_) => DashboardError::HandshakeTimeout {
                    endpoint: endpoint.to_string(),
                    timeout_secs: timeout.as_secs(),
                },
            },
            _ = cancel.cancelled() => DashboardError::Cancelled,
        };

        let handle = opened.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            handle.disconnect().await;
        }
        Err(abandoned)
    }

    async fn cleanup(&self, sequence: &mut SequenceState) {
        if let Some(watcher) = sequence.watcher.take() {
            watcher.abort();
        }
        if let Some(handle) = self.set_active(None) {
            debug!("🧹 Closing handle to {}", handle.endpoint());
            handle.disconnect().await;
        }
    }

    fn spawn_watcher(
        &self,
        events: broadcast::Receiver<ConnectionEvent>,
        generation: u64,
    ) -> JoinHandle<()> {
        let shared = Arc::downgrade(&self.shared);
        tokio::spawn(watch_handle_events(shared, events, generation))
    }

    fn on_transport_disconnected(&self, endpoint: String, generation: u64) {
        warn!("📴 Lost connection to {}, reconnecting", endpoint);
        self.emit(ConnectionEvent::Disconnected {
            endpoint: endpoint.clone(),
        });

        let manager = self.clone();
        tokio::spawn(async move {
            match manager.reconnect_after_loss(generation).await {
                Ok(Some(handle)) => info!("✅ Reconnected to {}", handle.endpoint()),
                Ok(None) => debug!("Reconnect for {} no longer needed", endpoint),
                Err(DashboardError::Cancelled) => {
                    debug!("Reconnect to {} stopped by disconnect", endpoint)
                }
                Err(err) => {
                    error!("❌ Reconnect after losing {} failed: {}", endpoint, err);
                    manager.emit(ConnectionEvent::Error {
                        endpoint,
                        message: err.to_string(),
                    });
                }
            }
        });
    }

    /// Reconnect unless the lost handle was already replaced or torn down
    async fn reconnect_after_loss(
        &self,
        generation: u64,
    ) -> Result<Option<Arc<dyn ChainHandle>>, DashboardError> {
        let mut sequence = self.shared.sequence.lock().await;
        if sequence.generation != generation || self.active().is_none() {
            return Ok(None);
        }
        self.set_state(ConnectionState::Reconnecting);
        self.run_connect_sequence(&mut sequence).await.map(Some)
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.shared.state_tx.send_replace(next);
        if previous != next {
            debug!("🔁 Connection state {} -> {}", previous, next);
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine
        let _ = self.shared.events_tx.send(event);
    }
}

async fn watch_handle_events(
    shared: Weak<Shared>,
    mut events: broadcast::Receiver<ConnectionEvent>,
    generation: u64,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Connection event watcher lagged by {} events", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let Some(strong) = shared.upgrade() else {
            break;
        };
        let manager = ConnectionManager { shared: strong };

        match event {
            ConnectionEvent::Disconnected { endpoint } => {
                manager.on_transport_disconnected(endpoint, generation);
                break;
            }
            other => manager.emit(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockConnector, MockEndpoint};

    fn fast_config(endpoints: &[&str]) -> ConnectionConfig {
        ConnectionConfig {
            endpoints: endpoints.iter().map(|e| e.to_string()).collect(),
            max_attempts: 5,
            reconnect_backoff: BackoffStrategy::fixed(Duration::from_secs(2)),
            handshake_timeout: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_rejects_empty_endpoint_list() {
        let connector = Arc::new(MockConnector::new());
        let result = ConnectionManager::new(fast_config(&[]), connector);
        assert!(matches!(result, Err(DashboardError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_is_idempotent() {
        let connector = Arc::new(MockConnector::new());
        connector.set_behavior("wss://a", MockEndpoint::Healthy);
        let manager = ConnectionManager::new(fast_config(&["wss://a"]), connector.clone()).unwrap();

        let first = manager.connect().await.unwrap();
        let second = manager.connect().await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(connector.attempts(), vec!["wss://a".to_string()]);
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_runs_once() {
        let connector = Arc::new(MockConnector::new());
        connector.set_behavior("wss://a", MockEndpoint::Healthy);
        let manager = ConnectionManager::new(fast_config(&["wss://a"]), connector.clone()).unwrap();

        manager.connect().await.unwrap();
        manager.disconnect().await;
        manager.connect().await.unwrap();

        assert_eq!(connector.initialize_calls(), 1);
        assert_eq!(connector.attempts().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_is_safe_when_idle() {
        let connector = Arc::new(MockConnector::new());
        let manager = ConnectionManager::new(fast_config(&["wss://a"]), connector).unwrap();

        manager.disconnect().await;
        manager.disconnect().await;

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.attempt_count().await, 0);
        assert!(manager.current_handle().await.is_none());
    }
}
