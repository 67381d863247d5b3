use std::sync::Arc;
use std::time::Duration;

use polka_dashboard_core::api::BackoffStrategy;
use polka_dashboard_core::chain::{
    ChainHandle, ConnectionConfig, ConnectionEvent, ConnectionManager, ConnectionState,
};
use polka_dashboard_core::error::DashboardError;
use polka_dashboard_core::testing::{init_test_logging, MockConnector, MockEndpoint};
use pretty_assertions::assert_eq;
use tokio::sync::broadcast;
use tokio::time::Instant;

const A: &str = "wss://a.example";
const B: &str = "wss://b.example";
const C: &str = "wss://c.example";

fn config(endpoints: &[&str], max_attempts: u32) -> ConnectionConfig {
    ConnectionConfig {
        endpoints: endpoints.iter().map(|e| e.to_string()).collect(),
        max_attempts,
        reconnect_backoff: BackoffStrategy::fixed(Duration::from_secs(2)),
        handshake_timeout: Duration::from_secs(60),
    }
}

fn manager_with(endpoints: &[&str], max_attempts: u32) -> (ConnectionManager, Arc<MockConnector>) {
    init_test_logging();
    let connector = Arc::new(MockConnector::new());
    let manager = ConnectionManager::new(config(endpoints, max_attempts), connector.clone())
        .expect("valid config");
    (manager, connector)
}

fn expect_failure(
    result: Result<Arc<dyn ChainHandle>, DashboardError>,
) -> (Vec<String>, String) {
    match result {
        Err(DashboardError::ConnectionFailed {
            endpoints_tried,
            last_error,
        }) => (endpoints_tried, last_error),
        Err(other) => panic!("expected ConnectionFailed, got {:?}", other),
        Ok(handle) => panic!("expected failure, connected to {}", handle.endpoint()),
    }
}

fn drain(events: &mut broadcast::Receiver<ConnectionEvent>) -> Vec<ConnectionEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

async fn next_event(events: &mut broadcast::Receiver<ConnectionEvent>) -> ConnectionEvent {
    tokio::time::timeout(Duration::from_secs(600), events.recv())
        .await
        .expect("event before timeout")
        .expect("event channel open")
}

#[tokio::test(start_paused = true)]
async fn test_all_endpoints_failing_stops_after_max_attempts_round_robin() {
    let (manager, connector) = manager_with(&[A, B, C], 5);
    let started = Instant::now();

    let (tried, last_error) = expect_failure(manager.connect().await);

    let expected = vec![A, B, C, A, B];
    assert_eq!(tried, expected);
    assert_eq!(connector.attempts(), expected);
    assert!(last_error.contains("connection refused"));
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(manager.attempt_count().await, 5);

    // Four 2s pauses between five attempts, none after the last
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(8), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(10), "elapsed {:?}", elapsed);
}

#[tokio::test(start_paused = true)]
async fn test_failover_binds_to_first_healthy_endpoint() {
    let (manager, connector) = manager_with(&[A, B, C], 5);
    connector.set_behavior(C, MockEndpoint::Healthy);
    let mut events = manager.subscribe();

    let handle = manager.connect().await.expect("C is healthy");

    assert_eq!(handle.endpoint(), C);
    assert_eq!(connector.attempts(), vec![A, B, C]);
    assert_eq!(manager.attempt_count().await, 0);
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(manager.current_endpoint().await, C);

    let seen = drain(&mut events);
    assert_eq!(seen.len(), 3);
    assert!(matches!(&seen[0], ConnectionEvent::Error { endpoint, .. } if endpoint == A));
    assert!(matches!(&seen[1], ConnectionEvent::Error { endpoint, .. } if endpoint == B));
    assert_eq!(
        seen[2],
        ConnectionEvent::Connected {
            endpoint: C.to_string()
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_connect_shares_one_attempt() {
    let (manager, connector) = manager_with(&[A], 5);
    connector.set_behavior(A, MockEndpoint::Healthy);
    connector.set_connect_delay(Duration::from_millis(250));

    let first = manager.clone();
    let second = manager.clone();
    let (left, right) = tokio::join!(
        tokio::spawn(async move { first.connect().await }),
        tokio::spawn(async move { second.connect().await }),
    );

    let left = left.expect("task").expect("connected");
    let right = right.expect("task").expect("connected");
    assert!(Arc::ptr_eq(&left, &right));
    assert_eq!(connector.attempts(), vec![A]);
}

#[tokio::test(start_paused = true)]
async fn test_is_connecting_visible_while_sequence_runs() {
    let (manager, connector) = manager_with(&[A], 5);
    connector.set_behavior(A, MockEndpoint::Healthy);
    connector.set_connect_delay(Duration::from_secs(1));
    let mut states = manager.watch_state();

    let background = manager.clone();
    let task = tokio::spawn(async move { background.connect().await });

    states.changed().await.expect("state change");
    assert_eq!(*states.borrow_and_update(), ConnectionState::Connecting);
    assert!(manager.is_connecting());

    task.await.expect("task").expect("connected");
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert!(!manager.is_connecting());
}

#[tokio::test(start_paused = true)]
async fn test_handshake_timeout_counts_as_attempt() {
    let (manager, connector) = manager_with(&[A, B], 5);
    connector.set_behavior(A, MockEndpoint::Hang);
    connector.set_behavior(B, MockEndpoint::Healthy);
    let mut events = manager.subscribe();
    let started = Instant::now();

    let handle = manager.connect().await.expect("B is healthy");

    assert_eq!(handle.endpoint(), B);
    assert_eq!(connector.attempts(), vec![A, B]);
    assert!(started.elapsed() >= Duration::from_secs(62));

    match next_event(&mut events).await {
        ConnectionEvent::Error { endpoint, message } => {
            assert_eq!(endpoint, A);
            assert!(message.contains("timed out after 60s"), "{}", message);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_probe_failure_is_retried_and_handle_closed() {
    let (manager, connector) = manager_with(&[A, B], 5);
    connector.set_behavior(A, MockEndpoint::ProbeFail);
    connector.set_behavior(B, MockEndpoint::Healthy);

    let handle = manager.connect().await.expect("B is healthy");

    assert_eq!(handle.endpoint(), B);
    let handles = connector.handles();
    assert_eq!(handles.len(), 2);
    assert_eq!(handles[0].disconnect_calls(), 1);
    assert!(!handles[0].is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_single_endpoint_is_retried_max_attempts_times() {
    let (manager, connector) = manager_with(&[A], 3);

    let (tried, _) = expect_failure(manager.connect().await);

    assert_eq!(tried, vec![A, A, A]);
    assert_eq!(connector.attempts().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_connect_after_exhaustion_gets_a_fresh_budget() {
    let (manager, connector) = manager_with(&[A, B, C], 5);
    expect_failure(manager.connect().await);
    assert_eq!(manager.attempt_count().await, 5);
    // Cursor sits after the last failed endpoint (B)
    assert_eq!(manager.current_endpoint().await, C);

    connector.set_behavior(C, MockEndpoint::Healthy);
    let handle = manager.connect().await.expect("C is healthy now");

    assert_eq!(handle.endpoint(), C);
    assert_eq!(connector.attempts().len(), 6);
    assert_eq!(manager.attempt_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_transport_disconnect_triggers_reconnect() {
    let (manager, connector) = manager_with(&[A, B], 5);
    connector.set_behavior(A, MockEndpoint::Healthy);
    manager.connect().await.expect("A is healthy");
    let mut events = manager.subscribe();

    let first = connector.last_handle().expect("handle");
    first.drop_connection();

    assert_eq!(
        next_event(&mut events).await,
        ConnectionEvent::Disconnected {
            endpoint: A.to_string()
        }
    );
    assert_eq!(
        next_event(&mut events).await,
        ConnectionEvent::Connected {
            endpoint: A.to_string()
        }
    );

    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(connector.attempts(), vec![A, A]);
    assert_eq!(first.disconnect_calls(), 1);

    let current = manager.get_handle().await.expect("connected");
    assert!(current.is_connected());
    assert_eq!(connector.attempts().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_background_reconnect_reports_error() {
    let (manager, connector) = manager_with(&[A], 2);
    connector.set_behavior(A, MockEndpoint::Healthy);
    manager.connect().await.expect("A is healthy");
    let mut events = manager.subscribe();

    connector.set_behavior(A, MockEndpoint::Refuse);
    connector.last_handle().expect("handle").drop_connection();

    assert!(matches!(
        next_event(&mut events).await,
        ConnectionEvent::Disconnected { .. }
    ));
    // One error per failed attempt, then the terminal failure
    let mut errors = Vec::new();
    while errors.len() < 3 {
        match next_event(&mut events).await {
            ConnectionEvent::Error { message, .. } => errors.push(message),
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert!(errors[2].starts_with("Failed to connect to any endpoint"));
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(manager.current_handle().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_handle_errors_are_forwarded_without_reconnect() {
    let (manager, connector) = manager_with(&[A], 5);
    connector.set_behavior(A, MockEndpoint::Healthy);
    manager.connect().await.expect("A is healthy");
    let mut events = manager.subscribe();

    connector.last_handle().expect("handle").emit_error("frame too large");

    assert_eq!(
        next_event(&mut events).await,
        ConnectionEvent::Error {
            endpoint: A.to_string(),
            message: "frame too large".to_string()
        }
    );
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(connector.attempts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_is_idempotent() {
    let (manager, connector) = manager_with(&[A], 5);
    connector.set_behavior(A, MockEndpoint::Healthy);
    manager.connect().await.expect("A is healthy");
    let mut events = manager.subscribe();

    manager.disconnect().await;
    manager.disconnect().await;

    let handle = connector.last_handle().expect("handle");
    assert_eq!(handle.disconnect_calls(), 1);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(manager.attempt_count().await, 0);
    assert_eq!(
        drain(&mut events),
        vec![ConnectionEvent::Disconnected {
            endpoint: A.to_string()
        }]
    );

    // No reconnect follows an explicit disconnect
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(connector.attempts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_interrupts_hanging_handshake() {
    let (manager, connector) = manager_with(&[A], 5);
    connector.set_behavior(A, MockEndpoint::Hang);

    let background = manager.clone();
    let task = tokio::spawn(async move { background.connect().await });
    tokio::time::sleep(Duration::from_secs(1)).await;

    // Accessors answer while the sequence still holds its lock
    assert!(manager.is_connecting());
    assert_eq!(manager.attempt_count().await, 0);
    assert_eq!(manager.current_endpoint().await, A);
    assert!(manager.current_handle().await.is_none());

    let started = Instant::now();
    manager.disconnect().await;

    assert!(started.elapsed() < Duration::from_secs(1), "elapsed {:?}", started.elapsed());
    assert!(matches!(task.await.expect("task"), Err(DashboardError::Cancelled)));
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(manager.attempt_count().await, 0);
    assert_eq!(connector.attempts(), vec![A]);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_interrupts_backoff_pause() {
    let (manager, connector) = manager_with(&[A, B], 5);

    let background = manager.clone();
    let task = tokio::spawn(async move { background.connect().await });
    // First attempt fails at once, the sequence is now in its 2s pause
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(manager.attempt_count().await, 1);
    assert_eq!(manager.current_endpoint().await, B);

    manager.disconnect().await;

    assert!(matches!(task.await.expect("task"), Err(DashboardError::Cancelled)));
    assert_eq!(connector.attempts(), vec![A]);
    assert_eq!(manager.attempt_count().await, 0);

    // A later connect gets a fresh token and runs normally
    connector.set_behavior(A, MockEndpoint::Healthy);
    connector.set_behavior(B, MockEndpoint::Healthy);
    let handle = manager.connect().await.expect("healthy now");
    assert_eq!(handle.endpoint(), B);
}

#[tokio::test(start_paused = true)]
async fn test_drop_during_handshake_still_triggers_reconnect() {
    let (manager, connector) = manager_with(&[A], 5);
    connector.set_behavior(A, MockEndpoint::DropDuringProbe);
    let mut events = manager.subscribe();

    manager.connect().await.expect("probe passed");
    connector.set_behavior(A, MockEndpoint::Healthy);

    for expected in [
        ConnectionEvent::Connected {
            endpoint: A.to_string(),
        },
        ConnectionEvent::Disconnected {
            endpoint: A.to_string(),
        },
        ConnectionEvent::Connected {
            endpoint: A.to_string(),
        },
    ] {
        assert_eq!(next_event(&mut events).await, expected);
    }

    assert_eq!(connector.attempts(), vec![A, A]);
    let current = manager.current_handle().await.expect("reconnected");
    assert!(current.is_connected());
}
