//! Recovery driven by network reachability

mod common;

use common::{test_device, test_options, wait_for_event, SwitchableConnector, TestServer, STEP};
use livelink::network::{
    ChannelEventSink, ClientEvent, ConnectionState, LiveClient, NetworkPath, ReachabilityMonitor,
    ReachabilityStatus,
};
use livelink::recovery::{ErrorKind, RecoveryDecision};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_network_return_recovers_immediately() {
    let server = TestServer::bind().await;
    let connector = SwitchableConnector::new(false);
    let (monitor, handle) = ReachabilityMonitor::manual(NetworkPath::unavailable());
    let (sink, mut events) = ChannelEventSink::new();
    let mut options = test_options(server.port());
    // a backoff timer would never fire within the test
    options.reconnect.backoff.base = Duration::from_secs(60);
    options.reconnect.backoff.max = Duration::from_secs(60);
    let client = LiveClient::builder(options)
        .device_info(test_device())
        .connector(connector.clone())
        .reachability(monitor)
        .event_sink(Arc::new(sink))
        .build()
        .await
        .unwrap();

    client.connect().await.unwrap();
    let error = wait_for_event(&mut events, |e| matches!(e, ClientEvent::Error { .. }))
        .await
        .expect("error event");
    match error {
        ClientEvent::Error {
            record,
            presentation,
        } => {
            assert_eq!(record.kind, ErrorKind::NetworkUnavailable);
            assert_eq!(presentation.title, "No network connection");
        }
        other => panic!("unexpected event {:?}", other),
    }

    let diagnostics = client.diagnostics().await.unwrap();
    assert_eq!(diagnostics.state, ConnectionState::Disconnected);
    assert!(!diagnostics.recovery.retry_pending);
    assert_eq!(diagnostics.recovery.reachability, ReachabilityStatus::Unavailable);

    connector.set_online(true);
    assert!(handle.set_available());

    let _conn = server.accept().await;
    assert!(
        client
            .wait_for_state(ConnectionState::Connected, Duration::from_secs(1))
            .await
    );
    assert!(wait_for_event(&mut events, |e| matches!(
        e,
        ClientEvent::RecoveryRetry(ErrorKind::NetworkUnavailable)
    ))
    .await
    .is_some());
    assert_eq!(connector.calls(), 2);
}

#[tokio::test]
async fn test_manual_trigger_waits_while_network_is_down() {
    let connector = SwitchableConnector::new(false);
    let (monitor, _handle) = ReachabilityMonitor::manual(NetworkPath::unavailable());
    let client = LiveClient::builder(test_options(1))
        .device_info(test_device())
        .connector(connector.clone())
        .reachability(monitor)
        .build()
        .await
        .unwrap();

    client.connect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let decision = client.trigger_recovery().await.unwrap();
    assert_eq!(decision, RecoveryDecision::WaitForNetwork);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(connector.calls(), 1);
}

#[tokio::test]
async fn test_reachability_change_without_network_error_is_ignored() {
    let server = TestServer::bind().await;
    let (monitor, handle) = ReachabilityMonitor::manual(NetworkPath::available());
    let client = LiveClient::builder(test_options(server.port()))
        .device_info(test_device())
        .reachability(monitor)
        .build()
        .await
        .unwrap();

    client.connect().await.unwrap();
    let _conn = server.accept().await;
    assert!(client.wait_for_state(ConnectionState::Connected, STEP).await);

    handle.set_unavailable();
    handle.set_available();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let diagnostics = client.diagnostics().await.unwrap();
    assert_eq!(diagnostics.state, ConnectionState::Connected);
    assert_eq!(diagnostics.connection.successful_connections, 1);
    assert!(diagnostics.recovery.current_error.is_none());
}

#[tokio::test]
async fn test_clear_error_resets_recovery_state() {
    let connector = SwitchableConnector::new(false);
    let mut options = test_options(1);
    options.reconnect.backoff.base = Duration::from_secs(60);
    options.reconnect.backoff.max = Duration::from_secs(60);
    let client = LiveClient::builder(options)
        .device_info(test_device())
        .connector(connector.clone())
        .build()
        .await
        .unwrap();

    client.connect().await.unwrap();
    assert!(client.wait_for_state(ConnectionState::Reconnecting, STEP).await);

    client.clear_error().await.unwrap();
    let diagnostics = client.diagnostics().await.unwrap();
    assert!(diagnostics.recovery.current_error.is_none());
    assert!(!diagnostics.recovery.retry_pending);
    assert_eq!(diagnostics.recovery.consecutive_failures, 0);
    assert_eq!(diagnostics.state, ConnectionState::Disconnected);
    assert_eq!(diagnostics.recovery.total_errors, 1);
}
