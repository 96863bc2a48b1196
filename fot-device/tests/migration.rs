//! Broker handshakes and live migration.

use std::time::Duration;

use fot_device::{migration, DeviceError, FlowControl, FlowState, MigrationOutcome};
use fot_devkit::test_utils::{field, settings, uri, wait_until, DEVICE_ID, PRIMARY_BROKER};
use fot_devkit::{GatewayPolicy, TatuCommand, TestHarness};

const WAIT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn initial_handshake_announces_the_device() {
    let mut harness = TestHarness::new(TestHarness::default_sensors());

    let outcome = harness.bootstrap(GatewayPolicy::Accept).await.unwrap();

    assert_eq!(outcome, MigrationOutcome::Committed);
    assert_eq!(harness.current_broker(), Some(uri(PRIMARY_BROKER)));
    assert!(!harness.device.is_migrating());

    let gateway = harness.gateway(PRIMARY_BROKER).unwrap();
    assert_eq!(gateway.connects(), 1);
    let connect = gateway.last_connect().unwrap();
    assert_eq!(field(&connect, "TIME_OUT").unwrap(), 300);
    assert_eq!(field(&connect, "HEADER.NAME").unwrap(), DEVICE_ID);
    assert!(field(&connect, "HEADER.SOURCE_IP").is_some());
    assert_eq!(field(&connect, "DEVICE.id").unwrap(), DEVICE_ID);
    let sensors = field(&connect, "DEVICE.sensors").and_then(|s| s.as_array()).unwrap();
    assert_eq!(sensors.len(), 2);
    assert_eq!(sensors[0]["publishing_time"], 300);

    let broker = uri(PRIMARY_BROKER);
    assert!(wait_until(WAIT, || harness.network.clients(&broker) == vec!["sc01_CLIENT".to_string()]).await);
    assert_eq!(
        harness.network.subscriptions(&broker, "sc01_CLIENT"),
        vec!["dev/sc01".to_string()]
    );
    harness.teardown().await;
}

#[tokio::test]
async fn initial_rejection_is_fatal() {
    let mut harness = TestHarness::new(TestHarness::default_sensors());

    let err = harness.bootstrap(GatewayPolicy::Reject).await.unwrap_err();

    assert!(matches!(err, DeviceError::HandshakeRejected { .. }));
    assert!(harness.device.connection().is_none());
    assert!(!harness.device.is_migrating());
}

#[tokio::test]
async fn initial_timeout_is_fatal() {
    let mut harness = TestHarness::with_timeout(TestHarness::default_sensors(), Duration::from_millis(100));

    let err = harness.bootstrap(GatewayPolicy::Silent).await.unwrap_err();

    assert!(matches!(
        err,
        DeviceError::HandshakeTimedOut { timeout_ms: 100, .. }
    ));
    assert!(harness.device.connection().is_none());
    assert!(harness.network.clients(&uri(PRIMARY_BROKER)).is_empty());
}

#[tokio::test]
async fn unreachable_initial_broker_is_a_transport_error() {
    let harness = TestHarness::new(TestHarness::default_sensors());
    harness.network.set_reachable(&uri(PRIMARY_BROKER), false);

    let err = migration::start(&harness.device, settings(PRIMARY_BROKER), Duration::from_millis(100), true)
        .await
        .unwrap_err();

    assert!(matches!(err, DeviceError::Transport(_)));
    assert!(!harness.device.is_migrating());
}

#[tokio::test]
async fn set_broker_moves_the_device() {
    let mut harness = TestHarness::new(TestHarness::default_sensors());
    harness.bootstrap(GatewayPolicy::Accept).await.unwrap();
    harness.add_broker("broker-b", GatewayPolicy::Accept);

    harness
        .send(&TatuCommand::set_broker("broker-b", 1883, "karaf", "karaf"))
        .unwrap();

    let target = uri("broker-b");
    assert!(wait_until(WAIT, || harness.current_broker().as_deref() == Some(target.as_str())).await);
    assert!(wait_until(WAIT, || harness.network.clients(&uri(PRIMARY_BROKER)).is_empty()).await);
    assert_eq!(harness.device.tracker().broker(), target);
    assert!(!harness.device.is_migrating());

    harness.send(&TatuCommand::get("temp")).unwrap();
    assert_eq!(harness.wait_for_responses("broker-b", 1, WAIT).await.len(), 1);
    harness.teardown().await;
}

#[tokio::test]
async fn rejected_or_silent_broker_leaves_the_device_in_place() {
    let mut harness = TestHarness::new(TestHarness::default_sensors());
    harness.bootstrap(GatewayPolicy::Accept).await.unwrap();
    harness.add_broker("broker-r", GatewayPolicy::Reject);
    harness.add_broker("broker-s", GatewayPolicy::Silent);

    harness
        .send(&TatuCommand::set_broker("broker-r", 1883, "karaf", "karaf"))
        .unwrap();
    let gateway = harness.gateway("broker-r").unwrap();
    assert!(wait_until(WAIT, || gateway.connects() == 1).await);
    assert!(wait_until(WAIT, || !harness.device.is_migrating()).await);
    assert_eq!(harness.current_broker(), Some(uri(PRIMARY_BROKER)));

    harness
        .send(&TatuCommand::set_broker("broker-s", 1883, "karaf", "karaf"))
        .unwrap();
    assert!(wait_until(WAIT, || harness.device.is_migrating()).await);
    assert!(wait_until(WAIT, || !harness.device.is_migrating()).await);
    assert_eq!(harness.current_broker(), Some(uri(PRIMARY_BROKER)));
    assert!(harness.network.clients(&uri("broker-s")).is_empty());

    harness.send(&TatuCommand::get("hum")).unwrap();
    assert_eq!(harness.wait_for_responses(PRIMARY_BROKER, 1, WAIT).await.len(), 1);
    harness.teardown().await;
}

#[tokio::test]
async fn concurrent_migration_is_refused() {
    let mut harness = TestHarness::new(TestHarness::default_sensors());
    harness.bootstrap(GatewayPolicy::Accept).await.unwrap();
    harness.add_broker("broker-s", GatewayPolicy::Silent);
    harness.add_broker("broker-b", GatewayPolicy::Accept);

    harness
        .send(&TatuCommand::set_broker("broker-s", 1883, "karaf", "karaf"))
        .unwrap();
    assert!(wait_until(WAIT, || harness.device.is_migrating()).await);

    let outcome = migration::start(&harness.device, settings("broker-b"), Duration::from_millis(100), false)
        .await
        .unwrap();
    assert_eq!(outcome, MigrationOutcome::Busy);
    let err = migration::start(&harness.device, settings("broker-b"), Duration::from_millis(100), true)
        .await
        .unwrap_err();
    assert!(matches!(err, DeviceError::MigrationInProgress(_)));

    harness
        .send(&TatuCommand::set_broker("broker-b", 1883, "karaf", "karaf"))
        .unwrap();
    assert!(wait_until(WAIT, || !harness.device.is_migrating()).await);
    assert_eq!(harness.current_broker(), Some(uri(PRIMARY_BROKER)));
    assert_eq!(harness.gateway("broker-b").unwrap().connects(), 0);
    harness.teardown().await;
}

#[tokio::test]
async fn running_flow_follows_the_device() {
    let mut harness = TestHarness::new(TestHarness::default_sensors());
    harness.bootstrap(GatewayPolicy::Accept).await.unwrap();
    harness.add_broker("broker-b", GatewayPolicy::Accept);

    harness.send(&TatuCommand::flow("temp", 50, 150)).unwrap();
    harness.wait_for_responses(PRIMARY_BROKER, 1, WAIT).await;

    harness
        .send(&TatuCommand::set_broker("broker-b", 1883, "karaf", "karaf"))
        .unwrap();
    let target = uri("broker-b");
    assert!(wait_until(WAIT, || harness.current_broker().as_deref() == Some(target.as_str())).await);

    assert!(!harness.wait_for_responses("broker-b", 1, WAIT).await.is_empty());
    let temp = harness.device.sensor("temp").unwrap();
    assert_eq!(temp.state(), FlowState::Running);
    assert_eq!(temp.intervals(), (50, 150));
    assert_eq!(harness.device.sensor("hum").unwrap().state(), FlowState::Idle);
    harness.teardown().await;
}
