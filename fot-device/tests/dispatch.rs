//! Command dispatch through the in-memory broker.

use std::time::Duration;

use fot_device::{FlowControl, FlowState, MigrationOutcome};
use fot_devkit::test_utils::{field, wait_until, PRIMARY_BROKER};
use fot_devkit::{GatewayPolicy, TatuCommand, TestHarness};

const WAIT: Duration = Duration::from_secs(2);

async fn connected() -> TestHarness {
    let mut harness = TestHarness::new(TestHarness::default_sensors());
    let outcome = harness.bootstrap(GatewayPolicy::Accept).await.unwrap();
    assert_eq!(outcome, MigrationOutcome::Committed);
    harness
}

#[tokio::test]
async fn get_answers_with_a_value_in_range() {
    let harness = connected().await;

    harness.send(&TatuCommand::get("hum")).unwrap();
    let responses = harness.wait_for_responses(PRIMARY_BROKER, 1, WAIT).await;

    assert_eq!(responses.len(), 1);
    let json = responses[0].json().unwrap();
    assert_eq!(field(&json, "METHOD").unwrap(), "GET");
    assert_eq!(field(&json, "HEADER.NAME").unwrap(), "sc01");
    let value = field(&json, "BODY.hum").and_then(|v| v.as_i64()).unwrap();
    assert!((40..=60).contains(&value));
    harness.teardown().await;
}

#[tokio::test]
async fn unknown_sensor_and_garbage_get_no_answer() {
    let harness = connected().await;

    harness.send(&TatuCommand::get("pressure")).unwrap();
    harness.send("hello").unwrap();
    harness.send("PING VALUE temp").unwrap();
    harness.send(r#"FLOW VALUE temp {"collect":"#).unwrap();
    harness.send(&TatuCommand::get("temp")).unwrap();

    let responses = harness.wait_for_responses(PRIMARY_BROKER, 1, WAIT).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let responses_after = harness.responses(PRIMARY_BROKER);

    assert_eq!(responses.len(), 1);
    assert_eq!(responses_after.len(), 1);
    let json = responses[0].json().unwrap();
    assert!(field(&json, "BODY.temp").is_some());
    assert_eq!(harness.device.sensor("temp").unwrap().state(), FlowState::Idle);
    harness.teardown().await;
}

#[tokio::test]
async fn flow_publishes_windows_until_stopped() {
    let harness = connected().await;

    harness.send(&TatuCommand::flow("temp", 50, 200)).unwrap();
    let responses = harness.wait_for_responses(PRIMARY_BROKER, 2, WAIT).await;
    assert!(responses.len() >= 2);

    let json = responses[0].json().unwrap();
    assert_eq!(field(&json, "METHOD").unwrap(), "FLOW");
    assert_eq!(field(&json, "BODY.FLOW.publish").unwrap(), 200);
    assert_eq!(field(&json, "BODY.FLOW.collect").unwrap(), 50);
    let values = field(&json, "BODY.temp").and_then(|v| v.as_array()).unwrap();
    assert!(!values.is_empty());
    assert!(values
        .iter()
        .all(|v| (10..=30).contains(&v.as_i64().unwrap())));

    assert!(wait_until(WAIT, || !harness.data_records().is_empty()).await);
    let record = &harness.data_records()[0];
    assert_eq!((record.device_id.as_str(), record.sensor_id.as_str()), ("sc01", "temp"));

    harness.send(&TatuCommand::stop_flow("temp")).unwrap();
    let temp = harness.device.sensor("temp").unwrap();
    assert!(wait_until(WAIT, || temp.state() == FlowState::Stopped).await);

    tokio::time::sleep(Duration::from_millis(250)).await;
    let settled = harness.responses(PRIMARY_BROKER).len();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(harness.responses(PRIMARY_BROKER).len(), settled);
    harness.teardown().await;
}

#[tokio::test]
async fn repeated_flow_commands_keep_one_loop() {
    let harness = connected().await;

    for _ in 0..5 {
        harness.send(&TatuCommand::flow("hum", 50, 150)).unwrap();
    }
    let hum = harness.device.sensor("hum").unwrap();
    assert!(wait_until(WAIT, || hum.state() == FlowState::Running).await);
    harness.wait_for_responses(PRIMARY_BROKER, 1, WAIT).await;

    assert_eq!(hum.spawned_loops(), 1);
    assert_eq!(hum.intervals(), (50, 150));
    harness.teardown().await;
}

#[tokio::test]
async fn commands_before_connection_are_refused() {
    let harness = TestHarness::new(TestHarness::default_sensors());
    assert!(harness.send(&TatuCommand::get("temp")).is_err());
}
