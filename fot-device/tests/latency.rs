//! Round-trip latency records for flow publishes.

use std::time::Duration;

use fot_devkit::test_utils::{uri, wait_until, PRIMARY_BROKER};
use fot_devkit::{GatewayPolicy, TatuCommand, TestHarness};

const WAIT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn acknowledged_windows_become_latency_records() {
    let mut harness = TestHarness::new(TestHarness::default_sensors());
    harness.bootstrap(GatewayPolicy::Accept).await.unwrap();

    harness.send(&TatuCommand::flow("temp", 50, 150)).unwrap();
    assert!(wait_until(WAIT, || !harness.latency_records().is_empty()).await);

    let record = &harness.latency_records()[0];
    assert_eq!(record.device_id, "sc01");
    assert_eq!(record.sensor_id, "temp");
    assert_eq!(record.broker_ip, uri(PRIMARY_BROKER));
    assert_eq!((record.experiment, record.exp_type, record.level), (7, 1, 2));
    assert!(record.latency >= 0.0);
    assert!(record.message.contains("\"FLOW\""));
    harness.teardown().await;
}

#[tokio::test]
async fn unacknowledged_windows_stay_in_flight() {
    let mut harness = TestHarness::new(TestHarness::default_sensors());
    harness.bootstrap(GatewayPolicy::Accept).await.unwrap();
    let broker = uri(PRIMARY_BROKER);
    harness.network.set_auto_ack(&broker, false);

    harness.send(&TatuCommand::flow("hum", 50, 100)).unwrap();
    harness.wait_for_responses(PRIMARY_BROKER, 2, WAIT).await;
    harness.send(&TatuCommand::stop_flow("hum")).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let tracker = harness.device.tracker();
    let in_flight = tracker.in_flight();
    assert!(in_flight >= 2);
    assert!(harness.latency_records().is_empty());

    assert_eq!(harness.network.release_acks(&broker), in_flight);
    assert!(wait_until(WAIT, || harness.latency_records().len() == in_flight).await);
    assert_eq!(tracker.in_flight(), 0);
    harness.teardown().await;
}

#[tokio::test]
async fn get_replies_are_not_timed() {
    let mut harness = TestHarness::new(TestHarness::default_sensors());
    harness.bootstrap(GatewayPolicy::Accept).await.unwrap();

    harness.send(&TatuCommand::get("temp")).unwrap();
    harness.wait_for_responses(PRIMARY_BROKER, 1, WAIT).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(harness.latency_records().is_empty());
    assert_eq!(harness.device.tracker().in_flight(), 0);
    harness.teardown().await;
}
