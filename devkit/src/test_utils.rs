/*!
Test harness for the virtual device.

Wires a [`Device`] to a [`MockNetwork`] with in-memory latency and
message-log sinks, so a test can drive it with raw TATU commands and assert
on what it publishes.
*/

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use fot_device::rtt::{LatencyContext, RttTracker};
use fot_device::sink::{BatchSink, BatchWriter};
use fot_device::tatu::topics;
use fot_device::{
    migration, BrokerSettings, DataRecord, Device, DeviceError, LatencyRecord, MigrationOutcome,
    SensorSpec, SinkError,
};
use parking_lot::Mutex;
use serde_json::Value;

use crate::gateway::{FakeGateway, GatewayPolicy};
use crate::mqtt_stub::{MockMessage, MockNetwork};

pub const DEVICE_ID: &str = "sc01";
pub const PRIMARY_BROKER: &str = "broker-a";
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Installs a test-friendly tracing subscriber once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Keeps every flushed item in memory.
pub struct MemorySink<T> {
    items: Arc<Mutex<Vec<T>>>,
}

impl<T> MemorySink<T> {
    pub fn new() -> (Self, Arc<Mutex<Vec<T>>>) {
        let items = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                items: Arc::clone(&items),
            },
            items,
        )
    }
}

#[async_trait]
impl<T> BatchSink<T> for MemorySink<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn flush(&mut self, batch: &[T]) -> Result<(), SinkError> {
        self.items.lock().extend_from_slice(batch);
        Ok(())
    }
}

/// Polls `condition` until it holds or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Resolves a dotted path such as `BODY.temp` inside a JSON value.
pub fn field<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, part| match current {
        Value::Object(object) => object.get(part),
        _ => None,
    })
}

pub struct TestHarness {
    pub network: MockNetwork,
    pub device: Arc<Device>,
    latency_writer: BatchWriter<LatencyRecord>,
    message_writer: BatchWriter<DataRecord>,
    latency: Arc<Mutex<Vec<LatencyRecord>>>,
    messages: Arc<Mutex<Vec<DataRecord>>>,
    gateways: HashMap<String, FakeGateway>,
}

impl TestHarness {
    /// Device `sc01` with `specs`, a 300 ms migration timeout and a
    /// reachable `broker-a:1883`. Nothing is connected yet.
    pub fn new(specs: Vec<SensorSpec>) -> Self {
        Self::with_timeout(specs, Duration::from_millis(300))
    }

    pub fn with_timeout(specs: Vec<SensorSpec>, migration_timeout: Duration) -> Self {
        init_tracing();

        let network = MockNetwork::new();
        network.add_broker(&uri(PRIMARY_BROKER));

        let (latency_sink, latency) = MemorySink::new();
        let latency_writer = BatchWriter::new("test-latency", latency_sink, 1);
        latency_writer.start();
        let (message_sink, messages) = MemorySink::new();
        let message_writer = BatchWriter::new("test-messages", message_sink, 1);
        message_writer.start();

        let tracker = Arc::new(RttTracker::new(
            LatencyContext {
                device_id: DEVICE_ID.to_string(),
                experiment: 7,
                exp_type: 1,
                level: 2,
            },
            vec![latency_writer.handle()],
        ));
        let device = Device::new(
            DEVICE_ID,
            specs,
            Arc::new(network.transport()),
            tracker,
            Some(message_writer.handle()),
            migration_timeout,
        );

        Self {
            network,
            device,
            latency_writer,
            message_writer,
            latency,
            messages,
            gateways: HashMap::new(),
        }
    }

    /// Two sensors: `temp` (10..=30) and `hum` (40..=60).
    pub fn default_sensors() -> Vec<SensorSpec> {
        vec![
            SensorSpec::new("temp", "thermometer", 100, 300, 10, 30, 1).expect("valid sensor"),
            SensorSpec::new("hum", "hygrometer", 100, 300, 40, 60, 2).expect("valid sensor"),
        ]
    }

    /// Adds a broker at `host:1883` answered by a gateway with `policy`.
    pub fn add_broker(&mut self, host: &str, policy: GatewayPolicy) {
        self.network.add_broker(&uri(host));
        self.gateways.insert(
            host.to_string(),
            FakeGateway::spawn(&self.network, &uri(host), policy),
        );
    }

    pub fn gateway(&self, host: &str) -> Option<&FakeGateway> {
        self.gateways.get(host)
    }

    /// Runs the initial handshake against `broker-a`, answered per `policy`.
    pub async fn bootstrap(
        &mut self,
        policy: GatewayPolicy,
    ) -> Result<MigrationOutcome, DeviceError> {
        self.gateways.insert(
            PRIMARY_BROKER.to_string(),
            FakeGateway::spawn(&self.network, &uri(PRIMARY_BROKER), policy),
        );
        let timeout = self.device.migration_timeout();
        migration::start(&self.device, settings(PRIMARY_BROKER), timeout, true).await
    }

    /// Broker the device currently lives on.
    pub fn current_broker(&self) -> Option<String> {
        self.device.settings().map(|settings| settings.uri())
    }

    /// Publishes a raw command on `dev/<id>` of the current broker.
    pub fn send(&self, command: &str) -> Result<()> {
        let Some(broker) = self.current_broker() else {
            bail!("device {} is not connected", DEVICE_ID);
        };
        self.network
            .inject(&broker, &topics::device(DEVICE_ID), command.as_bytes().to_vec());
        Ok(())
    }

    pub fn responses(&self, host: &str) -> Vec<MockMessage> {
        self.network
            .published_on(&uri(host), &topics::device_response(DEVICE_ID))
    }

    /// Waits for at least `count` responses on `host`.
    pub async fn wait_for_responses(
        &self,
        host: &str,
        count: usize,
        timeout: Duration,
    ) -> Vec<MockMessage> {
        wait_until(timeout, || self.responses(host).len() >= count).await;
        self.responses(host)
    }

    pub fn latency_records(&self) -> Vec<LatencyRecord> {
        self.latency.lock().clone()
    }

    pub fn data_records(&self) -> Vec<DataRecord> {
        self.messages.lock().clone()
    }

    /// Shuts the device down and flushes both writers.
    pub async fn teardown(self) {
        self.device.shutdown();
        self.latency_writer.stop(Duration::from_secs(1)).await;
        self.message_writer.stop(Duration::from_secs(1)).await;
    }
}

/// `host:1883`, the key the mock network uses.
pub fn uri(host: &str) -> String {
    format!("{host}:1883")
}

pub fn settings(host: &str) -> BrokerSettings {
    BrokerSettings::builder()
        .device_id(DEVICE_ID)
        .host(host)
        .build()
        .expect("valid broker settings")
}
