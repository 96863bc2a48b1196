//! Device orchestrator.
//!
//! Owns the sensors and the single live broker link, and dispatches inbound
//! TATU commands: GET answers with a sample, FLOW drives a sensor, SET
//! `brokerMqtt` starts a broker migration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use rand::Rng;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::error::TransportError;
use crate::migration;
use crate::model::{BrokerSettings, DataRecord, SensorSpec};
use crate::rtt::RttTracker;
use crate::sensor::{FlowControl, FlowState, Sensor, NULL_SENSOR};
use crate::sink::BatchHandle;
use crate::tatu::{build_get_response, topics, ConnectDevice, Method, TatuMessage};
use crate::transport::{Connection, ConnectionEvents, DeliveryToken, QoS, Transport};

const SET_BROKER_TARGET: &str = "brokerMqtt";

/// Live broker session and the settings it was opened with.
#[derive(Clone)]
pub struct Link {
    pub settings: BrokerSettings,
    pub connection: Arc<dyn Connection>,
}

pub struct Device {
    id: String,
    latitude: f64,
    longitude: f64,
    specs: Vec<SensorSpec>,
    sensors: Vec<Sensor>,
    transport: Arc<dyn Transport>,
    tracker: Arc<RttTracker>,
    link: RwLock<Option<Link>>,
    migrating: AtomicBool,
    migration_timeout: Duration,
    this: Weak<Device>,
}

impl Device {
    pub fn new(
        id: impl Into<String>,
        specs: Vec<SensorSpec>,
        transport: Arc<dyn Transport>,
        tracker: Arc<RttTracker>,
        message_log: Option<BatchHandle<DataRecord>>,
        migration_timeout: Duration,
    ) -> Arc<Self> {
        let id = id.into();
        let mut rng = rand::thread_rng();
        let latitude = rng.gen_range(-90.0..=90.0);
        let longitude = rng.gen_range(-180.0..=180.0);
        let sensors = specs
            .iter()
            .map(|spec| {
                Sensor::new(
                    id.clone(),
                    spec.clone(),
                    Arc::clone(&tracker),
                    message_log.clone(),
                )
            })
            .collect();

        Arc::new_cyclic(|this| Self {
            id,
            latitude,
            longitude,
            specs,
            sensors,
            transport,
            tracker,
            link: RwLock::new(None),
            migrating: AtomicBool::new(false),
            migration_timeout,
            this: this.clone(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn coordinates(&self) -> (f64, f64) {
        (self.latitude, self.longitude)
    }

    pub fn sensors(&self) -> &[Sensor] {
        &self.sensors
    }

    pub fn sensor(&self, id: &str) -> Option<&Sensor> {
        self.sensors.iter().find(|sensor| sensor.id() == id)
    }

    /// Like [`Device::sensor`] but falls back to the null sensor.
    pub fn flow_control(&self, id: &str) -> &dyn FlowControl {
        match self.sensor(id) {
            Some(sensor) => sensor,
            None => &NULL_SENSOR,
        }
    }

    pub fn descriptor(&self) -> ConnectDevice<'_> {
        ConnectDevice {
            id: &self.id,
            latitude: self.latitude,
            longitude: self.longitude,
            sensors: &self.specs,
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn tracker(&self) -> &Arc<RttTracker> {
        &self.tracker
    }

    pub fn migration_timeout(&self) -> Duration {
        self.migration_timeout
    }

    pub fn settings(&self) -> Option<BrokerSettings> {
        self.link.read().as_ref().map(|link| link.settings.clone())
    }

    pub fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.link.read().as_ref().map(|link| Arc::clone(&link.connection))
    }

    pub fn is_migrating(&self) -> bool {
        self.migrating.load(Ordering::SeqCst)
    }

    /// Claims the migration guard. `false` if another migration holds it.
    pub(crate) fn try_begin_migration(&self) -> bool {
        self.migrating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn end_migration(&self) {
        self.migrating.store(false, Ordering::SeqCst);
    }

    fn events(&self) -> Arc<dyn ConnectionEvents> {
        Arc::new(DeviceEvents {
            device: self.this.clone(),
        })
    }

    /// Opens the device session on `settings` and makes it the live link.
    /// Returns the link it displaced, which the caller disconnects.
    pub async fn connect(&self, settings: BrokerSettings) -> Result<Option<Link>, TransportError> {
        info!("device {} connecting to {}", self.id, settings.uri());
        let client_id = format!("{}_CLIENT", self.id);
        let connection = self
            .transport
            .connect(&settings, &client_id, self.events())
            .await?;

        let topic = topics::device(&self.id);
        if let Err(e) = connection.subscribe(&topic, QoS::ExactlyOnce) {
            connection.disconnect();
            return Err(e);
        }
        info!("device {} subscribed to {}", self.id, topic);

        for sensor in &self.sensors {
            sensor.bind(Arc::clone(&connection));
        }
        self.tracker.set_broker(settings.uri());

        Ok(self.link.write().replace(Link {
            settings,
            connection,
        }))
    }

    /// Swaps the live link to `settings`. The old link is only dropped once
    /// the new one is up; on failure the device falls back to it. Clears
    /// the migration guard.
    pub async fn update_broker_settings(
        &self,
        settings: BrokerSettings,
    ) -> Result<(), TransportError> {
        let uri = settings.uri();
        info!("device {} switching broker to {}", self.id, uri);

        let paused: Vec<&Sensor> = self
            .sensors
            .iter()
            .filter(|sensor| sensor.state() == FlowState::Running)
            .collect();
        for sensor in &paused {
            sensor.pause();
        }

        let previous = self.link.read().clone();
        let result = match self.connect(settings).await {
            Ok(displaced) => {
                if let Some(old) = displaced {
                    info!("device {} leaving broker {}", self.id, old.settings.uri());
                    old.connection.disconnect();
                }
                info!("device {} now on broker {}", self.id, uri);
                Ok(())
            }
            Err(e) => {
                error!("device {} could not switch to {}: {}", self.id, uri, e);
                self.recover(previous).await;
                Err(e)
            }
        };

        for sensor in paused {
            if !sensor.resume() {
                info!(
                    "sensor {} changed flow during the switch, left {:?}",
                    sensor.id(),
                    sensor.state()
                );
            }
        }
        self.end_migration();
        result
    }

    async fn recover(&self, previous: Option<Link>) {
        let Some(previous) = previous else {
            error!("critical: device {} has no broker connection", self.id);
            return;
        };
        if previous.connection.is_connected() {
            warn!(
                "device {} stays on broker {}",
                self.id,
                previous.settings.uri()
            );
            return;
        }

        let uri = previous.settings.uri();
        match self.connect(previous.settings).await {
            Ok(displaced) => {
                if let Some(stale) = displaced {
                    stale.connection.disconnect();
                }
                info!("device {} reconnected to {}", self.id, uri);
            }
            Err(e) => error!(
                "critical: device {} could not reconnect to {}, left without a broker connection: {}",
                self.id, uri, e
            ),
        }
    }

    /// Stops every sensor and closes the live link.
    pub fn shutdown(&self) {
        for sensor in &self.sensors {
            sensor.stop();
        }
        if let Some(link) = self.link.write().take() {
            link.connection.disconnect();
        }
        info!("device {} shut down", self.id);
    }

    pub fn handle_message(&self, topic: &str, payload: &[u8]) {
        let raw = String::from_utf8_lossy(payload);
        debug!("device {} received on {}: {}", self.id, topic, raw);

        let message = match TatuMessage::decode(&raw) {
            Ok(message) => message,
            Err(e) => {
                warn!("device {} dropped message on {}: {}", self.id, topic, e);
                return;
            }
        };

        match message.method {
            Method::Get => self.handle_get(&message),
            Method::Flow => self.handle_flow(&message),
            Method::Set => self.handle_set(&message),
            Method::Invalid => warn!("device {} got an invalid TATU message: {}", self.id, raw),
            other => info!("device {} ignores {} messages", self.id, other),
        }
    }

    fn handle_get(&self, message: &TatuMessage) {
        let sensor = self.flow_control(&message.target);
        if sensor.is_null() {
            warn!("GET for unknown sensor {}", message.target);
            return;
        }
        let Some(connection) = self.connection() else {
            warn!("device {} cannot answer GET without a connection", self.id);
            return;
        };

        let response = build_get_response(&self.id, sensor.id(), sensor.current_value());
        let topic = topics::device_response(&self.id);
        if let Err(e) = connection.publish(&topic, response.as_bytes(), QoS::AtLeastOnce) {
            error!("GET response for {} not sent: {}", message.target, e);
        }
    }

    fn handle_flow(&self, message: &TatuMessage) {
        let sensor = self.flow_control(&message.target);
        if sensor.is_null() {
            warn!("FLOW for unknown sensor {}", message.target);
            return;
        }
        let Some(flow) = message.content_json() else {
            error!("invalid FLOW payload for {}: {}", message.target, message.content);
            return;
        };

        let collect = integer_field(&flow, "collect").unwrap_or(0);
        let publish = integer_field(&flow, "publish").unwrap_or(0);
        if collect <= 0 || publish <= 0 {
            sensor.stop();
        } else {
            sensor.start(Some(collect), Some(publish));
        }
    }

    fn handle_set(&self, message: &TatuMessage) {
        if message.target != SET_BROKER_TARGET {
            warn!("SET for unsupported target {}", message.target);
            return;
        }
        if self.is_migrating() {
            warn!("device {} is already migrating, SET ignored", self.id);
            return;
        }
        let Some(broker) = message.content_json() else {
            error!("invalid SET {} payload: {}", SET_BROKER_TARGET, message.content);
            return;
        };

        let mut builder = BrokerSettings::builder().device_id(self.id.as_str());
        if let Some(url) = string_field(&broker, "url") {
            builder = builder.host(url);
        }
        if let Some(port) = string_field(&broker, "port") {
            builder = builder.port(port);
        }
        if let Some(user) = string_field(&broker, "user") {
            builder = builder.username(user);
        }
        if let Some(password) = string_field(&broker, "password") {
            builder = builder.password(password);
        }
        let settings = match builder.build() {
            Ok(settings) => settings,
            Err(e) => {
                error!("SET {} rejected: {}", SET_BROKER_TARGET, e);
                return;
            }
        };

        let Some(device) = self.this.upgrade() else {
            return;
        };
        let timeout = self.migration_timeout;
        tokio::spawn(async move {
            let uri = settings.uri();
            match migration::start(&device, settings, timeout, false).await {
                Ok(outcome) => info!("migration to {} finished: {:?}", uri, outcome),
                Err(e) => error!("migration to {} failed: {}", uri, e),
            }
        });
    }
}

/// Accepts numbers and numeric strings.
fn integer_field(object: &Map<String, Value>, key: &str) -> Option<i64> {
    match object.get(key)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Strings as-is, numbers in their JSON form.
fn string_field(object: &Map<String, Value>, key: &str) -> Option<String> {
    match object.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

struct DeviceEvents {
    device: Weak<Device>,
}

impl ConnectionEvents for DeviceEvents {
    fn on_connected(&self) {
        if let Some(device) = self.device.upgrade() {
            debug!("device {} session established", device.id);
        }
    }

    fn on_message(&self, topic: &str, payload: &[u8]) {
        if let Some(device) = self.device.upgrade() {
            device.handle_message(topic, payload);
        }
    }

    fn on_delivered(&self, token: DeliveryToken) {
        if let Some(device) = self.device.upgrade() {
            device.tracker.acknowledge(token);
        }
    }

    fn on_disconnected(&self, reason: &str) {
        if let Some(device) = self.device.upgrade() {
            warn!("device {} lost its broker session: {}", device.id, reason);
        }
    }
}
