//! Round-trip latency instrumentation.
//!
//! Every tracked publish is remembered under its delivery token until the
//! broker acknowledges it; the elapsed time becomes a [`LatencyRecord`] fed to
//! each latency sink.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Local;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, warn};

use crate::error::TransportError;
use crate::model::LatencyRecord;
use crate::sink::BatchHandle;
use crate::transport::{Connection, DeliveryToken, QoS};

pub const DEFAULT_FLIGHT_TTL: Duration = Duration::from_secs(60);

/// Experiment metadata stamped on every latency record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LatencyContext {
    pub device_id: String,
    pub experiment: i64,
    pub exp_type: i64,
    pub level: i64,
}

#[derive(Debug)]
struct FlightRecord {
    sensor_id: String,
    message: String,
    sent_at: Instant,
}

pub struct RttTracker {
    context: LatencyContext,
    ttl: Duration,
    broker: RwLock<String>,
    in_flight: Mutex<HashMap<DeliveryToken, FlightRecord>>,
    sinks: Vec<BatchHandle<LatencyRecord>>,
}

impl RttTracker {
    pub fn new(context: LatencyContext, sinks: Vec<BatchHandle<LatencyRecord>>) -> Self {
        Self {
            context,
            ttl: DEFAULT_FLIGHT_TTL,
            broker: RwLock::new(String::new()),
            in_flight: Mutex::new(HashMap::new()),
            sinks,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Broker `host:port` recorded on subsequent latency records.
    pub fn set_broker(&self, uri: impl Into<String>) {
        *self.broker.write() = uri.into();
    }

    pub fn broker(&self) -> String {
        self.broker.read().clone()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Publishes `payload` and starts timing it. Failed publishes are not
    /// tracked.
    pub fn publish_and_track(
        &self,
        connection: &dyn Connection,
        topic: &str,
        sensor_id: &str,
        payload: &str,
        qos: QoS,
    ) -> Result<DeliveryToken, TransportError> {
        let mut in_flight = self.in_flight.lock();
        self.evict_expired(&mut in_flight);

        // Held across publish: an acknowledgement racing the insert waits for it.
        let sent_at = Instant::now();
        let token = connection
            .publish(topic, payload.as_bytes(), qos)
            .inspect_err(|e| error!("publish for sensor {} failed: {}", sensor_id, e))?;

        in_flight.insert(
            token,
            FlightRecord {
                sensor_id: sensor_id.to_string(),
                message: payload.to_string(),
                sent_at,
            },
        );
        Ok(token)
    }

    /// Closes the flight of `token`. Unknown tokens are ignored.
    pub fn acknowledge(&self, token: DeliveryToken) -> Option<LatencyRecord> {
        let Some(flight) = self.in_flight.lock().remove(&token) else {
            debug!("delivery token {} is not tracked", token);
            return None;
        };

        let record = LatencyRecord {
            device_id: self.context.device_id.clone(),
            sensor_id: flight.sensor_id,
            broker_ip: self.broker(),
            experiment: self.context.experiment,
            exp_type: self.context.exp_type,
            level: self.context.level,
            latency: flight.sent_at.elapsed().as_secs_f64() * 1000.0,
            message: flight.message,
            recorded_at: Local::now(),
        };
        for sink in &self.sinks {
            sink.submit(record.clone());
        }
        Some(record)
    }

    fn evict_expired(&self, in_flight: &mut HashMap<DeliveryToken, FlightRecord>) {
        let before = in_flight.len();
        in_flight.retain(|_, flight| flight.sent_at.elapsed() < self.ttl);
        let lost = before - in_flight.len();
        if lost > 0 {
            warn!("{} publishes never acknowledged within {:?}, dropped", lost, self.ttl);
        }
    }
}
