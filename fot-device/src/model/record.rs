use std::fmt;

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::tatu::timestamp_ms;

/// One published window, persisted to the message log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRecord {
    pub timestamp_ms: i64,
    pub device_id: String,
    pub sensor_id: String,
    pub values: Vec<i64>,
}

impl DataRecord {
    pub fn new(device_id: impl Into<String>, sensor_id: impl Into<String>, values: Vec<i64>) -> Self {
        Self {
            timestamp_ms: timestamp_ms(),
            device_id: device_id.into(),
            sensor_id: sensor_id.into(),
            values,
        }
    }
}

/// `<timestampMs>,<deviceId>,<sensorId>,<v1>,<v2>,...`
impl fmt::Display for DataRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.timestamp_ms, self.device_id, self.sensor_id)?;
        for value in &self.values {
            write!(f, ",{value}")?;
        }
        Ok(())
    }
}

/// Round-trip latency of one acknowledged publish.
#[derive(Debug, Clone, Serialize)]
pub struct LatencyRecord {
    #[serde(rename = "deviceID")]
    pub device_id: String,
    #[serde(rename = "sensorId")]
    pub sensor_id: String,
    #[serde(rename = "brokerIp")]
    pub broker_ip: String,
    pub experiment: i64,
    #[serde(rename = "type")]
    pub exp_type: i64,
    pub level: i64,
    /// Milliseconds.
    pub latency: f64,
    pub message: String,
    #[serde(skip)]
    pub recorded_at: DateTime<Local>,
}

/// Latency CSV line: `<HH:MM:SS.mmm>,<latency>`
impl fmt::Display for LatencyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{:.3}",
            self.recorded_at.format("%H:%M:%S%.3f"),
            self.latency
        )
    }
}
