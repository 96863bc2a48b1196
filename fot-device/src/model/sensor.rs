use serde::Deserialize;

use crate::error::ValidationError;

/// Immutable description of a simulated sensor.
///
/// Deserialises from a `sensors.json` entry and runs the same `min <= max`
/// check as [`SensorSpec::new`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "CatalogueEntry")]
pub struct SensorSpec {
    pub id: String,
    pub sensor_type: String,
    pub collection_interval_ms: i64,
    pub publish_interval_ms: i64,
    pub min_value: i64,
    pub max_value: i64,
    pub delta: i64,
}

impl SensorSpec {
    pub fn new(
        id: impl Into<String>,
        sensor_type: impl Into<String>,
        collection_interval_ms: i64,
        publish_interval_ms: i64,
        min_value: i64,
        max_value: i64,
        delta: i64,
    ) -> Result<Self, ValidationError> {
        let id = id.into();
        let sensor_type = sensor_type.into();
        if min_value > max_value {
            return Err(ValidationError {
                id,
                sensor_type,
                min: min_value,
                max: max_value,
            });
        }
        Ok(Self {
            id,
            sensor_type,
            collection_interval_ms,
            publish_interval_ms,
            min_value,
            max_value,
            delta,
        })
    }
}

/// On-disk shape of a catalogue entry.
#[derive(Debug, Deserialize)]
struct CatalogueEntry {
    #[serde(default = "invalid_sensor")]
    id: String,
    #[serde(rename = "type", default = "invalid_sensor")]
    sensor_type: String,
    #[serde(default)]
    collection_time: i64,
    #[serde(default)]
    publishing_time: i64,
    #[serde(default = "default_min")]
    min_value: i64,
    #[serde(default = "default_max")]
    max_value: i64,
    #[serde(default = "default_delta")]
    delta: i64,
}

fn invalid_sensor() -> String {
    "INVALID_SENSOR".to_string()
}

fn default_min() -> i64 {
    10
}

fn default_max() -> i64 {
    30
}

fn default_delta() -> i64 {
    1
}

impl TryFrom<CatalogueEntry> for SensorSpec {
    type Error = ValidationError;

    fn try_from(entry: CatalogueEntry) -> Result<Self, Self::Error> {
        SensorSpec::new(
            entry.id,
            entry.sensor_type,
            entry.collection_time,
            entry.publishing_time,
            entry.min_value,
            entry.max_value,
            entry.delta,
        )
    }
}
