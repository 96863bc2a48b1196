//! Virtual FoT device.
//!
//! Simulates a sensor-equipped IoT device speaking the TATU protocol over
//! MQTT, with live broker migration and round-trip latency instrumentation.

pub mod config;
pub mod device;
pub mod error;
pub mod migration;
pub mod model;
pub mod rtt;
pub mod sensor;
pub mod sink;
pub mod tatu;
pub mod transport;

pub use device::{Device, Link};
pub use error::{ConfigError, DecodeError, DeviceError, SinkError, TransportError, ValidationError};
pub use migration::MigrationOutcome;
pub use model::{BrokerSettings, DataRecord, LatencyRecord, SensorSpec};
pub use sensor::{FlowControl, FlowState, NullSensor, Sensor};
