//! Plain values shared across the device: sensor specifications, broker
//! settings and the records handed to the persistence sinks.

mod broker;
mod record;
mod sensor;

pub use broker::{BrokerSettings, BrokerSettingsBuilder, Credentials};
pub use record::{DataRecord, LatencyRecord};
pub use sensor::SensorSpec;
