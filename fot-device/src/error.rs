//! Error types for the virtual device.
//!
//! One enum per concern so callers can tell a malformed inbound message from a
//! broker failure or a bad configuration value. `DeviceError` aggregates the
//! ones the orchestrator and the migration state machine can surface.

use thiserror::Error;

use crate::tatu::Method;

/// A TATU message had a valid method but lacked the part that addresses it.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{method} request has no target token: {raw:?}")]
    MissingTarget { method: Method, raw: String },

    #[error("{method} response BODY has no sensor key")]
    MissingBodyKey { method: Method },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection to {uri} failed: {reason}")]
    Connect { uri: String, reason: String },

    #[error("publish on {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("client is not connected")]
    NotConnected,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("sensor {id} ({sensor_type}) has min value {min} greater than max value {max}")]
pub struct ValidationError {
    pub id: String,
    pub sensor_type: String,
    pub min: i64,
    pub max: i64,
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("file sink I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http sink error: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },

    #[error("invalid broker port {0:?}")]
    InvalidPort(String),

    #[error("cannot read sensor catalogue {path}: {source}")]
    SensorFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid sensor catalogue {path}: {source}")]
    SensorCatalogue {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("broker {uri} did not answer the CONNECT handshake within {timeout_ms} ms")]
    HandshakeTimedOut { uri: String, timeout_ms: u64 },

    #[error("broker {uri} rejected the device")]
    HandshakeRejected { uri: String },

    #[error("device {0} is already migrating")]
    MigrationInProgress(String),
}
