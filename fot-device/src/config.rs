//! Environment-driven configuration.
//!
//! Handles:
//! - device identity and the initial broker (`DeviceConfig`)
//! - experiment metadata and the latency API (`ExperimentConfig`)
//! - runtime switches: handshake timeout, sensor catalogue, output files
//!
//! Every loader takes a lookup function so tests never touch the process
//! environment; the `from_env` variants read `std::env` after `.env` has
//! been applied by `dotenvy`.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use tracing::info;

use crate::error::ConfigError;
use crate::model::{BrokerSettings, SensorSpec};

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn string_or<F>(lookup: &F, key: &str, default: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).unwrap_or_else(|| default.to_string())
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw,
        }),
    }
}

/// Accepts `true/false`, `1/0`, `yes/no`, `on/off`.
fn flag_or<F>(lookup: &F, key: &str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw,
        }),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub device_id: String,
    pub broker_ip: String,
    pub port: String,
    pub username: String,
    pub password: String,
    pub exp_num: i64,
}

impl DeviceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = Self {
            device_id: lookup("DEVICE_ID").unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            broker_ip: string_or(&lookup, "BROKER_IP", "localhost"),
            port: string_or(&lookup, "PORT", "1883"),
            username: string_or(&lookup, "USERNAME", "karaf"),
            password: string_or(&lookup, "PASSWORD", "karaf"),
            exp_num: parse_or(&lookup, "EXP_NUM", 0)?,
        };
        info!(
            "device config: id={} broker={}:{} exp={}",
            config.device_id, config.broker_ip, config.port, config.exp_num
        );
        Ok(config)
    }

    /// Settings for the first broker the device joins.
    pub fn broker_settings(&self) -> Result<BrokerSettings, ConfigError> {
        BrokerSettings::builder()
            .device_id(self.device_id.as_str())
            .host(self.broker_ip.as_str())
            .port(self.port.as_str())
            .username(self.username.as_str())
            .password(self.password.as_str())
            .build()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentConfig {
    pub api_url: String,
    pub buffer_size: usize,
    pub exp_num: i64,
    pub exp_type: i64,
    pub exp_level: i64,
}

impl ExperimentConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = Self {
            api_url: string_or(
                &lookup,
                "API_URL",
                "http://localhost:8080/api/latency-records/records",
            ),
            buffer_size: parse_or(&lookup, "BUFFER_SIZE", crate::sink::DEFAULT_BATCH_SIZE)?,
            exp_num: parse_or(&lookup, "EXP_NUM", 0)?,
            exp_type: parse_or(&lookup, "EXP_TYPE", 0)?,
            exp_level: parse_or(&lookup, "EXP_LEVEL", 0)?,
        };
        info!("experiment config: {:?}", config);
        Ok(config)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeOptions {
    pub handshake_timeout: Duration,
    pub sensors_file: PathBuf,
    pub exp_dir: PathBuf,
    pub message_log: bool,
    pub latency_log: bool,
    pub latency_api: bool,
}

impl RuntimeOptions {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            handshake_timeout: Duration::from_millis(parse_or(&lookup, "TIMEOUT", 10_000u64)?),
            sensors_file: string_or(&lookup, "SENSORS_FILE", "sensors.json").into(),
            exp_dir: string_or(&lookup, "EXP_DIR", "exp").into(),
            message_log: flag_or(&lookup, "MESSAGE_LOG", true)?,
            latency_log: flag_or(&lookup, "LATENCY_LOG", false)?,
            latency_api: flag_or(&lookup, "LATENCY_API", true)?,
        })
    }

    /// `<EXP_DIR>/<device>_ml.csv`
    pub fn message_log_path(&self, device_id: &str) -> PathBuf {
        self.exp_dir.join(format!("{device_id}_ml.csv"))
    }

    /// `<EXP_DIR>/<device>_<exp>_ll.csv`
    pub fn latency_log_path(&self, device_id: &str, exp_num: i64) -> PathBuf {
        self.exp_dir.join(format!("{device_id}_{exp_num}_ll.csv"))
    }
}

/// Reads the JSON array of sensors. Every entry is validated.
pub async fn load_sensors(path: &Path) -> Result<Vec<SensorSpec>, ConfigError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::SensorFile {
            path: path.display().to_string(),
            source,
        })?;
    let sensors: Vec<SensorSpec> =
        serde_json::from_str(&text).map_err(|source| ConfigError::SensorCatalogue {
            path: path.display().to_string(),
            source,
        })?;
    info!("loaded {} sensors from {}", sensors.len(), path.display());
    Ok(sensors)
}
