//! Virtual FoT Device - simulated TATU sensor node
//!
//! Wires the device together:
//! - configuration from the environment (and `.env`)
//! - message-log and latency sinks
//! - rumqttc transport, then the initial broker handshake
//!
//! Sensors stay idle until a FLOW command arrives.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fot_device::config::{self, DeviceConfig, ExperimentConfig, RuntimeOptions};
use fot_device::rtt::{LatencyContext, RttTracker};
use fot_device::sink::{BatchWriter, FileLineSink, HttpJsonSink};
use fot_device::transport::MqttTransport;
use fot_device::{migration, DataRecord, Device, LatencyRecord};

const WRITER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Persistence workers owned by the binary.
struct Writers {
    message_log: Option<BatchWriter<DataRecord>>,
    latency: Vec<BatchWriter<LatencyRecord>>,
}

impl Writers {
    fn build(
        device: &DeviceConfig,
        experiment: &ExperimentConfig,
        options: &RuntimeOptions,
    ) -> Self {
        let message_log = options.message_log.then(|| {
            let path = options.message_log_path(&device.device_id);
            info!("message log: {}", path.display());
            BatchWriter::new("message-log", FileLineSink::new(path), experiment.buffer_size)
        });

        let mut latency = Vec::new();
        if options.latency_log {
            let path = options.latency_log_path(&device.device_id, experiment.exp_num);
            info!("latency log: {}", path.display());
            latency.push(BatchWriter::new(
                "latency-log",
                FileLineSink::new(path),
                experiment.buffer_size,
            ));
        }
        if options.latency_api {
            info!("latency API: {}", experiment.api_url);
            latency.push(BatchWriter::new(
                "latency-api",
                HttpJsonSink::new(experiment.api_url.as_str()),
                experiment.buffer_size,
            ));
        }

        Self {
            message_log,
            latency,
        }
    }

    fn start(&self) {
        if let Some(writer) = &self.message_log {
            writer.start();
        }
        for writer in &self.latency {
            writer.start();
        }
    }

    async fn stop(&self) {
        if let Some(writer) = &self.message_log {
            writer.stop(WRITER_STOP_TIMEOUT).await;
        }
        for writer in &self.latency {
            writer.stop(WRITER_STOP_TIMEOUT).await;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Fine if .env is missing

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fot_device=info")),
        )
        .init();

    info!("Virtual FoT Device starting...");

    let device_config = DeviceConfig::from_env().context("Invalid device configuration")?;
    let experiment = ExperimentConfig::from_env().context("Invalid experiment configuration")?;
    let options = RuntimeOptions::from_env().context("Invalid runtime options")?;

    let sensors = config::load_sensors(&options.sensors_file)
        .await
        .context("Failed to load sensor catalogue")?;
    if sensors.is_empty() {
        bail!("no sensors in {}", options.sensors_file.display());
    }

    let writers = Writers::build(&device_config, &experiment, &options);
    writers.start();

    let tracker = Arc::new(RttTracker::new(
        LatencyContext {
            device_id: device_config.device_id.clone(),
            experiment: experiment.exp_num,
            exp_type: experiment.exp_type,
            level: experiment.exp_level,
        },
        writers.latency.iter().map(BatchWriter::handle).collect(),
    ));

    let device = Device::new(
        device_config.device_id.as_str(),
        sensors,
        Arc::new(MqttTransport::new(options.handshake_timeout)),
        tracker,
        writers.message_log.as_ref().map(BatchWriter::handle),
        options.handshake_timeout,
    );

    let initial = device_config
        .broker_settings()
        .context("Invalid initial broker settings")?;
    info!("initial broker: {}", initial.uri());

    if let Err(e) = migration::start(&device, initial, options.handshake_timeout, true).await {
        writers.stop().await;
        return Err(e).context("Initial broker handshake failed");
    }

    info!("device {} ready, waiting for commands", device.id());
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("cannot listen for shutdown signal: {}", e);
    }

    info!("shutting down...");
    device.shutdown();
    writers.stop().await;
    info!("Virtual FoT Device stopped");
    Ok(())
}
