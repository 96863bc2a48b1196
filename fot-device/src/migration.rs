//! Broker migration handshake.
//!
//! Before switching brokers the device opens a throwaway `<id>_CLIENT_UPDATE`
//! session on the candidate broker, announces itself with CONNECT on
//! `dev/CONNECTIONS` and waits for the gateway's CONNACK on
//! `dev/CONNECTIONS/RES`. Only an accepting CONNACK commits the switch.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::device::Device;
use crate::error::{DeviceError, TransportError};
use crate::model::BrokerSettings;
use crate::tatu::{build_connect, topics, Method, TatuMessage};
use crate::transport::{Connection, ConnectionEvents, QoS};

const UNKNOWN_HOST: &str = "UNKNOWN_HOST";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// The device now lives on the new broker.
    Committed,
    Rejected,
    TimedOut,
    /// Another migration was in progress; nothing was attempted.
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Accepted,
    Rejected,
    TimedOut,
}

/// Forwards everything the handshake client receives.
struct HandshakeEvents {
    tx: mpsc::UnboundedSender<String>,
}

impl ConnectionEvents for HandshakeEvents {
    fn on_message(&self, topic: &str, payload: &[u8]) {
        debug!("handshake client received on {}", topic);
        let _ = self.tx.send(String::from_utf8_lossy(payload).into_owned());
    }
}

/// Runs one migration attempt to `settings`.
///
/// A rejected or timed-out handshake leaves the live link untouched. On the
/// initial attempt the device has no link to fall back on, so those become
/// errors.
pub async fn start(
    device: &Arc<Device>,
    settings: BrokerSettings,
    timeout: Duration,
    is_initial: bool,
) -> Result<MigrationOutcome, DeviceError> {
    if !device.try_begin_migration() {
        warn!("device {} is already migrating", device.id());
        if is_initial {
            return Err(DeviceError::MigrationInProgress(device.id().to_string()));
        }
        return Ok(MigrationOutcome::Busy);
    }

    let uri = settings.uri();
    info!("device {} starting migration to {}", device.id(), uri);

    let verdict = match handshake(device, &settings, timeout).await {
        Ok(verdict) => verdict,
        Err(e) => {
            error!("handshake with {} failed: {}", uri, e);
            device.end_migration();
            return Err(e.into());
        }
    };

    match verdict {
        Verdict::Accepted => {
            info!("broker {} accepted device {}", uri, device.id());
            device.update_broker_settings(settings).await?;
            Ok(MigrationOutcome::Committed)
        }
        Verdict::Rejected => {
            warn!("broker {} rejected device {}", uri, device.id());
            device.end_migration();
            if is_initial {
                return Err(DeviceError::HandshakeRejected { uri });
            }
            Ok(MigrationOutcome::Rejected)
        }
        Verdict::TimedOut => {
            warn!("no CONNACK from {} within {:?}", uri, timeout);
            device.end_migration();
            if is_initial {
                error!("critical: initial handshake with {} timed out", uri);
                return Err(DeviceError::HandshakeTimedOut {
                    uri,
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            Ok(MigrationOutcome::TimedOut)
        }
    }
}

async fn handshake(
    device: &Device,
    settings: &BrokerSettings,
    timeout: Duration,
) -> Result<Verdict, TransportError> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let client_id = format!("{}_CLIENT_UPDATE", device.id());
    let connection = device
        .transport()
        .connect(settings, &client_id, Arc::new(HandshakeEvents { tx }))
        .await?;
    info!("handshake client connected to {}", settings.uri());

    let verdict = exchange(device, connection.as_ref(), &mut rx, timeout).await;
    connection.disconnect();
    verdict
}

async fn exchange(
    device: &Device,
    connection: &dyn Connection,
    rx: &mut mpsc::UnboundedReceiver<String>,
    timeout: Duration,
) -> Result<Verdict, TransportError> {
    connection.subscribe(&topics::connections_response(), QoS::AtLeastOnce)?;

    let source_ip = local_ip_address::local_ip()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|_| UNKNOWN_HOST.to_string());
    let connect = build_connect(
        &device.descriptor(),
        Some(&source_ip),
        Some(timeout.as_millis() as u64),
    );
    connection.publish(&topics::connections(), connect.as_bytes(), QoS::AtLeastOnce)?;
    debug!("CONNECT published for device {}", device.id());

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => return Ok(Verdict::TimedOut),
            received = rx.recv() => match received {
                Some(payload) => {
                    if let Some(verdict) = connack_verdict(&payload) {
                        return Ok(verdict);
                    }
                }
                None => return Ok(Verdict::TimedOut),
            },
        }
    }
}

/// `None` for anything that is not a CONNACK.
fn connack_verdict(payload: &str) -> Option<Verdict> {
    let message = match TatuMessage::decode(payload) {
        Ok(message) if message.method == Method::Connack => message,
        _ => {
            warn!("handshake ignored a non-CONNACK message");
            return None;
        }
    };

    let accepted = message
        .content_json()
        .and_then(|json| json.get("BODY")?.get("CAN_CONNECT")?.as_bool())
        .unwrap_or(false);
    Some(if accepted {
        Verdict::Accepted
    } else {
        Verdict::Rejected
    })
}
