//! Scripted counterparts for the device: a gateway that answers CONNECT
//! handshakes and a builder for the commands a controller would send.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use fot_device::tatu::{build_connack, topics, Method, TatuMessage};
use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinHandle;

use crate::mqtt_stub::MockNetwork;

/// How the gateway answers a CONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayPolicy {
    Accept,
    Reject,
    /// Never answers, so the handshake runs into its timeout.
    Silent,
}

/// Listens on `dev/CONNECTIONS` of one broker and replies with CONNACK on
/// `dev/CONNECTIONS/RES`. Stops when dropped.
pub struct FakeGateway {
    connects: Arc<AtomicUsize>,
    last_connect: Arc<Mutex<Option<serde_json::Value>>>,
    task: JoinHandle<()>,
}

impl FakeGateway {
    pub fn spawn(network: &MockNetwork, uri: &str, policy: GatewayPolicy) -> Self {
        let mut requests = network.observe(uri, &topics::connections());
        let connects = Arc::new(AtomicUsize::new(0));
        let last_connect = Arc::new(Mutex::new(None));

        let task = {
            let network = network.clone();
            let uri = uri.to_string();
            let connects = Arc::clone(&connects);
            let last_connect = Arc::clone(&last_connect);
            tokio::spawn(async move {
                while let Some(request) = requests.recv().await {
                    let message = match TatuMessage::decode(&request.text()) {
                        Ok(message) if message.method == Method::Connect => message,
                        _ => continue,
                    };
                    let Some(body) = message.content_json() else {
                        continue;
                    };
                    let name = body["HEADER"]["NAME"].as_str().unwrap_or_default().to_string();
                    connects.fetch_add(1, Ordering::SeqCst);
                    *last_connect.lock() = Some(serde_json::Value::Object(body));
                    tracing::debug!("[gateway] {} sent CONNECT to {}", name, uri);

                    let accepted = match policy {
                        GatewayPolicy::Accept => true,
                        GatewayPolicy::Reject => false,
                        GatewayPolicy::Silent => continue,
                    };
                    network.inject(
                        &uri,
                        &topics::connections_response(),
                        build_connack(&name, &name, accepted),
                    );
                }
            })
        };

        Self {
            connects,
            last_connect,
            task,
        }
    }

    /// CONNECT requests seen so far.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// JSON body of the most recent CONNECT.
    pub fn last_connect(&self) -> Option<serde_json::Value> {
        self.last_connect.lock().clone()
    }
}

impl Drop for FakeGateway {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Raw TATU commands as a controller publishes them on `dev/<id>`.
pub struct TatuCommand;

impl TatuCommand {
    pub fn get(sensor: &str) -> String {
        format!("GET VALUE {sensor}")
    }

    pub fn flow(sensor: &str, collect_ms: i64, publish_ms: i64) -> String {
        format!(
            "FLOW VALUE {sensor} {}",
            json!({ "collect": collect_ms, "publish": publish_ms })
        )
    }

    pub fn stop_flow(sensor: &str) -> String {
        Self::flow(sensor, 0, 0)
    }

    /// `SET VALUE brokerMqtt` pointing at `host:port`.
    pub fn set_broker(host: &str, port: u16, user: &str, password: &str) -> String {
        format!(
            "SET VALUE brokerMqtt {}",
            json!({
                "url": host,
                "port": port.to_string(),
                "user": user,
                "password": password,
            })
        )
    }
}
