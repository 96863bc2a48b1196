use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{next_delivery_token, Connection, ConnectionEvents, DeliveryToken, Transport};
use crate::error::TransportError;
use crate::model::BrokerSettings;

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const REQUEST_CAPACITY: usize = 100;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// rumqttc-backed transport.
#[derive(Debug, Clone)]
pub struct MqttTransport {
    connect_timeout: Duration,
}

impl MqttTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for MqttTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

/// Maps MQTT packet ids to delivery tokens.
///
/// Publishes leave the event loop in request order, so the n-th outgoing
/// QoS>0 publish takes the n-th queued token. Packet ids are reused by the
/// client, a pkid is bound to a token only while its acknowledgement is
/// pending and is removed when the acknowledgement is taken.
#[derive(Debug, Default)]
struct TokenLedger {
    unassigned: VecDeque<DeliveryToken>,
    by_pkid: HashMap<u16, DeliveryToken>,
}

impl TokenLedger {
    fn queued(&mut self, token: DeliveryToken) {
        self.unassigned.push_back(token);
    }

    fn sent(&mut self, pkid: u16) {
        // A retransmission keeps its original token.
        if pkid == 0 || self.by_pkid.contains_key(&pkid) {
            return;
        }
        if let Some(token) = self.unassigned.pop_front() {
            self.by_pkid.insert(pkid, token);
        }
    }

    fn acknowledged(&mut self, pkid: u16) -> Option<DeliveryToken> {
        self.by_pkid.remove(&pkid)
    }
}

struct Session {
    client: AsyncClient,
    uri: String,
    ledger: Mutex<TokenLedger>,
    subscriptions: Mutex<Vec<(String, QoS)>>,
    connected: AtomicBool,
    closing: AtomicBool,
}

pub struct MqttConnection {
    session: Arc<Session>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(
        &self,
        settings: &BrokerSettings,
        client_id: &str,
        events: Arc<dyn ConnectionEvents>,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        let uri = settings.uri();
        let mut options = MqttOptions::new(client_id, settings.host(), settings.port());
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);
        if let Some(credentials) = settings.credentials() {
            options.set_credentials(credentials.username.clone(), credentials.password.clone());
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let session = Arc::new(Session {
            client,
            uri: uri.clone(),
            ledger: Mutex::new(TokenLedger::default()),
            subscriptions: Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
            closing: AtomicBool::new(false),
        });

        let (accepted_tx, accepted_rx) = oneshot::channel();
        let task = tokio::spawn(run_event_loop(
            eventloop,
            Arc::clone(&session),
            events,
            accepted_tx,
        ));

        let reason = match tokio::time::timeout(self.connect_timeout, accepted_rx).await {
            Ok(Ok(Ok(()))) => {
                info!("MQTT client {} connected to {}", client_id, uri);
                return Ok(Arc::new(MqttConnection {
                    session,
                    task: Mutex::new(Some(task)),
                }));
            }
            Ok(Ok(Err(reason))) => reason,
            Ok(Err(_)) => "event loop ended before CONNACK".to_string(),
            Err(_) => format!("no CONNACK within {:?}", self.connect_timeout),
        };

        session.closing.store(true, Ordering::SeqCst);
        task.abort();
        Err(TransportError::Connect { uri, reason })
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    session: Arc<Session>,
    events: Arc<dyn ConnectionEvents>,
    accepted: oneshot::Sender<Result<(), String>>,
) {
    let mut accepted = Some(accepted);
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    session.connected.store(true, Ordering::SeqCst);
                    match accepted.take() {
                        Some(tx) => {
                            let _ = tx.send(Ok(()));
                        }
                        None => session.resubscribe(),
                    }
                    events.on_connected();
                } else if let Some(tx) = accepted.take() {
                    let _ = tx.send(Err(format!("broker refused connection: {:?}", ack.code)));
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                events.on_message(&publish.topic, &publish.payload);
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                let token = session.ledger.lock().acknowledged(ack.pkid);
                if let Some(token) = token {
                    events.on_delivered(token);
                }
            }
            Ok(Event::Incoming(Packet::PubComp(comp))) => {
                let token = session.ledger.lock().acknowledged(comp.pkid);
                if let Some(token) = token {
                    events.on_delivered(token);
                }
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                session.ledger.lock().sent(pkid);
            }
            Ok(_) => {}
            Err(e) => {
                let was_connected = session.connected.swap(false, Ordering::SeqCst);
                if session.closing.load(Ordering::SeqCst) {
                    break;
                }
                if let Some(tx) = accepted.take() {
                    let _ = tx.send(Err(e.to_string()));
                    break;
                }
                if was_connected {
                    events.on_disconnected(&e.to_string());
                }
                warn!("MQTT connection error on {}: {}", session.uri, e);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
    debug!("MQTT event loop for {} stopped", session.uri);
}

impl Session {
    /// Clean sessions lose their subscriptions on reconnect.
    fn resubscribe(&self) {
        for (topic, qos) in self.subscriptions.lock().iter() {
            if let Err(e) = self.client.try_subscribe(topic.as_str(), *qos) {
                warn!("MQTT resubscribe to {} on {} failed: {}", topic, self.uri, e);
            }
        }
    }
}

impl Connection for MqttConnection {
    fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> Result<DeliveryToken, TransportError> {
        // Held across try_publish so tokens queue in request order.
        let mut ledger = self.session.ledger.lock();
        self.session
            .client
            .try_publish(topic, qos, false, payload.to_vec())
            .map_err(|e| TransportError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
        let token = next_delivery_token();
        if qos != QoS::AtMostOnce {
            ledger.queued(token);
        }
        Ok(token)
    }

    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        self.session
            .client
            .try_subscribe(topic, qos)
            .map_err(|e| TransportError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
        let mut subscriptions = self.session.subscriptions.lock();
        subscriptions.retain(|(existing, _)| existing != topic);
        subscriptions.push((topic.to_string(), qos));
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.session
            .client
            .try_unsubscribe(topic)
            .map_err(|e| TransportError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
        self.session
            .subscriptions
            .lock()
            .retain(|(existing, _)| existing != topic);
        Ok(())
    }

    fn disconnect(&self) {
        if self.session.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.session.client.try_disconnect() {
            debug!("MQTT disconnect from {} not queued: {}", self.session.uri, e);
        }
        self.session.connected.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.lock().take() {
            // Fallback for a broker that never closes the socket.
            tokio::spawn(async move {
                tokio::time::sleep(RECONNECT_DELAY).await;
                task.abort();
            });
        }
        info!("MQTT client disconnected from {}", self.session.uri);
    }

    fn is_connected(&self) -> bool {
        self.session.connected.load(Ordering::SeqCst)
    }
}
