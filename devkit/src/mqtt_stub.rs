/*!
In-memory MQTT network for tests without a broker.

A [`MockNetwork`] holds any number of named brokers (keyed by `host:port`).
[`MockTransport`] plugs into the device's `Transport` seam; every connection
gets its own event task so callbacks fire asynchronously and in order, like a
real client event loop. Tests can inject messages, watch topics, drop brokers
and hold back acknowledgements.
*/

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use fot_device::model::BrokerSettings;
use fot_device::transport::{
    next_delivery_token, Connection, ConnectionEvents, DeliveryToken, QoS, Transport,
};
use fot_device::TransportError;
use parking_lot::Mutex;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    /// Publishing client, empty for injected messages.
    pub client_id: String,
}

impl MockMessage {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.payload).ok()
    }
}

enum Inbox {
    Connected,
    Message { topic: String, payload: Vec<u8> },
    Delivered(DeliveryToken),
    Disconnected(String),
    Close,
}

struct Client {
    key: u64,
    client_id: String,
    subscriptions: Mutex<Vec<String>>,
    connected: AtomicBool,
    inbox: mpsc::UnboundedSender<Inbox>,
}

impl Client {
    fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions
            .lock()
            .iter()
            .any(|filter| topic_matches(filter, topic))
    }
}

struct Broker {
    reachable: bool,
    auto_ack: bool,
    clients: Vec<Arc<Client>>,
    published: Vec<MockMessage>,
    observers: Vec<(String, mpsc::UnboundedSender<MockMessage>)>,
    held_acks: Vec<(Arc<Client>, DeliveryToken)>,
}

impl Broker {
    fn new() -> Self {
        Self {
            reachable: true,
            auto_ack: true,
            clients: Vec::new(),
            published: Vec::new(),
            observers: Vec::new(),
            held_acks: Vec::new(),
        }
    }

    /// Records `message` and returns who must receive it. Delivery happens
    /// outside the network lock.
    fn route(&mut self, message: MockMessage) -> Vec<Delivery> {
        let mut deliveries: Vec<Delivery> = self
            .clients
            .iter()
            .filter(|client| client.is_subscribed(&message.topic))
            .map(|client| Delivery::Client(client.inbox.clone()))
            .collect();
        self.observers.retain(|(_, tx)| !tx.is_closed());
        deliveries.extend(
            self.observers
                .iter()
                .filter(|(filter, _)| topic_matches(filter, &message.topic))
                .map(|(_, tx)| Delivery::Observer(tx.clone())),
        );
        self.published.push(message);
        deliveries
    }
}

enum Delivery {
    Client(mpsc::UnboundedSender<Inbox>),
    Observer(mpsc::UnboundedSender<MockMessage>),
}

fn deliver(deliveries: Vec<Delivery>, message: &MockMessage) {
    for delivery in deliveries {
        match delivery {
            Delivery::Client(inbox) => {
                let _ = inbox.send(Inbox::Message {
                    topic: message.topic.clone(),
                    payload: message.payload.clone(),
                });
            }
            Delivery::Observer(tx) => {
                let _ = tx.send(message.clone());
            }
        }
    }
}

/// MQTT topic filter matching with `+` and `#`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut levels = topic.split('/');
    for part in filter.split('/') {
        match (part, levels.next()) {
            ("#", _) => return true,
            ("+", Some(_)) => {}
            (expected, Some(level)) if expected == level => {}
            _ => return false,
        }
    }
    levels.next().is_none()
}

/// Shared in-memory network of brokers.
#[derive(Clone, Default)]
pub struct MockNetwork {
    brokers: Arc<Mutex<HashMap<String, Broker>>>,
    next_key: Arc<AtomicU64>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a reachable, auto-acknowledging broker at `uri` (`host:port`).
    pub fn add_broker(&self, uri: &str) -> &Self {
        self.brokers.lock().insert(uri.to_string(), Broker::new());
        self
    }

    pub fn transport(&self) -> MockTransport {
        MockTransport {
            network: self.clone(),
        }
    }

    /// An unreachable broker refuses new sessions and drops existing ones.
    pub fn set_reachable(&self, uri: &str, reachable: bool) {
        let dropped = {
            let mut brokers = self.brokers.lock();
            let Some(broker) = brokers.get_mut(uri) else {
                return;
            };
            broker.reachable = reachable;
            if reachable {
                Vec::new()
            } else {
                std::mem::take(&mut broker.clients)
            }
        };
        for client in dropped {
            client.connected.store(false, Ordering::SeqCst);
            let _ = client
                .inbox
                .send(Inbox::Disconnected(format!("broker {uri} went away")));
        }
    }

    /// With auto-ack off, QoS 1/2 acknowledgements are held until
    /// [`MockNetwork::release_acks`].
    pub fn set_auto_ack(&self, uri: &str, auto_ack: bool) {
        if let Some(broker) = self.brokers.lock().get_mut(uri) {
            broker.auto_ack = auto_ack;
        }
    }

    pub fn release_acks(&self, uri: &str) -> usize {
        let held = match self.brokers.lock().get_mut(uri) {
            Some(broker) => std::mem::take(&mut broker.held_acks),
            None => return 0,
        };
        let released = held.len();
        for (client, token) in held {
            let _ = client.inbox.send(Inbox::Delivered(token));
        }
        released
    }

    /// Publishes from outside any client session.
    pub fn inject(&self, uri: &str, topic: &str, payload: impl Into<Vec<u8>>) {
        let message = MockMessage {
            topic: topic.to_string(),
            payload: payload.into(),
            qos: QoS::AtLeastOnce,
            client_id: String::new(),
        };
        let deliveries = match self.brokers.lock().get_mut(uri) {
            Some(broker) if broker.reachable => broker.route(message.clone()),
            _ => return,
        };
        deliver(deliveries, &message);
    }

    /// Streams every message published on `uri` matching `filter`.
    pub fn observe(&self, uri: &str, filter: &str) -> mpsc::UnboundedReceiver<MockMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(broker) = self.brokers.lock().get_mut(uri) {
            broker.observers.push((filter.to_string(), tx));
        }
        rx
    }

    pub fn published(&self, uri: &str) -> Vec<MockMessage> {
        self.brokers
            .lock()
            .get(uri)
            .map(|broker| broker.published.clone())
            .unwrap_or_default()
    }

    pub fn published_on(&self, uri: &str, topic: &str) -> Vec<MockMessage> {
        self.published(uri)
            .into_iter()
            .filter(|message| message.topic == topic)
            .collect()
    }

    /// Client ids currently connected to `uri`.
    pub fn clients(&self, uri: &str) -> Vec<String> {
        self.brokers
            .lock()
            .get(uri)
            .map(|broker| {
                broker
                    .clients
                    .iter()
                    .map(|client| client.client_id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn subscriptions(&self, uri: &str, client_id: &str) -> Vec<String> {
        self.brokers
            .lock()
            .get(uri)
            .and_then(|broker| {
                broker
                    .clients
                    .iter()
                    .find(|client| client.client_id == client_id)
                    .map(|client| client.subscriptions.lock().clone())
            })
            .unwrap_or_default()
    }

    fn detach(&self, uri: &str, key: u64) {
        if let Some(broker) = self.brokers.lock().get_mut(uri) {
            broker.clients.retain(|client| client.key != key);
        }
    }
}

/// `Transport` over a [`MockNetwork`].
#[derive(Clone)]
pub struct MockTransport {
    network: MockNetwork,
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &self,
        settings: &BrokerSettings,
        client_id: &str,
        events: Arc<dyn ConnectionEvents>,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        let uri = settings.uri();
        let (inbox, mut rx) = mpsc::unbounded_channel();
        let client = Arc::new(Client {
            key: self.network.next_key.fetch_add(1, Ordering::Relaxed),
            client_id: client_id.to_string(),
            subscriptions: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
            inbox,
        });

        {
            let mut brokers = self.network.brokers.lock();
            match brokers.get_mut(&uri) {
                Some(broker) if broker.reachable => broker.clients.push(Arc::clone(&client)),
                _ => {
                    return Err(TransportError::Connect {
                        uri,
                        reason: "connection refused".into(),
                    })
                }
            }
        }

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    Inbox::Connected => events.on_connected(),
                    Inbox::Message { topic, payload } => events.on_message(&topic, &payload),
                    Inbox::Delivered(token) => events.on_delivered(token),
                    Inbox::Disconnected(reason) => events.on_disconnected(&reason),
                    Inbox::Close => break,
                }
            }
        });
        let _ = client.inbox.send(Inbox::Connected);
        tracing::debug!("[mock] {} connected to {}", client_id, uri);

        Ok(Arc::new(MockConnection {
            network: self.network.clone(),
            uri,
            client,
        }))
    }
}

pub struct MockConnection {
    network: MockNetwork,
    uri: String,
    client: Arc<Client>,
}

impl Connection for MockConnection {
    fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> Result<DeliveryToken, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let token = next_delivery_token();
        let message = MockMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            client_id: self.client.client_id.clone(),
        };

        let (deliveries, ack_now) = {
            let mut brokers = self.network.brokers.lock();
            let Some(broker) = brokers.get_mut(&self.uri).filter(|broker| broker.reachable) else {
                return Err(TransportError::Publish {
                    topic: topic.to_string(),
                    reason: "broker unreachable".into(),
                });
            };
            let deliveries = broker.route(message.clone());
            let acknowledged = qos != QoS::AtMostOnce;
            if acknowledged && !broker.auto_ack {
                broker.held_acks.push((Arc::clone(&self.client), token));
            }
            (deliveries, acknowledged && broker.auto_ack)
        };

        deliver(deliveries, &message);
        if ack_now {
            let _ = self.client.inbox.send(Inbox::Delivered(token));
        }
        Ok(token)
    }

    fn subscribe(&self, topic: &str, _qos: QoS) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.client.subscriptions.lock().push(topic.to_string());
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.client
            .subscriptions
            .lock()
            .retain(|filter| filter != topic);
        Ok(())
    }

    fn disconnect(&self) {
        if self.client.connected.swap(false, Ordering::SeqCst) {
            self.network.detach(&self.uri, self.client.key);
            tracing::debug!("[mock] {} disconnected from {}", self.client.client_id, self.uri);
        }
        let _ = self.client.inbox.send(Inbox::Close);
    }

    fn is_connected(&self) -> bool {
        self.client.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Default)]
    struct Collect {
        messages: Mutex<Vec<(String, String)>>,
        delivered: Mutex<Vec<DeliveryToken>>,
    }

    impl ConnectionEvents for Collect {
        fn on_message(&self, topic: &str, payload: &[u8]) {
            self.messages
                .lock()
                .push((topic.to_string(), String::from_utf8_lossy(payload).into_owned()));
        }

        fn on_delivered(&self, token: DeliveryToken) {
            self.delivered.lock().push(token);
        }
    }

    fn settings(host: &str) -> BrokerSettings {
        BrokerSettings::builder().host(host).build().unwrap()
    }

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("dev/sc01", "dev/sc01"));
        assert!(!topic_matches("dev/sc01", "dev/sc01/RES"));
        assert!(topic_matches("dev/+/RES", "dev/sc01/RES"));
        assert!(topic_matches("dev/#", "dev/sc01/RES"));
        assert!(!topic_matches("dev/+", "dev/sc01/RES"));
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers_and_acks() {
        let network = MockNetwork::new();
        network.add_broker("b1:1883");
        let transport = network.transport();

        let events = Arc::new(Collect::default());
        let sub = transport
            .connect(&settings("b1"), "sub", events.clone())
            .await
            .unwrap();
        sub.subscribe("dev/sc01", QoS::ExactlyOnce).unwrap();

        let publisher_events = Arc::new(Collect::default());
        let publisher = transport
            .connect(&settings("b1"), "pub", publisher_events.clone())
            .await
            .unwrap();
        let token = publisher
            .publish("dev/sc01", b"GET VALUE temp", QoS::ExactlyOnce)
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            *events.messages.lock(),
            vec![("dev/sc01".to_string(), "GET VALUE temp".to_string())]
        );
        assert_eq!(*publisher_events.delivered.lock(), vec![token]);
        assert_eq!(network.published_on("b1:1883", "dev/sc01").len(), 1);
    }

    #[tokio::test]
    async fn test_held_acks_are_released_on_demand() {
        let network = MockNetwork::new();
        network.add_broker("b1:1883");
        network.set_auto_ack("b1:1883", false);
        let events = Arc::new(Collect::default());
        let conn = network
            .transport()
            .connect(&settings("b1"), "c", events.clone())
            .await
            .unwrap();
        conn.publish("t", b"x", QoS::AtLeastOnce).unwrap();
        conn.publish("t", b"y", QoS::AtMostOnce).unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(events.delivered.lock().is_empty());
        assert_eq!(network.release_acks("b1:1883"), 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(events.delivered.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_or_unreachable_broker_refuses() {
        let network = MockNetwork::new();
        network.add_broker("b1:1883");
        network.set_reachable("b1:1883", false);
        let transport = network.transport();
        let events: Arc<dyn ConnectionEvents> = Arc::new(Collect::default());
        assert!(transport.connect(&settings("b1"), "c", events.clone()).await.is_err());
        assert!(transport.connect(&settings("b2"), "c", events).await.is_err());
    }

    #[tokio::test]
    async fn test_disconnect_detaches_client() {
        let network = MockNetwork::new();
        network.add_broker("b1:1883");
        let conn = network
            .transport()
            .connect(&settings("b1"), "c", Arc::new(Collect::default()))
            .await
            .unwrap();
        assert_eq!(network.clients("b1:1883"), vec!["c".to_string()]);
        conn.disconnect();
        assert!(network.clients("b1:1883").is_empty());
        assert!(conn.publish("t", b"x", QoS::AtLeastOnce).is_err());
    }
}
