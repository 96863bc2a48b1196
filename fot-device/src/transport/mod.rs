//! Broker connection contract.
//!
//! The device and the migration logic only see these traits; `mqtt` backs
//! them with rumqttc and the devkit backs them with an in-memory network.

mod mqtt;

pub use mqtt::MqttTransport;
pub use rumqttc::QoS;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::model::BrokerSettings;

/// Process-unique identifier of one publish, reported back on delivery.
pub type DeliveryToken = u64;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

pub fn next_delivery_token() -> DeliveryToken {
    NEXT_TOKEN.fetch_add(1, Ordering::Relaxed)
}

/// Callbacks fired from the connection's event loop. Implementations must
/// not block.
pub trait ConnectionEvents: Send + Sync {
    fn on_connected(&self) {}

    fn on_message(&self, topic: &str, payload: &[u8]);

    /// A QoS 1/2 publish was acknowledged by the broker.
    fn on_delivered(&self, _token: DeliveryToken) {}

    fn on_disconnected(&self, _reason: &str) {}
}

/// A live client session. `publish` never calls back into
/// [`ConnectionEvents`] before it returns.
pub trait Connection: Send + Sync {
    /// Queues a publish. The token is reported through
    /// [`ConnectionEvents::on_delivered`] once acknowledged.
    fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> Result<DeliveryToken, TransportError>;

    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError>;

    fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Closes the session and stops the event loop.
    fn disconnect(&self);

    fn is_connected(&self) -> bool;
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a session and resolves once the broker accepted it.
    async fn connect(
        &self,
        settings: &BrokerSettings,
        client_id: &str,
        events: Arc<dyn ConnectionEvents>,
    ) -> Result<Arc<dyn Connection>, TransportError>;
}
