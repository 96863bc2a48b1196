/*!
# FoT DevKit - test kit for the virtual device

Drives a device without a real broker:
- in-memory MQTT network and `Transport` implementation
- fake gateway answering CONNECT handshakes
- TATU command builders and a ready-wired test harness
*/

pub mod gateway;
pub mod mqtt_stub;
pub mod test_utils;

pub use gateway::{FakeGateway, GatewayPolicy, TatuCommand};
pub use mqtt_stub::{MockMessage, MockNetwork, MockTransport};
pub use test_utils::TestHarness;
