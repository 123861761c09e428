//! MQTT side of the protocol: the raw packet codec, the embedded broker,
//! and the two MQTT-based printer clients.

pub mod broker;
pub mod cc2;
pub mod packet;
pub mod standard;

pub use broker::{BrokerConfig, BrokerHandle, BrokerManager, DEFAULT_BROKER_PORT};
pub use cc2::{Cc2Client, Cc2Config, Cc2State, Cc2Topics};
pub use standard::{SdcpMqttClient, SdcpMqttConfig, send_broker_handshake};
