// sdcp-api: Async wire clients for SDCP resin and FDM printers
//
// Three transports share one event model:
//   - `websocket`      SDCP JSON over ws://<host>:3030/websocket
//   - `mqtt::standard` SDCP JSON over a broker the printer is told to join
//   - `mqtt::cc2`      JSON-RPC over the broker the printer itself hosts
//
// Every client correlates responses through `pending`, pushes
// `TransportEvent`s over a broadcast channel, and never reconnects on its
// own: a dead transport reports `TransportEvent::Closed` and the owner
// decides what happens next.

pub mod discovery;
pub mod error;
pub mod event;
pub mod mqtt;
pub mod pending;
pub mod sdcp;
pub mod websocket;

pub use discovery::{DiscoveredDevice, DiscoveredTransport, DiscoveryConfig, SdcpAdvert, discover};
pub use error::Error;
pub use event::TransportEvent;
pub use mqtt::{
    BrokerConfig, BrokerHandle, BrokerManager, Cc2Client, Cc2Config, Cc2State, SdcpMqttClient,
    SdcpMqttConfig,
};
pub use websocket::{SdcpWsClient, SdcpWsConfig};
