//! SDCP JSON envelopes and command identifiers.
//!
//! The same envelope travels over the WebSocket transport and the
//! broker-mediated MQTT transport; only the topic prefix differs.

pub mod command;
mod envelope;
pub(crate) mod session;

pub use envelope::{
    RequestData, SdcpMessage, SdcpRequest, SdcpResponse, TopicKind, TopicStyle, encode_push,
    encode_response, new_request_id,
};
