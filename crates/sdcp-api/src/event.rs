// ── Transport events ──
//
// What a transport's background listener pushes to its owner. Every
// transport emits the same closed set so the owner can stay
// transport-agnostic.

use serde_json::Value;

/// Broadcast channel capacity shared by all transports.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A complete status document that replaces the cached one.
    Status(Value),
    /// An incremental status update (inverted MQTT only).
    StatusDelta { seq: u64, delta: Value },
    /// A complete attributes document.
    Attributes(Value),
    /// A command response, after it was offered to the correlation table.
    Response { command: u32, data: Value },
    Notice(Value),
    Error(Value),
    /// The transport is dead. No further events follow.
    Closed { reason: String },
}

impl TransportEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status(_) => "status",
            Self::StatusDelta { .. } => "status-delta",
            Self::Attributes(_) => "attributes",
            Self::Response { .. } => "response",
            Self::Notice(_) => "notice",
            Self::Error(_) => "error",
            Self::Closed { .. } => "closed",
        }
    }
}
