use thiserror::Error;

/// Top-level error type for the `sdcp-api` crate.
///
/// Covers every failure mode across the three printer transports,
/// discovery, and the embedded broker. `sdcp-core` maps these into
/// domain-facing errors.
#[derive(Debug, Error)]
pub enum Error {
    // ── Session ─────────────────────────────────────────────────────
    /// A command was issued with no live transport.
    #[error("Not connected to printer")]
    NotConnected,

    /// No response arrived for a command within the command timeout.
    /// The connection is still usable.
    #[error("Command timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Transport I/O failed or the heartbeat was lost. The connection
    /// is dead and must be re-established by the owner.
    #[error("Connection lost: {0}")]
    Connection(String),

    /// The connection was torn down while a command was awaiting its response.
    #[error("Disconnected while waiting for a response")]
    Disconnected,

    // ── Transport ───────────────────────────────────────────────────
    /// WebSocket handshake or framing failure.
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),

    /// MQTT client failure (connect, subscribe, publish).
    #[error("MQTT error: {0}")]
    Mqtt(String),

    /// Socket-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ── Registration (inverted MQTT) ────────────────────────────────
    /// The printer refused the registration because its client slots are full.
    #[error("Printer rejected registration: too many clients")]
    TooManyClients,

    /// The printer refused the registration for any other reason.
    #[error("Printer rejected registration: {reason}")]
    RegistrationRejected { reason: String },

    /// No registration response arrived in time.
    #[error("Registration timed out after {timeout_ms}ms")]
    RegistrationTimeout { timeout_ms: u64 },

    // ── Data ────────────────────────────────────────────────────────
    /// A frame could not be decoded, with the raw body for debugging.
    #[error("Malformed message: {message}")]
    Malformed { message: String, body: String },

    /// The printer acknowledged a command with a non-zero status code.
    #[error("Printer rejected command {command} (ack {ack})")]
    Rejected { command: u32, ack: i64 },

    // ── Discovery / broker ──────────────────────────────────────────
    /// Discovery socket setup or worker failure.
    #[error("Discovery failed: {0}")]
    Discovery(String),

    /// MQTT wire protocol violation seen by the embedded broker.
    #[error("MQTT protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Returns `true` if retrying on the same connection is sensible.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Rejected { .. })
    }

    /// Returns `true` if the connection is gone and the owner has to reconnect.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            Self::Connection(_)
                | Self::Disconnected
                | Self::WebSocketConnect(_)
                | Self::Mqtt(_)
                | Self::Io(_)
        )
    }

    /// Returns `true` for either flavour of registration refusal.
    pub fn is_registration_rejected(&self) -> bool {
        matches!(
            self,
            Self::TooManyClients | Self::RegistrationRejected { .. } | Self::RegistrationTimeout { .. }
        )
    }

    pub(crate) fn malformed(message: impl Into<String>, body: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
            body: body.into(),
        }
    }
}
