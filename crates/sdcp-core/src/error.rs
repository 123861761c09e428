// ── Core error types ──
//
// Domain-facing errors from sdcp-core. Consumers never see wire framing
// failures directly; the `From<sdcp_api::Error>` impl translates them.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    #[error("Not connected to printer")]
    NotConnected,

    #[error("Printer did not answer within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Cannot connect to printer at {host}: {reason}")]
    ConnectionFailed { host: String, reason: String },

    #[error("Printer connection lost: {reason}")]
    ConnectionLost { reason: String },

    #[error("Printer refused registration: too many clients")]
    TooManyClients,

    #[error("Printer refused registration: {reason}")]
    RegistrationRejected { reason: String },

    // ── Operation errors ─────────────────────────────────────────────
    #[error("Printer rejected {command} (ack {ack})")]
    Rejected { command: String, ack: i64 },

    #[error("{operation} is not supported over {transport}")]
    Unsupported { operation: String, transport: String },

    #[error("Malformed printer message: {message}")]
    Malformed { message: String },

    // ── Lookup / setup errors ────────────────────────────────────────
    #[error("Printer not found: {identifier}")]
    DeviceNotFound { identifier: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Discovery failed: {message}")]
    Discovery { message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Whether retrying on the same connection is sensible.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Rejected { .. })
    }

    /// Whether the owner has to reconnect before issuing more commands.
    pub fn needs_reconnect(&self) -> bool {
        matches!(
            self,
            Self::NotConnected | Self::ConnectionFailed { .. } | Self::ConnectionLost { .. }
        )
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<sdcp_api::Error> for CoreError {
    fn from(err: sdcp_api::Error) -> Self {
        use sdcp_api::Error as Api;
        match err {
            Api::NotConnected => Self::NotConnected,
            Api::Timeout { timeout_ms } => Self::Timeout { timeout_ms },
            Api::Connection(reason) => Self::ConnectionLost { reason },
            Api::Disconnected => Self::ConnectionLost {
                reason: "disconnected while waiting for a response".into(),
            },
            Api::WebSocketConnect(reason) => Self::ConnectionFailed {
                host: String::new(),
                reason: format!("WebSocket: {reason}"),
            },
            Api::Mqtt(reason) => Self::ConnectionFailed {
                host: String::new(),
                reason: format!("MQTT: {reason}"),
            },
            Api::Io(e) => Self::ConnectionFailed {
                host: String::new(),
                reason: e.to_string(),
            },
            Api::TooManyClients => Self::TooManyClients,
            Api::RegistrationRejected { reason } => Self::RegistrationRejected { reason },
            Api::RegistrationTimeout { timeout_ms } => Self::RegistrationRejected {
                reason: format!("no registration response within {timeout_ms}ms"),
            },
            Api::Malformed { message, body: _ } => Self::Malformed { message },
            Api::Rejected { command, ack } => Self::Rejected {
                command: sdcp_command_label(command),
                ack,
            },
            Api::Discovery(message) => Self::Discovery { message },
            Api::Protocol(message) => Self::Internal(format!("MQTT protocol: {message}")),
        }
    }
}

fn sdcp_command_label(command: u32) -> String {
    match sdcp_api::sdcp::command::name(command) {
        "unknown" => format!("command {command}"),
        name => name.to_owned(),
    }
}
