// ── Runtime printer configuration ──
//
// Describes how to reach one printer and how patient to be with it. Never
// touches disk; `sdcp-config` or the gateway builds these and hands them in.

use std::time::Duration;

use secrecy::SecretString;

use crate::model::Device;

/// Connection settings for a single printer.
#[derive(Debug, Clone)]
pub struct PrinterConfig {
    pub device: Device,
    /// Inverted-MQTT access code, sent as the MQTT password.
    pub access_code: Option<SecretString>,
    /// Per-command response timeout.
    pub command_timeout: Duration,
    /// Status push period requested from broker-mediated MQTT printers.
    pub status_period: Duration,
    /// How long a broker-mediated MQTT printer gets to join our broker.
    pub join_timeout: Duration,
    pub registration_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub pong_timeout: Duration,
    /// Non-continuous deltas tolerated before a full status resync.
    pub resync_threshold: u32,
    /// WebSocket port (SDCP) or broker port (inverted MQTT) override.
    pub port: Option<u16>,
}

impl PrinterConfig {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            access_code: None,
            command_timeout: Duration::from_secs(10),
            status_period: Duration::from_secs(5),
            join_timeout: Duration::from_secs(30),
            registration_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(10),
            pong_timeout: Duration::from_secs(30),
            resync_threshold: crate::cc2_state::DEFAULT_RESYNC_THRESHOLD,
            port: None,
        }
    }

    pub fn with_access_code(mut self, code: SecretString) -> Self {
        self.access_code = Some(code);
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }
}
