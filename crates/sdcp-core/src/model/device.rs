// ── Device identity ──

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use sdcp_api::discovery::{DiscoveredDevice, DiscoveredTransport};

/// Wire family a printer speaks.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum TransportKind {
    /// SDCP JSON over `ws://<host>:3030/websocket`.
    #[strum(to_string = "websocket", serialize = "ws")]
    #[serde(rename = "websocket", alias = "ws")]
    WebSocket,
    /// SDCP JSON over a broker the printer is told to join.
    #[strum(to_string = "mqtt", serialize = "mqtt-standard")]
    #[serde(rename = "mqtt", alias = "mqtt-standard")]
    MqttStandard,
    /// JSON-RPC over the broker the printer hosts itself.
    #[strum(to_string = "cc2", serialize = "mqtt-inverted")]
    #[serde(rename = "cc2", alias = "mqtt-inverted")]
    MqttInverted,
}

impl From<DiscoveredTransport> for TransportKind {
    fn from(t: DiscoveredTransport) -> Self {
        match t {
            DiscoveredTransport::WebSocket => Self::WebSocket,
            DiscoveredTransport::MqttStandard => Self::MqttStandard,
            DiscoveredTransport::MqttInverted => Self::MqttInverted,
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum PrinterClass {
    Resin,
    Fdm,
}

impl PrinterClass {
    const RESIN_FAMILIES: [&'static str; 4] = ["saturn", "mars", "jupiter", "halot"];

    /// Classify by model name; anything not a known resin family is FDM.
    pub fn from_model(model: &str) -> Self {
        let lower = model.to_ascii_lowercase();
        if Self::RESIN_FAMILIES.iter().any(|f| lower.contains(f)) {
            Self::Resin
        } else {
            Self::Fdm
        }
    }

    /// Resin boards report print ticks in milliseconds, FDM boards in seconds.
    pub(crate) fn ticks_to_ms(self, ticks: f64) -> u64 {
        let ms = match self {
            Self::Resin => ticks,
            Self::Fdm => ticks * 1000.0,
        };
        crate::convert::f64_to_u64(ms)
    }
}

/// One printer. Identity is fixed; `host` and `transport` may change on
/// reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Mainboard id (SDCP) or serial number (inverted MQTT).
    pub id: String,
    pub name: String,
    pub model: String,
    pub brand: Option<String>,
    pub host: String,
    pub transport: TransportKind,
    pub class: PrinterClass,
    pub firmware_version: Option<String>,
    pub protocol_version: Option<String>,
}

impl Device {
    pub fn new(
        id: impl Into<String>,
        host: impl Into<String>,
        model: impl Into<String>,
        transport: TransportKind,
    ) -> Self {
        let id = id.into();
        let model = model.into();
        Self {
            name: if model.is_empty() { id.clone() } else { model.clone() },
            class: PrinterClass::from_model(&model),
            id,
            model,
            brand: None,
            host: host.into(),
            transport,
            firmware_version: None,
            protocol_version: None,
        }
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() { &self.id } else { &self.name }
    }
}

impl From<DiscoveredDevice> for Device {
    fn from(d: DiscoveredDevice) -> Self {
        Self {
            class: PrinterClass::from_model(&d.model),
            id: d.id,
            name: d.name,
            model: d.model,
            brand: d.brand,
            host: d.address.to_string(),
            transport: d.transport.into(),
            firmware_version: d.firmware_version,
            protocol_version: d.protocol_version,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn resin_families_are_recognised() {
        assert_eq!(PrinterClass::from_model("ELEGOO Saturn 4 Ultra"), PrinterClass::Resin);
        assert_eq!(PrinterClass::from_model("Mars 5 Ultra"), PrinterClass::Resin);
        assert_eq!(PrinterClass::from_model("Jupiter SE"), PrinterClass::Resin);
        assert_eq!(PrinterClass::from_model("Centauri Carbon"), PrinterClass::Fdm);
        assert_eq!(PrinterClass::from_model(""), PrinterClass::Fdm);
    }

    #[test]
    fn ticks_follow_class_units() {
        assert_eq!(PrinterClass::Resin.ticks_to_ms(1500.0), 1500);
        assert_eq!(PrinterClass::Fdm.ticks_to_ms(1.5), 1500);
    }

    #[test]
    fn transport_parses_aliases() {
        assert_eq!(TransportKind::from_str("ws").unwrap(), TransportKind::WebSocket);
        assert_eq!(TransportKind::from_str("MQTT").unwrap(), TransportKind::MqttStandard);
        assert_eq!(TransportKind::from_str("cc2").unwrap(), TransportKind::MqttInverted);
        assert_eq!(TransportKind::MqttInverted.to_string(), "cc2");
    }
}
