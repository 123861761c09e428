//! UDP discovery for both device families.
//!
//! SDCP printers answer the ASCII probe `M99999` on port 3000 with a JSON
//! advert, either enveloped as `{Id, Data:{...}}` or flat. Inverted-MQTT
//! printers answer `{"id":0,"method":7000}` on port 52700 with
//! `{"result":{host_name, machine_model, sn, ...}}`; their address is the
//! reply's source address.
//!
//! Sockets are blocking std sockets driven from
//! [`tokio::task::spawn_blocking`]; a discovery run is short and bounded.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::Error;
use crate::mqtt::cc2::method;

pub const SDCP_DISCOVERY_PORT: u16 = 3000;
pub const CC2_DISCOVERY_PORT: u16 = 52700;
pub const SDCP_PROBE: &[u8] = b"M99999";
const RECV_BUFFER: usize = 4096;

// ── Types ────────────────────────────────────────────────────────────

/// Wire family a discovery reply advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiscoveredTransport {
    WebSocket,
    MqttStandard,
    MqttInverted,
}

/// One device seen during a discovery run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredDevice {
    /// Mainboard id (SDCP) or serial number (inverted MQTT).
    pub id: String,
    pub name: String,
    pub model: String,
    pub brand: Option<String>,
    pub address: IpAddr,
    pub transport: DiscoveredTransport,
    pub protocol_version: Option<String>,
    pub firmware_version: Option<String>,
    /// Inverted MQTT: whether the device demands an access code.
    pub token_status: Option<i64>,
    pub lan_status: Option<i64>,
}

/// SDCP discovery advert, as sent by printers and by the gateway responder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SdcpAdvert {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub machine_name: String,
    #[serde(default)]
    pub brand_name: String,
    #[serde(rename = "MainboardIP", default)]
    pub mainboard_ip: String,
    #[serde(rename = "MainboardID", default)]
    pub mainboard_id: String,
    #[serde(default)]
    pub protocol_version: String,
    #[serde(default)]
    pub firmware_version: String,
}

impl SdcpAdvert {
    /// `V1.x` adverts speak SDCP over MQTT; everything else over WebSocket.
    pub fn transport(&self) -> DiscoveredTransport {
        if self.protocol_version.trim().to_ascii_uppercase().starts_with("V1") {
            DiscoveredTransport::MqttStandard
        } else {
            DiscoveredTransport::WebSocket
        }
    }

    /// Enveloped reply body `{Id, Data}`.
    pub fn to_reply(&self, id: &str) -> Value {
        serde_json::json!({ "Id": id, "Data": self })
    }
}

#[derive(Debug, Deserialize)]
struct Cc2Advert {
    #[serde(default)]
    host_name: String,
    #[serde(default)]
    machine_model: String,
    #[serde(default)]
    sn: String,
    #[serde(default)]
    token_status: Option<i64>,
    #[serde(default)]
    lan_status: Option<i64>,
}

// ── Reply parsing ────────────────────────────────────────────────────

/// Parse an SDCP discovery reply received from `source`.
pub fn parse_sdcp_reply(payload: &[u8], source: IpAddr) -> Result<DiscoveredDevice, Error> {
    let body = String::from_utf8_lossy(payload);
    let value: Value =
        serde_json::from_slice(payload).map_err(|e| Error::malformed(e.to_string(), body.clone()))?;

    let advert_value = match value.get("Data") {
        Some(data) if data.is_object() => data.clone(),
        _ => value,
    };
    let advert: SdcpAdvert = serde_json::from_value(advert_value)
        .map_err(|e| Error::malformed(e.to_string(), body.clone()))?;
    if advert.mainboard_id.is_empty() {
        return Err(Error::malformed("discovery reply without MainboardID", body));
    }

    let address = advert.mainboard_ip.parse().unwrap_or(source);
    let name = if advert.name.is_empty() {
        advert.machine_name.clone()
    } else {
        advert.name.clone()
    };
    Ok(DiscoveredDevice {
        id: advert.mainboard_id.clone(),
        name,
        model: advert.machine_name.clone(),
        brand: non_empty(&advert.brand_name),
        address,
        transport: advert.transport(),
        protocol_version: non_empty(&advert.protocol_version),
        firmware_version: non_empty(&advert.firmware_version),
        token_status: None,
        lan_status: None,
    })
}

/// Parse an inverted-MQTT discovery reply received from `source`.
pub fn parse_cc2_reply(payload: &[u8], source: IpAddr) -> Result<DiscoveredDevice, Error> {
    let body = String::from_utf8_lossy(payload);
    let value: Value =
        serde_json::from_slice(payload).map_err(|e| Error::malformed(e.to_string(), body.clone()))?;
    let result = value
        .get("result")
        .cloned()
        .ok_or_else(|| Error::malformed("discovery reply without result", body.clone()))?;
    let advert: Cc2Advert =
        serde_json::from_value(result).map_err(|e| Error::malformed(e.to_string(), body.clone()))?;
    if advert.sn.is_empty() {
        return Err(Error::malformed("discovery reply without sn", body));
    }

    let name = if advert.host_name.is_empty() {
        advert.machine_model.clone()
    } else {
        advert.host_name
    };
    Ok(DiscoveredDevice {
        id: advert.sn,
        name,
        model: advert.machine_model,
        brand: None,
        address: source,
        transport: DiscoveredTransport::MqttInverted,
        protocol_version: None,
        firmware_version: None,
        token_status: advert.token_status,
        lan_status: advert.lan_status,
    })
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_owned())
}

/// The probe payload inverted-MQTT printers answer.
pub fn cc2_probe() -> Vec<u8> {
    serde_json::json!({ "id": 0, "method": method::DISCOVER })
        .to_string()
        .into_bytes()
}

// ── DiscoveryConfig ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Probe destination; the limited broadcast address by default.
    pub target: IpAddr,
    pub sdcp_port: u16,
    pub cc2_port: u16,
    /// How long to collect replies. Default: 3s.
    pub timeout: Duration,
    pub sdcp: bool,
    pub cc2: bool,
    /// Drop adverts that our own gateway sends back to us.
    pub skip_self_proxy: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            target: IpAddr::V4(Ipv4Addr::BROADCAST),
            sdcp_port: SDCP_DISCOVERY_PORT,
            cc2_port: CC2_DISCOVERY_PORT,
            timeout: Duration::from_secs(3),
            sdcp: true,
            cc2: true,
            skip_self_proxy: true,
        }
    }
}

// ── Discovery run ────────────────────────────────────────────────────

/// Probe the network and collect replies until the timeout elapses.
///
/// Duplicate adverts for the same device id are collapsed; the first one
/// wins. Unparseable replies are logged and skipped.
pub async fn discover(config: DiscoveryConfig) -> Result<Vec<DiscoveredDevice>, Error> {
    tokio::task::spawn_blocking(move || discover_blocking(&config))
        .await
        .map_err(|e| Error::Discovery(e.to_string()))?
}

fn discover_blocking(config: &DiscoveryConfig) -> Result<Vec<DiscoveredDevice>, Error> {
    let mut probes: Vec<(UdpSocket, Family)> = Vec::new();
    if config.sdcp {
        let socket = probe_socket()?;
        send_probe(&socket, SDCP_PROBE, SocketAddr::new(config.target, config.sdcp_port))?;
        probes.push((socket, Family::Sdcp));
    }
    if config.cc2 {
        let socket = probe_socket()?;
        send_probe(&socket, &cc2_probe(), SocketAddr::new(config.target, config.cc2_port))?;
        probes.push((socket, Family::Cc2));
    }

    let own_ip = if config.skip_self_proxy {
        outbound_ip()
    } else {
        None
    };
    let deadline = Instant::now() + config.timeout;
    let mut seen = HashSet::new();
    let mut devices = Vec::new();
    let mut buf = [0u8; RECV_BUFFER];

    // Round-robin the sockets with short read slices until the deadline.
    let slice = Duration::from_millis(50);
    while Instant::now() < deadline && !probes.is_empty() {
        for (socket, family) in &probes {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            socket
                .set_read_timeout(Some(remaining.min(slice)))
                .map_err(|e| Error::Discovery(e.to_string()))?;

            let (len, from) = match socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
                Err(e) => return Err(Error::Discovery(e.to_string())),
            };
            let payload = &buf[..len];
            if payload == SDCP_PROBE {
                continue;
            }

            let parsed = match family {
                Family::Sdcp => parse_sdcp_reply(payload, from.ip()),
                Family::Cc2 => parse_cc2_reply(payload, from.ip()),
            };
            let device = match parsed {
                Ok(device) => device,
                Err(e) => {
                    debug!(from = %from, error = %e, "ignoring discovery reply");
                    continue;
                }
            };
            if is_own_proxy(&device, own_ip) {
                trace!(id = %device.id, "skipping our own proxy advert");
                continue;
            }
            if seen.insert(device.id.clone()) {
                debug!(id = %device.id, address = %device.address, transport = ?device.transport, "discovered printer");
                devices.push(device);
            }
        }
    }

    Ok(devices)
}

#[derive(Debug, Clone, Copy)]
enum Family {
    Sdcp,
    Cc2,
}

fn probe_socket() -> Result<UdpSocket, Error> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).map_err(|e| Error::Discovery(e.to_string()))?;
    socket
        .set_broadcast(true)
        .map_err(|e| Error::Discovery(e.to_string()))?;
    Ok(socket)
}

fn send_probe(socket: &UdpSocket, probe: &[u8], target: SocketAddr) -> Result<(), Error> {
    trace!(target = %target, "sending discovery probe");
    socket
        .send_to(probe, target)
        .map_err(|e| Error::Discovery(format!("probe to {target} failed: {e}")))?;
    Ok(())
}

fn is_own_proxy(device: &DiscoveredDevice, own_ip: Option<IpAddr>) -> bool {
    own_ip.is_some_and(|ip| ip == device.address) && device.name.contains("Proxy")
}

/// Address of the interface that routes outward. No packet is sent.
pub fn outbound_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).ok()?;
    socket.connect(("8.8.8.8", 80)).ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

// ── Tests ────────────────────────────────────────────────────────────
