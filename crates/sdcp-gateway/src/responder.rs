// ── Discovery responder ──
//
// Answers `M99999` probes on the gateway's discovery port with one advert
// per registered printer, each pointing at the gateway instead of the
// printer. Repeated probes from one sender inside the rate-limit window
// are ignored.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use sdcp_api::discovery::{SDCP_PROBE, SdcpAdvert};
use sdcp_core::{Printer, TransportKind};

use crate::registry::Registry;

pub const PROXY_SUFFIX: &str = " (Proxy)";
/// Protocol version advertised for every proxied printer: clients always
/// reach the gateway over WebSocket.
const ADVERTISED_PROTOCOL: &str = "V3.0.0";

// ── Rate limiting ────────────────────────────────────────────────────

/// Per-sender probe suppression.
#[derive(Debug)]
pub struct ProbeRateLimiter {
    window: Duration,
    last_seen: Mutex<HashMap<IpAddr, Instant>>,
}

impl ProbeRateLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    /// Record a probe from `sender` at `now`. Returns whether to answer it.
    pub fn allow(&self, sender: IpAddr, now: Instant) -> bool {
        let mut seen = self.last_seen.lock().unwrap_or_else(PoisonError::into_inner);
        seen.retain(|_, at| now.saturating_duration_since(*at) < self.window);
        if seen.contains_key(&sender) {
            return false;
        }
        seen.insert(sender, now);
        true
    }
}

// ── Adverts ──────────────────────────────────────────────────────────

/// The advert the gateway sends for one printer.
pub fn proxy_advert(printer: &Printer, gateway_ip: &str) -> SdcpAdvert {
    let device = printer.device();
    let attributes = printer.attributes();
    let firmware = attributes
        .as_ref()
        .and_then(|a| a.firmware_version.clone())
        .or_else(|| device.firmware_version.clone())
        .unwrap_or_default();
    SdcpAdvert {
        name: format!("{}{PROXY_SUFFIX}", device.display_name()),
        machine_name: device.model.clone(),
        brand_name: device.brand.clone().unwrap_or_else(|| "ELEGOO".into()),
        mainboard_ip: gateway_ip.to_owned(),
        mainboard_id: device.id.clone(),
        protocol_version: ADVERTISED_PROTOCOL.into(),
        firmware_version: firmware,
    }
}

fn is_probe(payload: &[u8]) -> bool {
    payload.trim_ascii() == SDCP_PROBE
}

// ── Responder loop ───────────────────────────────────────────────────

pub struct DiscoveryResponder {
    socket: UdpSocket,
    registry: Arc<Registry>,
    limiter: ProbeRateLimiter,
    gateway_ip: String,
}

impl DiscoveryResponder {
    pub fn new(
        socket: UdpSocket,
        registry: Arc<Registry>,
        rate_limit: Duration,
        gateway_ip: impl Into<String>,
    ) -> Self {
        Self {
            socket,
            registry,
            limiter: ProbeRateLimiter::new(rate_limit),
            gateway_ip: gateway_ip.into(),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut buf = [0u8; 512];
        loop {
            let (len, sender) = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        warn!(error = %e, "discovery socket receive failed");
                        continue;
                    }
                },
            };
            let payload = buf.get(..len).unwrap_or_default();
            if !is_probe(payload) {
                trace!(%sender, len, "ignoring non-probe datagram");
                continue;
            }
            if !self.limiter.allow(sender.ip(), Instant::now()) {
                trace!(%sender, "probe rate-limited");
                continue;
            }
            self.answer(sender).await;
        }
        debug!("discovery responder stopped");
    }

    async fn answer(&self, sender: SocketAddr) {
        for printer in self.registry.printers() {
            if printer.device().transport == TransportKind::MqttInverted {
                // Inverted-MQTT printers are reachable through the REST API only.
                continue;
            }
            let reply = proxy_advert(&printer, &self.gateway_ip).to_reply(&printer.device().id);
            if let Err(e) = self.socket.send_to(reply.to_string().as_bytes(), sender).await {
                warn!(%sender, id = %printer.device().id, error = %e, "failed to send discovery reply");
                continue;
            }
        }
        debug!(%sender, printers = self.registry.len(), "answered discovery probe");
    }
}
