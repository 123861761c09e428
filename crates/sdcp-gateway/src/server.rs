// ── Gateway ──
//
// Owns the registry, the shared broker, and the three listening surfaces:
// HTTP/WebSocket, MJPEG video, and the UDP discovery responder. Cheap to
// clone; every axum handler receives one as state.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::http::{HeaderMap, Uri};
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use sdcp_api::discovery::{self, DiscoveryConfig};
use sdcp_api::BrokerManager;
use sdcp_core::{Device, Printer, PrinterConfig};

use crate::error::GatewayError;
use crate::registry::Registry;
use crate::responder::DiscoveryResponder;
use crate::rewrite::{DEVICE_HTTP_PORT, DEVICE_VIDEO_PORT, PublicAddress, Rewriter};
use crate::routing::{self, Route};
use crate::{api, proxy, ws};

// ── GatewayConfig ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind: IpAddr,
    pub http_port: u16,
    pub video_port: u16,
    pub discovery_port: u16,
    /// Address clients use to reach the gateway. Detected when unset.
    pub external_host: Option<String>,
    /// Suppression window for repeated discovery probes.
    pub rate_limit: Duration,
    /// Stop once the last printer is unregistered.
    pub shutdown_when_empty: bool,
    /// Connect timeout for upstream HTTP and WebSocket requests.
    pub upstream_timeout: Duration,
    /// Port printers serve MJPEG on.
    pub upstream_video_port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            http_port: DEVICE_HTTP_PORT,
            video_port: DEVICE_VIDEO_PORT,
            discovery_port: discovery::SDCP_DISCOVERY_PORT,
            external_host: None,
            rate_limit: Duration::from_secs(30),
            shutdown_when_empty: false,
            upstream_timeout: Duration::from_secs(10),
            upstream_video_port: DEVICE_VIDEO_PORT,
        }
    }
}

// ── Gateway ──────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    config: GatewayConfig,
    registry: Arc<Registry>,
    broker: Arc<BrokerManager>,
    http: reqwest::Client,
    public: PublicAddress,
    cancel: CancellationToken,
}

impl Gateway {
    pub fn new(config: GatewayConfig, broker: Arc<BrokerManager>) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.upstream_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        let host = config
            .external_host
            .clone()
            .or_else(|| discovery::outbound_ip().map(|ip| ip.to_string()))
            .unwrap_or_else(|| Ipv4Addr::LOCALHOST.to_string());
        let public = PublicAddress {
            host,
            http_port: config.http_port,
            video_port: config.video_port,
        };
        Ok(Self {
            inner: Arc::new(GatewayInner {
                config,
                registry: Arc::new(Registry::new()),
                broker,
                http,
                public,
                cancel: CancellationToken::new(),
            }),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub fn public_address(&self) -> &PublicAddress {
        &self.inner.public
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.inner.http
    }

    /// Token cancelled when the gateway shuts down.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    // ── Registration ─────────────────────────────────────────────

    /// Connect to a printer and register it. An id that is already
    /// registered keeps its existing connection.
    pub async fn register(&self, config: PrinterConfig) -> Result<Printer, GatewayError> {
        if let Some(existing) = self.registry().get(&config.device.id) {
            return Ok(existing);
        }
        let printer = Printer::with_broker(config, Arc::clone(&self.inner.broker));
        printer.connect().await?;
        match self.registry().insert(printer.clone()) {
            Ok(()) => Ok(printer),
            Err(duplicate) => {
                duplicate.disconnect().await;
                self.registry()
                    .get(&duplicate.device().id)
                    .ok_or_else(|| GatewayError::UnknownPrinter {
                        id: duplicate.device().id.clone(),
                    })
            }
        }
    }

    /// Unregister and disconnect a printer.
    pub async fn unregister(&self, id: &str) -> Result<(), GatewayError> {
        let printer = self
            .registry()
            .remove(id)
            .ok_or_else(|| GatewayError::UnknownPrinter { id: id.to_owned() })?;
        printer.disconnect().await;
        Ok(())
    }

    /// Discover printers and register every one not yet known. Returns
    /// how many were added; individual connect failures are logged.
    pub async fn register_discovered(&self, discovery: DiscoveryConfig) -> Result<usize, GatewayError> {
        let found = discovery::discover(discovery)
            .await
            .map_err(sdcp_core::CoreError::from)?;
        let mut added = 0;
        for advert in found {
            if self.registry().contains(&advert.id) {
                continue;
            }
            let device = Device::from(advert);
            let id = device.id.clone();
            match self.register(PrinterConfig::new(device)).await {
                Ok(_) => added += 1,
                Err(e) => warn!(printer = %id, error = %e, "discovered printer did not connect"),
            }
        }
        Ok(added)
    }

    // ── Routing helpers ──────────────────────────────────────────

    pub(crate) fn route(&self, uri: &Uri, headers: &HeaderMap) -> Result<(Printer, Route), GatewayError> {
        let ids = self.registry().ids();
        let route = routing::resolve(&ids, uri, headers).ok_or(GatewayError::NoPrinters)?;
        let printer = self
            .registry()
            .get(&route.device_id)
            .ok_or_else(|| GatewayError::UnknownPrinter {
                id: route.device_id.clone(),
            })?;
        Ok((printer, route))
    }

    pub(crate) fn lookup(&self, id: &str) -> Result<Printer, GatewayError> {
        self.registry()
            .get(id)
            .ok_or_else(|| GatewayError::UnknownPrinter { id: id.to_owned() })
    }

    /// The printer's HTTP/WebSocket port.
    pub(crate) fn upstream_port(printer: &Printer) -> u16 {
        printer.config().port.unwrap_or(DEVICE_HTTP_PORT)
    }

    pub(crate) fn rewriter(&self, printer: &Printer) -> Rewriter {
        let device = printer.device();
        Rewriter::for_device(&device.id, &device.host, Self::upstream_port(printer), self.public_address())
    }

    pub(crate) fn asset_rewriter(&self, printer: &Printer) -> Rewriter {
        let device = printer.device();
        Rewriter::for_assets(&device.id, &device.host, Self::upstream_port(printer), self.public_address())
    }

    // ── Surfaces ─────────────────────────────────────────────────

    /// REST API, WebSocket endpoints, and HTTP passthrough.
    pub fn http_router(&self) -> Router {
        api::routes()
            .merge(ws::routes())
            .fallback(proxy::passthrough)
            .with_state(self.clone())
    }

    /// MJPEG passthrough.
    pub fn video_router(&self) -> Router {
        Router::new()
            .fallback(proxy::video)
            .with_state(self.clone())
    }

    pub async fn serve_http(&self, listener: TcpListener) -> Result<(), GatewayError> {
        let shutdown = self.cancel_token().clone();
        axum::serve(listener, self.http_router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        Ok(())
    }

    pub async fn serve_video(&self, listener: TcpListener) -> Result<(), GatewayError> {
        let shutdown = self.cancel_token().clone();
        axum::serve(listener, self.video_router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        Ok(())
    }

    /// Bind all three surfaces and serve until `shutdown` fires, the
    /// gateway is shut down, or (when configured) the registry empties.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), GatewayError> {
        let config = self.config();
        let http = bind_tcp("http", SocketAddr::new(config.bind, config.http_port)).await?;
        let video = bind_tcp("video", SocketAddr::new(config.bind, config.video_port)).await?;
        let discovery_addr = SocketAddr::new(config.bind, config.discovery_port);
        let udp = UdpSocket::bind(discovery_addr)
            .await
            .map_err(|source| GatewayError::Bind {
                surface: "discovery",
                addr: discovery_addr,
                source,
            })?;

        info!(
            http = %config.http_port,
            video = %config.video_port,
            discovery = %config.discovery_port,
            public_host = %self.public_address().host,
            printers = self.registry().len(),
            "gateway listening"
        );

        let cancel = self.cancel_token().clone();
        let responder = DiscoveryResponder::new(
            udp,
            Arc::clone(self.registry()),
            config.rate_limit,
            self.public_address().host.clone(),
        );
        tokio::spawn(responder.run(cancel.clone()));

        let outer = shutdown.clone();
        let inner = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = outer.cancelled() => inner.cancel(),
                () = inner.cancelled() => {}
            }
        });

        if config.shutdown_when_empty {
            tokio::spawn(shutdown_when_empty(self.registry(), cancel.clone()));
        }

        let served = tokio::try_join!(self.serve_http(http), self.serve_video(video));
        cancel.cancel();

        for printer in self.registry().drain() {
            printer.disconnect().await;
        }
        info!("gateway stopped");
        served.map(|_| ())
    }

    pub fn shutdown(&self) {
        self.cancel_token().cancel();
    }
}

async fn bind_tcp(surface: &'static str, addr: SocketAddr) -> Result<TcpListener, GatewayError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| GatewayError::Bind { surface, addr, source })
}

/// Cancel once the registry goes from non-empty to empty. Subscribes at
/// call time so no removal after the call is missed.
fn shutdown_when_empty(
    registry: &Registry,
    cancel: CancellationToken,
) -> impl Future<Output = ()> + Send + 'static {
    let mut size = registry.subscribe_size();
    let mut populated = *size.borrow_and_update() > 0;
    async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                changed = size.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
            let now = *size.borrow_and_update();
            if now > 0 {
                populated = true;
            } else if populated {
                info!("last printer unregistered, shutting down");
                cancel.cancel();
                return;
            }
        }
    }
}
