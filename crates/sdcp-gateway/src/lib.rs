//! Multi-printer gateway: one local endpoint in front of many SDCP printers.
//!
//! - **[`Registry`]**: ordered id → [`Printer`](sdcp_core::Printer) map; the
//!   first registered printer is the routing fallback.
//! - **[`routing`]**: picks the target printer for a request (query id,
//!   `/printer/<id>/` path, `Referer`, path segment, first registered).
//! - **[`rewrite`]**: replaces printer addresses with the gateway's own,
//!   over whole JSON replies or chunked bodies.
//! - **[`DiscoveryResponder`]**: answers `M99999` probes for every
//!   registered printer, rate-limited per sender.
//! - **[`Gateway`]**: HTTP passthrough, REST API, WebSocket routing and
//!   broadcast, MJPEG passthrough.

mod api;
pub mod error;
mod proxy;
pub mod registry;
pub mod responder;
pub mod rewrite;
pub mod routing;
pub mod server;
pub mod ws;

pub use api::{PrinterSummary, RegisterRequest};
pub use error::GatewayError;
pub use registry::Registry;
pub use responder::{DiscoveryResponder, ProbeRateLimiter};
pub use rewrite::{PublicAddress, Rewriter, StreamRewriter};
pub use routing::{Route, RouteSource};
pub use server::{Gateway, GatewayConfig};
