// ── HTTP passthrough ──
//
// Forwards any request the REST API and WebSocket routes don't claim to
// the routed printer, streaming both bodies so multipart uploads and MJPEG
// never sit in memory. Text responses go through the streaming rewriter.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, header};
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};

use sdcp_core::Printer;

use crate::error::GatewayError;
use crate::rewrite::{Rewriter, rewrite_stream};
use crate::routing::Route;
use crate::server::Gateway;

static HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    header::HOST,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
];

/// Fallback handler of the HTTP surface.
pub(crate) async fn passthrough(State(gateway): State<Gateway>, request: Request) -> Response {
    let result = match gateway.route(request.uri(), request.headers()) {
        Ok((printer, route)) => {
            let port = Gateway::upstream_port(&printer);
            let rewriter = gateway.asset_rewriter(&printer);
            forward(&gateway, &printer, &route, port, Some(rewriter), request).await
        }
        Err(e) => Err(e),
    };
    result.unwrap_or_else(IntoResponse::into_response)
}

/// Fallback handler of the video surface. MJPEG is never rewritten.
pub(crate) async fn video(State(gateway): State<Gateway>, request: Request) -> Response {
    let result = match gateway.route(request.uri(), request.headers()) {
        Ok((printer, route)) => {
            let port = gateway.config().upstream_video_port;
            forward(&gateway, &printer, &route, port, None, request).await
        }
        Err(e) => Err(e),
    };
    result.unwrap_or_else(IntoResponse::into_response)
}

async fn forward(
    gateway: &Gateway,
    printer: &Printer,
    route: &Route,
    port: u16,
    rewriter: Option<Rewriter>,
    request: Request,
) -> Result<Response, GatewayError> {
    let device = printer.device();
    let url = format!("http://{}:{port}{}", device.host, route.path_and_query);
    debug!(printer = %device.id, source = ?route.source, %url, "forwarding request");

    let (parts, body) = request.into_parts();
    let mut headers = strip_hop_by_hop(&parts.headers);
    if rewriter.is_some() {
        // Rewriting needs an identity-encoded body.
        headers.remove(header::ACCEPT_ENCODING);
    }

    let upstream = gateway
        .http()
        .request(parts.method, &url)
        .headers(headers)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()))
        .send()
        .await
        .map_err(|e| {
            warn!(printer = %device.id, %url, error = %e, "upstream request failed");
            GatewayError::upstream(&device.id, e)
        })?;

    let status = upstream.status();
    let mut headers = strip_hop_by_hop(upstream.headers());
    let rewriter = rewriter.filter(|_| is_text(&headers));

    let body = match rewriter {
        Some(rewriter) => {
            headers.remove(header::CONTENT_LENGTH);
            rewrite_location(&mut headers, &rewriter);
            Body::from_stream(rewrite_stream(upstream.bytes_stream(), rewriter))
        }
        None => Body::from_stream(upstream.bytes_stream()),
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut out = headers.clone();
    for name in &HOP_BY_HOP {
        out.remove(name);
    }
    out.remove("keep-alive");
    out.remove(header::UPGRADE);
    out
}

fn is_text(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| {
            let ct = ct.to_ascii_lowercase();
            ct.starts_with("text/") || ct.contains("javascript") || ct.contains("json")
        })
}

fn rewrite_location(headers: &mut HeaderMap, rewriter: &Rewriter) {
    let Some(location) = headers.get(header::LOCATION).and_then(|v| v.to_str().ok()) else {
        return;
    };
    let rewritten = rewriter.apply(location).into_owned();
    if let Ok(value) = HeaderValue::from_str(&rewritten) {
        headers.insert(header::LOCATION, value);
    }
}
