// ── WebSocket surface ──
//
// A client socket is either routed to one printer or, when it names none
// and several are registered, broadcast to all of them. Each printer is
// served by one "leg" task:
//
// - WebSocket printers: an upstream socket, frames forwarded as-is.
// - Broker-mediated MQTT printers: SDCP frames bridged onto the printer's
//   live connection; its status and attributes pushes come back as
//   ordinary SDCP push frames.
//
// In broadcast mode every fanned-out request gets `RequestID` rewritten to
// `<original>.<leg>`, and replies from that leg get the suffix stripped
// again, so concurrent replies from different printers never collide.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::http::{HeaderMap, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use sdcp_api::TransportEvent;
use sdcp_api::sdcp::{SdcpRequest, SdcpResponse, TopicKind, TopicStyle, encode_push, encode_response};
use sdcp_core::{CoreError, Printer, TransportKind};

use crate::error::GatewayError;
use crate::rewrite::Rewriter;
use crate::routing;
use crate::server::Gateway;

const LEG_QUEUE: usize = 64;

pub(crate) fn routes() -> Router<Gateway> {
    Router::new()
        .route("/websocket", get(upgrade))
        .route("/printer/{id}/websocket", get(upgrade))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Routed,
    Broadcast,
}

async fn upgrade(
    State(gateway): State<Gateway>,
    ws: WebSocketUpgrade,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let ids = gateway.registry().ids();
    if ids.is_empty() {
        return GatewayError::NoPrinters.into_response();
    }
    let named = routing::resolve(&ids, &uri, &headers)
        .filter(|route| route.source.is_explicit())
        .and_then(|route| gateway.registry().get(&route.device_id));
    let (mode, targets) = match named {
        Some(printer) => (Mode::Routed, vec![printer]),
        None => {
            let all = gateway.registry().printers();
            let mode = if all.len() == 1 { Mode::Routed } else { Mode::Broadcast };
            (mode, all)
        }
    };
    ws.on_upgrade(move |socket| session(gateway, socket, mode, targets))
}

// ── Request tagging ──────────────────────────────────────────────────

fn request_id_mut(frame: &mut Value) -> Option<&mut String> {
    match frame.get_mut("Data")?.get_mut("RequestID")? {
        Value::String(id) => Some(id),
        _ => None,
    }
}

/// `<id>` → `<id>.<leg>`.
pub fn tag(frame: &mut Value, leg: usize) {
    if let Some(id) = request_id_mut(frame) {
        *id = format!("{id}.{leg}");
    }
}

/// `<id>.<leg>` → `<id>`. Ids without this leg's suffix are left alone.
pub fn untag(frame: &mut Value, leg: usize) {
    if let Some(id) = request_id_mut(frame) {
        if let Some(original) = id.strip_suffix(&format!(".{leg}")) {
            *id = original.to_owned();
        }
    }
}

/// Point a request frame at `device_id`. Routed frames keep an id the
/// client set; broadcast frames are always re-addressed.
fn address(frame: &mut Value, device_id: &str, force: bool) {
    let Some(Value::Object(data)) = frame.get_mut("Data") else {
        return;
    };
    let unset = data
        .get("MainboardID")
        .and_then(Value::as_str)
        .is_none_or(str::is_empty);
    if force || unset {
        data.insert("MainboardID".into(), json!(device_id));
    }
    if let Value::Object(envelope) = frame {
        let topic_unset = envelope
            .get("Topic")
            .and_then(Value::as_str)
            .is_none_or(str::is_empty);
        if force || topic_unset {
            envelope.insert(
                "Topic".into(),
                json!(TopicKind::Request.topic(TopicStyle::WebSocket, device_id)),
            );
        }
    }
}

/// Shapes printer frames on their way to the client.
struct ReplyShaper {
    leg: usize,
    mode: Mode,
    rewriter: Rewriter,
}

impl ReplyShaper {
    fn shape(&self, mut frame: Value) -> String {
        if self.mode == Mode::Broadcast {
            untag(&mut frame, self.leg);
        }
        self.rewriter.apply_json(&mut frame);
        frame.to_string()
    }

    fn shape_text(&self, text: &str) -> Option<String> {
        if text.trim() == "pong" {
            return None;
        }
        match serde_json::from_str::<Value>(text) {
            Ok(frame) => Some(self.shape(frame)),
            Err(_) => Some(self.rewriter.apply(text).into_owned()),
        }
    }
}

// ── Legs ─────────────────────────────────────────────────────────────

enum Outbound {
    Frame(Value),
    Text(String),
}

struct Leg {
    index: usize,
    device_id: String,
    tx: mpsc::Sender<Outbound>,
}

impl Leg {
    async fn send(&self, outbound: Outbound) {
        if self.tx.send(outbound).await.is_err() {
            debug!(printer = %self.device_id, "leg already closed");
        }
    }
}

type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn open_leg(
    gateway: &Gateway,
    printer: Printer,
    index: usize,
    mode: Mode,
    to_client: mpsc::Sender<String>,
    cancel: CancellationToken,
) -> Result<Leg, GatewayError> {
    let device_id = printer.device().id.clone();
    let (tx, rx) = mpsc::channel(LEG_QUEUE);
    let shaper = Arc::new(ReplyShaper {
        leg: index,
        mode,
        rewriter: gateway.rewriter(&printer),
    });

    match printer.device().transport {
        TransportKind::WebSocket => {
            let url = format!(
                "ws://{}:{}/websocket",
                printer.device().host,
                Gateway::upstream_port(&printer)
            );
            let (socket, _) = tokio::time::timeout(
                gateway.config().upstream_timeout,
                tokio_tungstenite::connect_async(&url),
            )
            .await
            .map_err(|_| GatewayError::upstream(&device_id, "connect timed out"))?
            .map_err(|e| GatewayError::upstream(&device_id, e))?;
            debug!(printer = %device_id, %url, "upstream socket open");
            tokio::spawn(socket_leg(socket, rx, to_client, shaper, cancel));
        }
        TransportKind::MqttStandard => {
            tokio::spawn(bridge_leg(printer, rx, to_client, shaper, cancel));
        }
        TransportKind::MqttInverted => {
            return Err(CoreError::Unsupported {
                operation: "WebSocket passthrough".into(),
                transport: TransportKind::MqttInverted.to_string(),
            }
            .into());
        }
    }

    Ok(Leg {
        index,
        device_id,
        tx,
    })
}

async fn socket_leg(
    socket: UpstreamSocket,
    mut rx: mpsc::Receiver<Outbound>,
    to_client: mpsc::Sender<String>,
    shaper: Arc<ReplyShaper>,
    cancel: CancellationToken,
) {
    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            outbound = rx.recv() => {
                let text = match outbound {
                    Some(Outbound::Frame(frame)) => frame.to_string(),
                    Some(Outbound::Text(text)) => text,
                    None => break,
                };
                if let Err(e) = sink.send(UpstreamMessage::text(text)).await {
                    warn!(error = %e, "upstream send failed");
                    break;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(UpstreamMessage::Text(text))) => {
                    let Some(reply) = shaper.shape_text(text.as_str()) else {
                        continue;
                    };
                    if to_client.send(reply).await.is_err() {
                        break;
                    }
                }
                Some(Ok(UpstreamMessage::Close(_))) | None => {
                    debug!("upstream socket closed");
                    break;
                }
                Some(Err(e)) => {
                    warn!(error = %e, "upstream socket failed");
                    break;
                }
                Some(Ok(_)) => {}
            }
        }
    }
    let _ = sink.send(UpstreamMessage::Close(None)).await;
}

async fn bridge_leg(
    printer: Printer,
    mut rx: mpsc::Receiver<Outbound>,
    to_client: mpsc::Sender<String>,
    shaper: Arc<ReplyShaper>,
    cancel: CancellationToken,
) {
    let mut events = printer.subscribe_raw();
    let device_id = printer.device().id.clone();
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            outbound = rx.recv() => match outbound {
                Some(Outbound::Frame(frame)) => match serde_json::from_value::<SdcpRequest>(frame) {
                    Ok(request) => {
                        tokio::spawn(bridge_request(
                            printer.clone(),
                            request,
                            to_client.clone(),
                            Arc::clone(&shaper),
                        ));
                    }
                    Err(e) => debug!(printer = %device_id, error = %e, "ignoring non-request frame"),
                },
                Some(Outbound::Text(_)) => {}
                None => break,
            },
            event = events.recv() => {
                let push = match event {
                    Ok(event) => match &*event {
                        TransportEvent::Status(status) => {
                            encode_push(TopicKind::Status, TopicStyle::WebSocket, &device_id, status)
                        }
                        TransportEvent::Attributes(attributes) => encode_push(
                            TopicKind::Attributes,
                            TopicStyle::WebSocket,
                            &device_id,
                            attributes,
                        ),
                        TransportEvent::Closed { reason } => {
                            debug!(printer = %device_id, %reason, "bridged printer closed");
                            break;
                        }
                        other => {
                            trace!(printer = %device_id, kind = other.kind(), "not bridged");
                            continue;
                        }
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(printer = %device_id, skipped, "bridge lagged behind printer events");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if to_client.send(shaper.shape(push)).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// `Ack` reported to the client when a bridged command never got an answer
/// from the printer.
const BRIDGE_FAILURE_ACK: i64 = -1;

/// Reply body for a bridged command. Every request gets one, so the client
/// is never left waiting on its `RequestID`.
fn bridged_reply_data(result: Result<Option<Value>, CoreError>) -> Value {
    match result {
        Ok(data) => data.unwrap_or(Value::Null),
        Err(CoreError::Rejected { ack, .. }) => json!({ "Ack": ack }),
        Err(e) => json!({ "Ack": BRIDGE_FAILURE_ACK, "Error": e.to_string() }),
    }
}

async fn bridge_request(
    printer: Printer,
    request: SdcpRequest,
    to_client: mpsc::Sender<String>,
    shaper: Arc<ReplyShaper>,
) {
    let cmd = request.data.cmd;
    let result = printer.send_command(cmd, request.data.data.clone(), true).await;
    if let Err(e) = &result {
        warn!(printer = %printer.device().id, cmd, error = %e, "bridged command failed");
    }
    let data = bridged_reply_data(result);
    let response = SdcpResponse {
        cmd,
        data,
        request_id: request.data.request_id.clone(),
        mainboard_id: printer.device().id.clone(),
        timestamp: chrono::Utc::now().timestamp(),
    };
    let frame = encode_response(TopicStyle::WebSocket, &request.id, &response);
    let _ = to_client.send(shaper.shape(frame)).await;
}

// ── Client session ───────────────────────────────────────────────────

async fn session(gateway: Gateway, socket: WebSocket, mode: Mode, targets: Vec<Printer>) {
    let cancel = gateway.cancel_token().child_token();
    let (to_client, mut from_legs) = mpsc::channel::<String>(LEG_QUEUE);

    let mut legs = Vec::with_capacity(targets.len());
    for (index, printer) in targets.into_iter().enumerate() {
        let id = printer.device().id.clone();
        match open_leg(&gateway, printer, index, mode, to_client.clone(), cancel.child_token()).await {
            Ok(leg) => legs.push(leg),
            Err(e) => warn!(printer = %id, error = %e, "printer unavailable for WebSocket client"),
        }
    }
    drop(to_client);

    let (mut client_tx, mut client_rx) = socket.split();
    if legs.is_empty() {
        let _ = client_tx
            .send(Message::Close(Some(CloseFrame {
                code: close_code::AWAY,
                reason: "upstream unavailable".into(),
            })))
            .await;
        return;
    }
    info!(?mode, printers = legs.len(), "WebSocket client attached");

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            reply = from_legs.recv() => match reply {
                Some(text) => {
                    if client_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            incoming = client_rx.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                if text.trim() == "ping" {
                    if client_tx.send(Message::Text("pong".into())).await.is_err() {
                        break;
                    }
                    continue;
                }
                dispatch(&legs, mode, &text).await;
            }
        }
    }
    cancel.cancel();
    debug!(?mode, "WebSocket client detached");
}

async fn dispatch(legs: &[Leg], mode: Mode, text: &str) {
    let Ok(frame) = serde_json::from_str::<Value>(text) else {
        match (mode, legs.first()) {
            (Mode::Routed, Some(leg)) => leg.send(Outbound::Text(text.to_owned())).await,
            _ => debug!("dropping non-JSON frame in broadcast mode"),
        }
        return;
    };

    match mode {
        Mode::Routed => {
            for leg in legs {
                let mut frame = frame.clone();
                address(&mut frame, &leg.device_id, false);
                leg.send(Outbound::Frame(frame)).await;
            }
        }
        Mode::Broadcast => {
            // A request naming one registered printer goes to that printer only.
            let named = frame
                .pointer("/Data/MainboardID")
                .and_then(Value::as_str)
                .filter(|id| legs.iter().any(|leg| leg.device_id == *id))
                .map(str::to_owned);
            for leg in legs
                .iter()
                .filter(|leg| named.as_ref().is_none_or(|id| *id == leg.device_id))
            {
                let mut frame = frame.clone();
                address(&mut frame, &leg.device_id, true);
                tag(&mut frame, leg.index);
                leg.send(Outbound::Frame(frame)).await;
            }
        }
    }
}
