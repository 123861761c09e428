// ── Shared SDCP session state ──
//
// The WebSocket and broker-mediated MQTT transports carry the same
// envelope, so frame dispatch, correlation and death handling live here.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use super::command;
use super::envelope::{SdcpMessage, SdcpResponse};
use crate::error::Error;
use crate::event::{EVENT_CHANNEL_CAPACITY, TransportEvent};
use crate::pending::{PendingRequests, Waiter};

pub(crate) struct SdcpSession {
    pub(crate) mainboard_id: String,
    pub(crate) pending: PendingRequests<String, SdcpResponse>,
    events: broadcast::Sender<Arc<TransportEvent>>,
    alive: AtomicBool,
}

impl SdcpSession {
    pub(crate) fn new(mainboard_id: String) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            mainboard_id,
            pending: PendingRequests::new(),
            events,
            alive: AtomicBool::new(true),
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Arc<TransportEvent>> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: TransportEvent) {
        // No subscribers is fine; the owner may not be listening yet.
        let _ = self.events.send(Arc::new(event));
    }

    /// Mark the session dead, release every waiter, and announce it once.
    pub(crate) fn mark_dead(&self, reason: &str) {
        if self.alive.swap(false, Ordering::AcqRel) {
            let released = self.pending.fail_all();
            warn!(
                mainboard_id = %self.mainboard_id,
                reason,
                released,
                "printer connection closed"
            );
            self.emit(TransportEvent::Closed {
                reason: reason.to_owned(),
            });
        }
    }

    /// Decode one inbound payload and route it. Never fails: malformed
    /// frames and unknown topics are logged and dropped.
    pub(crate) fn dispatch(&self, payload: &[u8]) {
        if payload == b"pong" {
            trace!("keepalive pong");
            return;
        }

        let message = match SdcpMessage::decode_bytes(payload) {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "dropping malformed SDCP frame");
                return;
            }
        };

        match message {
            SdcpMessage::Response(response) => {
                let cmd = response.cmd;
                let data = response.data.clone();
                let request_id = response.request_id.clone();
                if !self.pending.resolve(&request_id, response) {
                    trace!(cmd, request_id = %request_id, "response without a waiter");
                }
                self.emit(TransportEvent::Response { command: cmd, data });
            }
            SdcpMessage::Status { status, .. } => self.emit(TransportEvent::Status(status)),
            SdcpMessage::Attributes { attributes, .. } => {
                self.emit(TransportEvent::Attributes(attributes));
            }
            SdcpMessage::Notice(body) => {
                info!(mainboard_id = %self.mainboard_id, notice = %body, "printer notice");
                self.emit(TransportEvent::Notice(body));
            }
            SdcpMessage::Error(body) => {
                warn!(mainboard_id = %self.mainboard_id, error = %body, "printer error push");
                self.emit(TransportEvent::Error(body));
            }
            SdcpMessage::Request(request) => {
                trace!(cmd = request.data.cmd, "ignoring echoed request");
            }
            SdcpMessage::Unknown { topic, .. } => {
                debug!(topic = %topic, "unknown SDCP topic");
            }
        }
    }

    /// Await a registered waiter and turn a non-zero ack into `Rejected`.
    pub(crate) async fn finish(
        &self,
        waiter: Waiter<String, SdcpResponse>,
        cmd: u32,
        timeout: Duration,
    ) -> Result<SdcpResponse, Error> {
        let response = waiter.wait(timeout).await.inspect_err(|e| {
            if matches!(e, Error::Timeout { .. }) {
                warn!(cmd, name = command::name(cmd), "command timed out");
            }
        })?;
        match response.ack() {
            0 => Ok(response),
            ack => Err(Error::Rejected { command: cmd, ack }),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
