//! Inverted MQTT ("CC2"): the printer hosts the broker.
//!
//! We connect to the printer as an ordinary MQTT client, register a client
//! id, and only then may we issue commands. The printer keeps a small
//! number of client slots; a full table is reported as
//! [`Error::TooManyClients`]. A PING/PONG heartbeat runs while registered
//! and a missed PONG window marks the connection dead.
//!
//! Status arrives as sequenced deltas on `api_status`, surfaced unmerged as
//! [`TransportEvent::StatusDelta`]; merging is the owner's job.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet as MqttPacket, QoS};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::Error;
use crate::event::{EVENT_CHANNEL_CAPACITY, TransportEvent};
use crate::pending::PendingRequests;

pub const DEFAULT_PORT: u16 = 1883;
pub const USERNAME: &str = "elegoo";
const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Method ids of the inverted-MQTT RPC.
pub mod method {
    pub const ATTRIBUTES: u32 = 1001;
    pub const STATUS: u32 = 1002;
    pub const PAUSE_PRINT: u32 = 1021;
    pub const STOP_PRINT: u32 = 1022;
    pub const RESUME_PRINT: u32 = 1023;
    pub const SET_TEMPERATURE: u32 = 1027;
    pub const SET_FAN: u32 = 1028;
    pub const SET_LIGHT: u32 = 1029;
    pub const SET_PRINT_SPEED: u32 = 1031;
    pub const HISTORY_LIST: u32 = 1036;
    pub const HISTORY_DETAIL: u32 = 1037;
    pub const VIDEO_STREAM: u32 = 1042;
    /// Unsolicited status delta.
    pub const STATUS_PUSH: u32 = 6000;
    /// UDP discovery probe.
    pub const DISCOVER: u32 = 7000;
}

// ── Cc2Config ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Cc2Config {
    pub host: String,
    pub port: u16,
    /// Printer serial number; the root of every topic.
    pub serial: String,
    pub access_code: Option<SecretString>,
    /// Default: 10s.
    pub command_timeout: Duration,
    /// Default: 5s.
    pub registration_timeout: Duration,
    /// Interval between PINGs. Default: 10s.
    pub heartbeat_interval: Duration,
    /// Longest tolerated silence since the last PONG. Default: 30s.
    pub pong_timeout: Duration,
}

impl Cc2Config {
    pub fn new(host: impl Into<String>, serial: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            serial: serial.into(),
            access_code: None,
            command_timeout: Duration::from_secs(10),
            registration_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(10),
            pong_timeout: Duration::from_secs(30),
        }
    }

    #[must_use]
    pub fn with_access_code(mut self, code: SecretString) -> Self {
        self.access_code = Some(code);
        self
    }
}

// ── Topics ───────────────────────────────────────────────────────────

/// Topic set for one registered client of one printer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cc2Topics {
    pub register: String,
    pub register_response: String,
    pub request: String,
    pub response: String,
    pub status: String,
}

impl Cc2Topics {
    pub fn new(serial: &str, client_id: &str) -> Self {
        Self {
            register: format!("elegoo/{serial}/api_register"),
            register_response: format!("elegoo/{serial}/{client_id}/register_response"),
            request: format!("elegoo/{serial}/{client_id}/api_request"),
            response: format!("elegoo/{serial}/{client_id}/api_response"),
            status: format!("elegoo/{serial}/api_status"),
        }
    }
}

// ── Wire shapes ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RegisterReply {
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    error: String,
}

#[derive(Debug, Deserialize)]
struct RpcFrame {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    method: Option<u32>,
    #[serde(default)]
    result: Value,
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

fn registration_outcome(reply: &RegisterReply) -> Result<(), Error> {
    match reply.error.trim() {
        "ok" => Ok(()),
        "too many clients" => Err(Error::TooManyClients),
        other => Err(Error::RegistrationRejected {
            reason: if other.is_empty() {
                "empty registration response".to_owned()
            } else {
                other.to_owned()
            },
        }),
    }
}

// ── Cc2State ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cc2State {
    Disconnected,
    Connecting,
    Registering,
    /// Registered with the heartbeat running.
    Registered,
}

// ── Cc2Client ────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Cc2Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: Cc2Config,
    client_id: String,
    topics: Cc2Topics,
    client: AsyncClient,
    pending: PendingRequests<u64, Value>,
    events: broadcast::Sender<Arc<TransportEvent>>,
    state: watch::Sender<Cc2State>,
    alive: AtomicBool,
    next_id: AtomicU64,
    registration: Mutex<Option<oneshot::Sender<RegisterReply>>>,
    last_pong: Mutex<Instant>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClientInner {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(Arc::new(event));
    }

    fn mark_dead(&self, reason: &str) {
        if self.alive.swap(false, Ordering::AcqRel) {
            let released = self.pending.fail_all();
            self.state.send_replace(Cc2State::Disconnected);
            warn!(serial = %self.config.serial, reason, released, "printer connection closed");
            self.emit(TransportEvent::Closed {
                reason: reason.to_owned(),
            });
            self.cancel.cancel();
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    fn on_publish(&self, topic: &str, payload: &[u8]) {
        if topic == self.topics.register_response {
            self.on_register_reply(payload);
            return;
        }

        let frame: RpcFrame = match serde_json::from_slice(payload) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(topic, error = %e, "dropping malformed CC2 frame");
                return;
            }
        };

        if topic == self.topics.response {
            if frame.kind.as_deref() == Some("PONG") {
                trace!("heartbeat pong");
                *self.last_pong.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
                return;
            }
            let (Some(id), Some(method)) = (frame.id, frame.method) else {
                debug!(topic, "response without id/method");
                return;
            };
            if !self.pending.resolve(&id, frame.result.clone()) {
                trace!(id, method, "response without a waiter");
            }
            self.emit(TransportEvent::Response {
                command: method,
                data: frame.result,
            });
        } else if topic == self.topics.status {
            match (frame.method, frame.id) {
                (Some(method::STATUS_PUSH), Some(seq)) => self.emit(TransportEvent::StatusDelta {
                    seq,
                    delta: frame.result,
                }),
                (method, _) => debug!(?method, "unexpected status frame"),
            }
        } else {
            debug!(topic, "unknown CC2 topic");
        }
    }

    fn on_register_reply(&self, payload: &[u8]) {
        let reply: RegisterReply = match serde_json::from_slice(payload) {
            Ok(reply) => reply,
            Err(e) => {
                debug!(error = %e, "dropping malformed registration response");
                return;
            }
        };
        if reply.client_id.as_deref().is_some_and(|id| id != self.client_id) {
            trace!("registration response for another client");
            return;
        }
        let slot = self
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match slot {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => debug!(error = %reply.error, "unsolicited registration response"),
        }
    }
}

impl Cc2Client {
    /// Connect to the printer's broker and register.
    ///
    /// Fails with [`Error::TooManyClients`], [`Error::RegistrationRejected`]
    /// or [`Error::RegistrationTimeout`] when registration does not succeed;
    /// nothing is left running in that case.
    ///
    /// Background tasks run under a child of `cancel`. Connection loss
    /// cancels only that child, so the owner's token stays live and the
    /// [`TransportEvent::Closed`] notification is still delivered.
    pub async fn connect(config: Cc2Config, cancel: CancellationToken) -> Result<Self, Error> {
        let client_id = format!("sdcp_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        let topics = Cc2Topics::new(&config.serial, &client_id);

        let mut options = MqttOptions::new(client_id.clone(), &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(true);
        options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
        if let Some(code) = &config.access_code {
            options.set_credentials(USERNAME, code.expose_secret());
        }

        let (client, eventloop) = AsyncClient::new(options, 64);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (state, _) = watch::channel(Cc2State::Connecting);

        info!(host = %config.host, serial = %config.serial, "connecting to printer broker");
        let inner = Arc::new(ClientInner {
            config,
            client_id,
            topics,
            client,
            pending: PendingRequests::new(),
            events,
            state,
            alive: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
            registration: Mutex::new(None),
            last_pong: Mutex::new(Instant::now()),
            cancel: cancel.child_token(),
            tasks: Mutex::new(Vec::new()),
        });

        let (connected_tx, connected_rx) = oneshot::channel();
        inner.track(tokio::spawn(poll_loop(Arc::clone(&inner), eventloop, connected_tx)));

        let this = Self { inner };
        if let Err(e) = this.register(connected_rx).await {
            this.disconnect().await;
            return Err(e);
        }

        *this.inner.last_pong.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
        this.inner.state.send_replace(Cc2State::Registered);
        this.inner
            .track(tokio::spawn(heartbeat_loop(Arc::clone(&this.inner))));
        info!(serial = %this.inner.config.serial, client_id = %this.inner.client_id, "registered with printer");
        Ok(this)
    }

    async fn register(&self, connected: oneshot::Receiver<Result<(), Error>>) -> Result<(), Error> {
        let inner = &self.inner;

        match tokio::time::timeout(inner.config.command_timeout, connected).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(Error::Mqtt("event loop exited before CONNACK".into())),
            Err(_) => return Err(Error::Mqtt("printer broker CONNACK timed out".into())),
        }

        for topic in [
            &inner.topics.response,
            &inner.topics.status,
            &inner.topics.register_response,
        ] {
            inner
                .client
                .subscribe(topic.clone(), QoS::AtMostOnce)
                .await
                .map_err(|e| Error::Mqtt(e.to_string()))?;
        }

        inner.state.send_replace(Cc2State::Registering);
        let (tx, rx) = oneshot::channel();
        *inner
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(tx);

        let request = json!({
            "client_id": inner.client_id,
            "request_id": uuid::Uuid::new_v4().simple().to_string(),
        });
        inner
            .client
            .publish(
                inner.topics.register.clone(),
                QoS::AtMostOnce,
                false,
                request.to_string(),
            )
            .await
            .map_err(|e| Error::Mqtt(e.to_string()))?;

        let timeout = inner.config.registration_timeout;
        let reply = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(Error::Disconnected),
            Err(_) => {
                return Err(Error::RegistrationTimeout {
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
        };
        registration_outcome(&reply).inspect_err(|e| warn!(error = %e, "registration refused"))
    }

    /// Issue an RPC. With `wait`, blocks until the matching response
    /// arrives or the command timeout elapses.
    pub async fn send_command(
        &self,
        method: u32,
        params: Value,
        wait: bool,
    ) -> Result<Option<Value>, Error> {
        let inner = &self.inner;
        if !inner.alive.load(Ordering::Acquire) || *inner.state.borrow() != Cc2State::Registered {
            return Err(Error::NotConnected);
        }

        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let waiter = wait.then(|| inner.pending.register(id));
        let payload = json!({ "id": id, "method": method, "params": params });

        debug!(id, method, "publishing CC2 command");
        let published = inner
            .client
            .publish(
                inner.topics.request.clone(),
                QoS::AtMostOnce,
                false,
                payload.to_string(),
            )
            .await;
        if let Err(e) = published {
            let reason = e.to_string();
            inner.mark_dead(&reason);
            return Err(Error::Connection(reason));
        }

        let Some(waiter) = waiter else {
            return Ok(None);
        };
        let result = waiter
            .wait(inner.config.command_timeout)
            .await
            .inspect_err(|e| {
                if matches!(e, Error::Timeout { .. }) {
                    warn!(id, method, "CC2 command timed out");
                }
            })?;
        match result.get("error_code").and_then(Value::as_i64) {
            None | Some(0) => Ok(Some(result)),
            Some(code) => Err(Error::Rejected {
                command: method,
                ack: code,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<TransportEvent>> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> watch::Receiver<Cc2State> {
        self.inner.state.subscribe()
    }

    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::Acquire)
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn serial(&self) -> &str {
        &self.inner.config.serial
    }

    pub fn topics(&self) -> &Cc2Topics {
        &self.inner.topics
    }

    pub async fn disconnect(&self) {
        if let Err(e) = self.inner.client.disconnect().await {
            debug!(error = %e, "MQTT disconnect request failed");
        }
        self.inner.mark_dead("disconnected by owner");
        self.inner.cancel.cancel();

        let handles: Vec<JoinHandle<()>> = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

// ── Background tasks ─────────────────────────────────────────────────

async fn poll_loop(
    inner: Arc<ClientInner>,
    mut eventloop: EventLoop,
    connected: oneshot::Sender<Result<(), Error>>,
) {
    let mut connected = Some(connected);

    let reason = loop {
        tokio::select! {
            biased;
            () = inner.cancel.cancelled() => break "cancelled".to_owned(),
            polled = eventloop.poll() => match polled {
                Ok(Event::Incoming(MqttPacket::ConnAck(_))) => {
                    if let Some(tx) = connected.take() {
                        let _ = tx.send(Ok(()));
                    }
                }
                Ok(Event::Incoming(MqttPacket::Publish(publish))) => {
                    inner.on_publish(&publish.topic, &publish.payload);
                }
                Ok(_) => {}
                Err(e) => {
                    let reason = e.to_string();
                    if let Some(tx) = connected.take() {
                        let _ = tx.send(Err(Error::Mqtt(reason.clone())));
                    }
                    break reason;
                }
            }
        }
    };
    inner.mark_dead(&reason);
}

async fn heartbeat_loop(inner: Arc<ClientInner>) {
    let period = inner.config.heartbeat_interval.max(Duration::from_millis(10));
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    let ping = json!({ "type": "PING" }).to_string();

    loop {
        tokio::select! {
            biased;
            () = inner.cancel.cancelled() => break,
            _ = interval.tick() => {
                let silent_for = inner
                    .last_pong
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .elapsed();
                if silent_for > inner.config.pong_timeout {
                    inner.mark_dead(&format!("no PONG for {}ms", silent_for.as_millis()));
                    break;
                }

                trace!("heartbeat ping");
                let sent = inner
                    .client
                    .publish(inner.topics.request.clone(), QoS::AtMostOnce, false, ping.clone())
                    .await;
                if let Err(e) = sent {
                    inner.mark_dead(&e.to_string());
                    break;
                }
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn topics_follow_serial_and_client() {
        let topics = Cc2Topics::new("SN1", "cli");
        assert_eq!(topics.register, "elegoo/SN1/api_register");
        assert_eq!(topics.register_response, "elegoo/SN1/cli/register_response");
        assert_eq!(topics.request, "elegoo/SN1/cli/api_request");
        assert_eq!(topics.response, "elegoo/SN1/cli/api_response");
        assert_eq!(topics.status, "elegoo/SN1/api_status");
    }

    #[test]
    fn registration_outcomes() {
        let reply = |error: &str| RegisterReply {
            client_id: None,
            error: error.to_owned(),
        };
        assert!(registration_outcome(&reply("ok")).is_ok());
        assert!(matches!(
            registration_outcome(&reply("too many clients")),
            Err(Error::TooManyClients)
        ));
        match registration_outcome(&reply("bad token")) {
            Err(Error::RegistrationRejected { reason }) => assert_eq!(reason, "bad token"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn rpc_frame_accepts_pong_and_push_shapes() {
        let pong: RpcFrame = serde_json::from_str(r#"{"type":"PONG"}"#).unwrap();
        assert_eq!(pong.kind.as_deref(), Some("PONG"));
        assert!(pong.id.is_none());

        let push: RpcFrame =
            serde_json::from_str(r#"{"id":42,"method":6000,"result":{"extruder":{"temperature":210}}}"#)
                .unwrap();
        assert_eq!(push.id, Some(42));
        assert_eq!(push.method, Some(method::STATUS_PUSH));
        assert_eq!(push.result["extruder"]["temperature"], 210);
    }

    #[test]
    fn default_config() {
        let config = Cc2Config::new("10.0.0.9", "SN1");
        assert_eq!(config.port, 1883);
        assert_eq!(config.registration_timeout, Duration::from_secs(5));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.pong_timeout, Duration::from_secs(30));
        assert!(config.access_code.is_none());
    }
}
