//! Embedded single-process MQTT broker.
//!
//! Serves the broker-mediated SDCP variant when no external broker is
//! around: the printer is told to connect to us, and our own client
//! connects to the same socket. Subscriptions are exact topic matches.
//! PUBLISH packets are fanned out verbatim to every other subscriber and
//! never echoed to the publisher.
//!
//! Lifetime is reference counted through [`BrokerManager::acquire`]: the
//! listener stays up while any [`BrokerHandle`] is alive and is torn down
//! when the last one drops.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::packet::{DEFAULT_MAX_PACKET_SIZE, MqttCodec, Packet};
use crate::error::Error;

pub const DEFAULT_BROKER_PORT: u16 = 1883;
const SESSION_QUEUE: usize = 256;

// ── BrokerConfig ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub bind: IpAddr,
    /// `0` picks an ephemeral port.
    pub port: u16,
    /// Packets above this size end the sending session.
    pub max_packet_size: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_BROKER_PORT,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

// ── Routing table ────────────────────────────────────────────────────

type SessionId = u64;

#[derive(Default)]
struct BrokerState {
    sessions: HashMap<SessionId, mpsc::Sender<Bytes>>,
    subscriptions: HashMap<String, HashSet<SessionId>>,
}

#[derive(Default)]
struct Router {
    state: Mutex<BrokerState>,
    next_id: AtomicU64,
}

impl Router {
    fn lock(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open(&self, tx: mpsc::Sender<Bytes>) -> SessionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().sessions.insert(id, tx);
        id
    }

    fn close(&self, id: SessionId) {
        let mut state = self.lock();
        state.sessions.remove(&id);
        state.subscriptions.retain(|_, subs| {
            subs.remove(&id);
            !subs.is_empty()
        });
    }

    fn subscribe(&self, id: SessionId, topic: String) {
        self.lock().subscriptions.entry(topic).or_default().insert(id);
    }

    fn unsubscribe(&self, id: SessionId, topic: &str) {
        let mut state = self.lock();
        if let Some(subs) = state.subscriptions.get_mut(topic) {
            subs.remove(&id);
            if subs.is_empty() {
                state.subscriptions.remove(topic);
            }
        }
    }

    /// Forward `raw` to every subscriber of `topic` except `from`.
    fn fan_out(&self, from: SessionId, topic: &str, raw: &Bytes) -> usize {
        let state = self.lock();
        let Some(subs) = state.subscriptions.get(topic) else {
            return 0;
        };
        let mut delivered = 0;
        for sid in subs.iter().filter(|sid| **sid != from) {
            if let Some(tx) = state.sessions.get(sid) {
                match tx.try_send(raw.clone()) {
                    Ok(()) => delivered += 1,
                    Err(e) => warn!(session = sid, topic, error = %e, "dropping publish for slow subscriber"),
                }
            }
        }
        delivered
    }

    fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }
}

// ── BrokerHandle ─────────────────────────────────────────────────────

/// A live reference to a running broker. Clone to share; the broker
/// stops when the last clone drops.
#[derive(Clone)]
pub struct BrokerHandle {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    local_addr: SocketAddr,
    router: Arc<Router>,
    cancel: CancellationToken,
}

impl Drop for BrokerInner {
    fn drop(&mut self) {
        self.cancel.cancel();
        info!(addr = %self.local_addr, "embedded broker stopped");
    }
}

impl BrokerHandle {
    /// Bind and start a broker that is not shared through a manager.
    pub async fn start(config: &BrokerConfig) -> Result<Self, Error> {
        let listener = TcpListener::bind((config.bind, config.port)).await?;
        let local_addr = listener.local_addr()?;
        let router = Arc::new(Router::default());
        let cancel = CancellationToken::new();

        let codec = MqttCodec::new(config.max_packet_size);
        tokio::spawn(accept_loop(listener, Arc::clone(&router), codec, cancel.clone()));
        info!(addr = %local_addr, "embedded broker listening");

        Ok(Self {
            inner: Arc::new(BrokerInner {
                local_addr,
                router,
                cancel,
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn port(&self) -> u16 {
        self.inner.local_addr.port()
    }

    /// Number of connected MQTT sessions.
    pub fn session_count(&self) -> usize {
        self.inner.router.session_count()
    }
}

// ── BrokerManager ────────────────────────────────────────────────────

/// Factory that hands out shared handles to one broker per manager.
pub struct BrokerManager {
    config: BrokerConfig,
    slot: tokio::sync::Mutex<Weak<BrokerInner>>,
}

impl BrokerManager {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            slot: tokio::sync::Mutex::new(Weak::new()),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Return a handle to the running broker, starting it if nobody holds one.
    pub async fn acquire(&self) -> Result<BrokerHandle, Error> {
        let mut slot = self.slot.lock().await;
        if let Some(inner) = slot.upgrade() {
            trace!(refs = Arc::strong_count(&inner), "reusing embedded broker");
            return Ok(BrokerHandle { inner });
        }
        let handle = BrokerHandle::start(&self.config).await?;
        *slot = Arc::downgrade(&handle.inner);
        Ok(handle)
    }

    /// Whether a broker is currently running for this manager.
    pub async fn is_running(&self) -> bool {
        self.slot.lock().await.strong_count() > 0
    }
}

// ── Connection handling ──────────────────────────────────────────────

async fn accept_loop(
    listener: TcpListener,
    router: Arc<Router>,
    codec: MqttCodec,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "broker connection accepted");
                    let router = Arc::clone(&router);
                    let cancel = cancel.child_token();
                    tokio::spawn(async move {
                        if let Err(e) = serve_session(stream, &router, codec, &cancel).await {
                            debug!(peer = %peer, error = %e, "broker session ended with error");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "broker accept failed"),
            }
        }
    }
}

async fn serve_session(
    stream: TcpStream,
    router: &Router,
    codec: MqttCodec,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let (read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<Bytes>(SESSION_QUEUE);
    let id = router.open(tx.clone());

    let writer_cancel = cancel.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                () = writer_cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(bytes) => {
                        if write_half.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
        let _ = write_half.shutdown().await;
    });

    let result = read_session(read_half, codec, id, router, &tx, cancel).await;

    // Dropping the last sender lets the writer drain and exit.
    router.close(id);
    drop(tx);
    let _ = writer.await;
    trace!(session = id, "broker session closed");
    result
}

async fn read_session(
    read_half: tokio::net::tcp::OwnedReadHalf,
    codec: MqttCodec,
    id: SessionId,
    router: &Router,
    tx: &mpsc::Sender<Bytes>,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let mut frames = FramedRead::new(read_half, codec);

    loop {
        let frame = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(()),
            next = frames.next() => match next {
                Some(frame) => frame?,
                None => return Ok(()),
            },
        };

        let reply = match frame.packet {
            Packet::Connect(connect) => {
                debug!(session = id, client_id = %connect.client_id, "CONNECT");
                Some(Packet::ConnAck {
                    session_present: false,
                    code: 0,
                })
            }
            Packet::Subscribe { packet_id, topics } => {
                let codes = topics.iter().map(|(_, qos)| (*qos).min(1)).collect();
                for (topic, _) in topics {
                    debug!(session = id, topic = %topic, "SUBSCRIBE");
                    router.subscribe(id, topic);
                }
                Some(Packet::SubAck { packet_id, codes })
            }
            Packet::Unsubscribe { packet_id, topics } => {
                for topic in &topics {
                    router.unsubscribe(id, topic);
                }
                Some(Packet::UnsubAck { packet_id })
            }
            Packet::Publish(publish) => {
                let delivered = router.fan_out(id, &publish.topic, &frame.raw);
                trace!(session = id, topic = %publish.topic, delivered, "PUBLISH");
                match (publish.qos, publish.packet_id) {
                    (1.., Some(packet_id)) => Some(Packet::PubAck { packet_id }),
                    _ => None,
                }
            }
            Packet::PingReq => Some(Packet::PingResp),
            Packet::Disconnect => {
                debug!(session = id, "DISCONNECT");
                return Ok(());
            }
            // Acks from subscribers for verbatim QoS 1 fan-out, and anything else.
            Packet::PubAck { .. }
            | Packet::ConnAck { .. }
            | Packet::SubAck { .. }
            | Packet::UnsubAck { .. }
            | Packet::PingResp
            | Packet::Other { .. } => None,
        };

        if let Some(reply) = reply {
            if tx.send(reply.to_bytes()?).await.is_err() {
                return Ok(());
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
