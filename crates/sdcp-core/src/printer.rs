// ── Printer facade ──
//
// Full lifecycle for one printer connection, whatever the transport.
// Connects, bridges transport events into the `PrinterStore`, schedules
// history backfill and delta resyncs, and executes typed commands.

use std::sync::{Arc, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use sdcp_api::mqtt::cc2::method;
use sdcp_api::sdcp::command as cmd;
use sdcp_api::{
    BrokerConfig, BrokerManager, Cc2Client, Cc2Config, SdcpMqttClient, SdcpMqttConfig,
    SdcpWsClient, SdcpWsConfig, TransportEvent,
};

use crate::cc2_state::{Cc2StatusCache, DeltaOutcome};
use crate::command::{Command, CommandResult};
use crate::config::PrinterConfig;
use crate::convert;
use crate::error::CoreError;
use crate::model::{
    Attributes, Device, PrintHistoryEntry, StatusSnapshot, TransportKind,
};
use crate::store::PrinterStore;
use crate::stream::StatusStream;

const RAW_EVENT_CHANNEL_SIZE: usize = 256;

// ── ConnectionState ──────────────────────────────────────────────────

/// Connection state observable by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Inverted MQTT only: waiting for the printer to accept us.
    Registering,
    Connected,
    /// The transport died; the owner decides whether to reconnect.
    Failed,
}

// ── Link ─────────────────────────────────────────────────────────────

/// The live transport of one session.
#[derive(Clone)]
enum Link {
    WebSocket(SdcpWsClient),
    Mqtt(SdcpMqttClient),
    Cc2(Cc2Client),
}

impl Link {
    fn kind(&self) -> TransportKind {
        match self {
            Self::WebSocket(_) => TransportKind::WebSocket,
            Self::Mqtt(_) => TransportKind::MqttStandard,
            Self::Cc2(_) => TransportKind::MqttInverted,
        }
    }

    /// Send and return the response body: `Data.Data` for SDCP, `result`
    /// for inverted MQTT.
    async fn send(
        &self,
        command: u32,
        data: Value,
        wait: bool,
    ) -> Result<Option<Value>, sdcp_api::Error> {
        match self {
            Self::WebSocket(c) => Ok(c.send_command(command, data, wait).await?.map(|r| r.data)),
            Self::Mqtt(c) => Ok(c.send_command(command, data, wait).await?.map(|r| r.data)),
            Self::Cc2(c) => c.send_command(command, data, wait).await,
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<Arc<TransportEvent>> {
        match self {
            Self::WebSocket(c) => c.subscribe(),
            Self::Mqtt(c) => c.subscribe(),
            Self::Cc2(c) => c.subscribe(),
        }
    }

    fn is_alive(&self) -> bool {
        match self {
            Self::WebSocket(c) => c.is_alive(),
            Self::Mqtt(c) => c.is_alive(),
            Self::Cc2(c) => c.is_alive(),
        }
    }

    async fn disconnect(&self) {
        match self {
            Self::WebSocket(c) => c.disconnect().await,
            Self::Mqtt(c) => c.disconnect().await,
            Self::Cc2(c) => c.disconnect().await,
        }
    }
}

// ── Printer ──────────────────────────────────────────────────────────

/// The consumer-facing handle for one printer.
///
/// Cheaply cloneable via `Arc<PrinterInner>`. A `Printer` outlives its
/// connections: every [`connect()`](Self::connect) builds a fresh
/// transport session, and a dead session is never resurrected.
#[derive(Clone)]
pub struct Printer {
    inner: Arc<PrinterInner>,
}

struct PrinterInner {
    config: PrinterConfig,
    store: Arc<PrinterStore>,
    connection_state: watch::Sender<ConnectionState>,
    raw_tx: broadcast::Sender<Arc<TransportEvent>>,
    link: Mutex<Option<Link>>,
    cc2_cache: std::sync::Mutex<Cc2StatusCache>,
    broker: Arc<BrokerManager>,
    cancel: CancellationToken,
    session: Mutex<Option<CancellationToken>>,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Printer {
    /// Create a printer handle. Does NOT connect.
    pub fn new(config: PrinterConfig) -> Self {
        Self::with_broker(config, Arc::new(BrokerManager::new(BrokerConfig::default())))
    }

    /// Create a printer handle that shares `broker` with other printers.
    /// Only broker-mediated MQTT printers use it.
    pub fn with_broker(config: PrinterConfig, broker: Arc<BrokerManager>) -> Self {
        let (connection_state, _) = watch::channel(ConnectionState::Disconnected);
        let (raw_tx, _) = broadcast::channel(RAW_EVENT_CHANNEL_SIZE);
        let threshold = config.resync_threshold;
        Self {
            inner: Arc::new(PrinterInner {
                config,
                store: Arc::new(PrinterStore::new()),
                connection_state,
                raw_tx,
                link: Mutex::new(None),
                cc2_cache: std::sync::Mutex::new(Cc2StatusCache::new(threshold)),
                broker,
                cancel: CancellationToken::new(),
                session: Mutex::new(None),
                task_handles: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn device(&self) -> &Device {
        &self.inner.config.device
    }

    pub fn config(&self) -> &PrinterConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<PrinterStore> {
        &self.inner.store
    }

    // ── Connection lifecycle ─────────────────────────────────────

    /// Open a new session, replacing any previous one.
    ///
    /// Subscribes to the transport before asking for the initial status
    /// and attributes, so no early push is missed.
    pub async fn connect(&self) -> Result<(), CoreError> {
        self.teardown().await;

        let inner = &self.inner;
        inner.connection_state.send_replace(ConnectionState::Connecting);
        inner.store.reset();
        *inner
            .cc2_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner) =
            Cc2StatusCache::new(inner.config.resync_threshold);

        let session = inner.cancel.child_token();
        let link = match self.open_link(session.clone()).await {
            Ok(link) => link,
            Err(e) => {
                inner.connection_state.send_replace(ConnectionState::Failed);
                warn!(device = %inner.config.device.id, error = %e, "connect failed");
                return Err(e);
            }
        };

        let events = link.subscribe();
        let bridge = tokio::spawn(bridge_task(
            Arc::clone(inner),
            link.clone(),
            events,
            session.clone(),
        ));
        inner.task_handles.lock().await.push(bridge);
        *inner.link.lock().await = Some(link.clone());
        *inner.session.lock().await = Some(session);

        if let Err(e) = self.request_initial_state(&link).await {
            warn!(device = %inner.config.device.id, error = %e, "initial state request failed");
            self.teardown().await;
            inner.connection_state.send_replace(ConnectionState::Failed);
            return Err(e);
        }

        inner.connection_state.send_replace(ConnectionState::Connected);
        info!(
            device = %inner.config.device.id,
            transport = %link.kind(),
            "connected to printer"
        );
        Ok(())
    }

    /// Close the session and release every outstanding waiter.
    pub async fn disconnect(&self) {
        self.teardown().await;
        self.inner
            .connection_state
            .send_replace(ConnectionState::Disconnected);
        debug!(device = %self.inner.config.device.id, "disconnected");
    }

    /// Connect, run `f`, disconnect.
    pub async fn oneshot<F, Fut, T>(config: PrinterConfig, f: F) -> Result<T, CoreError>
    where
        F: FnOnce(Printer) -> Fut,
        Fut: std::future::Future<Output = Result<T, CoreError>>,
    {
        let printer = Printer::new(config);
        printer.connect().await?;
        let result = f(printer.clone()).await;
        printer.disconnect().await;
        result
    }

    async fn open_link(&self, session: CancellationToken) -> Result<Link, CoreError> {
        let config = &self.inner.config;
        let device = &config.device;
        let host = device.host.clone();
        let with_host = |e: sdcp_api::Error| match CoreError::from(e) {
            CoreError::ConnectionFailed { reason, .. } => CoreError::ConnectionFailed {
                host: host.clone(),
                reason,
            },
            other => other,
        };

        match device.transport {
            TransportKind::WebSocket => {
                let mut ws = SdcpWsConfig::new(&device.host, &device.id);
                ws.command_timeout = config.command_timeout;
                if let Some(port) = config.port {
                    ws.port = port;
                }
                let client = SdcpWsClient::connect(ws, session).await.map_err(with_host)?;
                Ok(Link::WebSocket(client))
            }
            TransportKind::MqttStandard => {
                let broker = self.inner.broker.acquire().await.map_err(with_host)?;
                let mut mqtt = SdcpMqttConfig::new(&device.host, &device.id, broker.port());
                mqtt.command_timeout = config.command_timeout;
                mqtt.join_timeout = config.join_timeout;
                mqtt.status_period = config.status_period;
                if let Some(port) = config.port {
                    mqtt.handshake_port = port;
                }
                let client = SdcpMqttClient::connect(mqtt, Some(broker), session)
                    .await
                    .map_err(with_host)?;
                Ok(Link::Mqtt(client))
            }
            TransportKind::MqttInverted => {
                self.inner
                    .connection_state
                    .send_replace(ConnectionState::Registering);
                let mut cc2 = Cc2Config::new(&device.host, &device.id);
                cc2.command_timeout = config.command_timeout;
                cc2.registration_timeout = config.registration_timeout;
                cc2.heartbeat_interval = config.heartbeat_interval;
                cc2.pong_timeout = config.pong_timeout;
                cc2.access_code.clone_from(&config.access_code);
                if let Some(port) = config.port {
                    cc2.port = port;
                }
                let client = Cc2Client::connect(cc2, session).await.map_err(with_host)?;
                Ok(Link::Cc2(client))
            }
        }
    }

    async fn request_initial_state(&self, link: &Link) -> Result<(), CoreError> {
        match link {
            // RPC replies carry the documents themselves; the bridge applies them.
            Link::Cc2(_) => {
                link.send(method::STATUS, json!({}), true).await?;
                link.send(method::ATTRIBUTES, json!({}), true).await?;
            }
            Link::WebSocket(_) | Link::Mqtt(_) => {
                link.send(cmd::STATUS, json!({}), false).await?;
                link.send(cmd::ATTRIBUTES, json!({}), false).await?;
            }
        }
        Ok(())
    }

    /// Cancel the session, close the transport, and join background tasks.
    async fn teardown(&self) {
        let inner = &self.inner;
        if let Some(session) = inner.session.lock().await.take() {
            session.cancel();
        }
        let link = inner.link.lock().await.take();
        if let Some(link) = link {
            link.disconnect().await;
        }
        let handles: Vec<JoinHandle<()>> = inner.task_handles.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn current_link(&self) -> Result<Link, CoreError> {
        self.inner
            .link
            .lock()
            .await
            .as_ref()
            .filter(|link| link.is_alive())
            .cloned()
            .ok_or(CoreError::NotConnected)
    }

    // ── Commands ─────────────────────────────────────────────────

    /// Send a raw transport command. `command` is an SDCP `Cmd` or an
    /// inverted-MQTT method, depending on the transport.
    pub async fn send_command(
        &self,
        command: u32,
        data: Value,
        wait: bool,
    ) -> Result<Option<Value>, CoreError> {
        let link = self.current_link().await?;
        Ok(link.send(command, data, wait).await?)
    }

    /// Execute a typed command. Numeric inputs are clamped first.
    pub async fn execute(&self, command: Command) -> Result<CommandResult, CoreError> {
        let link = self.current_link().await?;
        let command = command.clamped();
        let (id, params) = match link.kind() {
            TransportKind::MqttInverted => command.to_cc2(),
            TransportKind::WebSocket | TransportKind::MqttStandard => command.to_sdcp(),
        };
        let timeout = self.inner.config.command_timeout;
        debug!(device = %self.inner.config.device.id, command = command.name(), id, "executing command");

        match command {
            Command::RefreshStatus => {
                let mut rx = self.inner.store.subscribe_status();
                rx.borrow_and_update();
                link.send(id, params, true).await?;
                wait_for_change(&mut rx, timeout).await?;
                Ok(CommandResult::Status(self.status()))
            }
            Command::RefreshAttributes => {
                let mut rx = self.inner.store.subscribe_attributes();
                rx.borrow_and_update();
                link.send(id, params, true).await?;
                wait_for_change(&mut rx, timeout).await?;
                Ok(CommandResult::Attributes(self.attributes()))
            }
            Command::ListHistory => {
                let mut rx = self.inner.store.subscribe_history();
                let reply = link.send(id, params, true).await?.unwrap_or_default();
                let ids = match link.kind() {
                    TransportKind::MqttInverted => convert::cc2_history_ids(&reply),
                    _ => convert::sdcp_history_ids(&reply),
                };
                self.wait_for_details(&mut rx, &ids, timeout).await;
                Ok(CommandResult::History(self.history()))
            }
            Command::HistoryDetail { ref task_ids } => {
                let reply = link.send(id, params, true).await?.unwrap_or_default();
                let entries = match link.kind() {
                    TransportKind::MqttInverted => convert::cc2_history_details(&reply),
                    _ => convert::sdcp_history_details(&reply),
                };
                for entry in entries {
                    self.inner.store.history.backfill(entry);
                }
                let fetched = task_ids
                    .iter()
                    .filter_map(|id| self.inner.store.history_entry(id))
                    .collect();
                Ok(CommandResult::History(Arc::new(fetched)))
            }
            Command::SetVideo { enable } => {
                let reply = link.send(id, params, true).await?.unwrap_or_default();
                let url = enable.then(|| video_url(&reply)).flatten();
                self.inner.store.set_video_url(url.clone());
                Ok(CommandResult::VideoUrl(url))
            }
            Command::Pause
            | Command::Resume
            | Command::Stop
            | Command::SetFanSpeed { .. }
            | Command::SetPrintSpeed { .. }
            | Command::SetNozzleTemp { .. }
            | Command::SetBedTemp { .. }
            | Command::SetLight { .. } => {
                link.send(id, params, true).await?;
                Ok(CommandResult::Accepted)
            }
        }
    }

    /// Wait until every id has its detail or the timeout elapses. The
    /// bridge does the fetching; a partial result is not an error.
    async fn wait_for_details(
        &self,
        rx: &mut watch::Receiver<Arc<Vec<Arc<PrintHistoryEntry>>>>,
        ids: &[String],
        timeout: Duration,
    ) {
        let complete = |store: &PrinterStore| {
            ids.iter()
                .all(|id| store.history_entry(id).is_some_and(|e| e.has_detail))
        };
        let deadline = tokio::time::Instant::now() + timeout;
        while !complete(&self.inner.store) {
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) | Err(_) => {
                    debug!(ids = ids.len(), "history detail incomplete at deadline");
                    break;
                }
            }
        }
    }

    // ── State observation ────────────────────────────────────────

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection_state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connection_state.borrow() == ConnectionState::Connected
    }

    /// Every transport event of the current session, re-broadcast.
    pub fn subscribe_raw(&self) -> broadcast::Receiver<Arc<TransportEvent>> {
        self.inner.raw_tx.subscribe()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<Option<Arc<StatusSnapshot>>> {
        self.inner.store.subscribe_status()
    }

    pub fn status_stream(&self) -> StatusStream {
        StatusStream::new(self.inner.store.subscribe_status())
    }

    // ── Snapshot accessors (delegate to PrinterStore) ────────────

    pub fn status(&self) -> Option<Arc<StatusSnapshot>> {
        self.inner.store.status()
    }

    pub fn attributes(&self) -> Option<Arc<Attributes>> {
        self.inner.store.attributes()
    }

    pub fn history(&self) -> Arc<Vec<Arc<PrintHistoryEntry>>> {
        self.inner.store.history()
    }

    pub fn video_url(&self) -> Option<Arc<String>> {
        self.inner.store.video_url()
    }
}

async fn wait_for_change<T>(rx: &mut watch::Receiver<T>, timeout: Duration) -> Result<(), CoreError> {
    match tokio::time::timeout(timeout, rx.changed()).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(CoreError::NotConnected),
        Err(_) => Err(CoreError::Timeout {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}

fn video_url(reply: &Value) -> Option<String> {
    reply
        .get("VideoUrl")
        .or_else(|| reply.get("url"))
        .and_then(Value::as_str)
        .filter(|url| !url.is_empty())
        .map(str::to_owned)
}

// ── Background bridge ────────────────────────────────────────────────

/// Consume transport events for one session and apply them to the store.
async fn bridge_task(
    inner: Arc<PrinterInner>,
    link: Link,
    mut events: broadcast::Receiver<Arc<TransportEvent>>,
    session: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            () = session.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(event) => {
                let _ = inner.raw_tx.send(Arc::clone(&event));
                if !apply_event(&inner, &link, &session, &event) {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "printer event bridge lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    trace!(device = %inner.config.device.id, "event bridge stopped");
}

/// Apply one event. Returns `false` once the transport is dead.
fn apply_event(
    inner: &Arc<PrinterInner>,
    link: &Link,
    session: &CancellationToken,
    event: &TransportEvent,
) -> bool {
    let store = &inner.store;
    match event {
        TransportEvent::Status(status) => {
            store.set_status(convert::sdcp_snapshot(status, inner.config.device.class));
        }
        TransportEvent::StatusDelta { seq, delta } => {
            let (outcome, snapshot) = {
                let mut cache = inner
                    .cc2_cache
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                let outcome = cache.apply_delta(*seq, delta);
                let snapshot = (outcome != DeltaOutcome::Stale)
                    .then(|| convert::cc2_snapshot(cache.doc()));
                (outcome, snapshot)
            };
            if let Some(snapshot) = snapshot {
                store.set_status(snapshot);
            }
            if outcome == DeltaOutcome::ResyncRequired {
                info!(device = %inner.config.device.id, seq, "status deltas out of sequence, requesting full status");
                spawn_scoped(session, {
                    let link = link.clone();
                    async move {
                        if let Err(e) = link.send(method::STATUS, json!({}), false).await {
                            warn!(error = %e, "full status resync request failed");
                        }
                    }
                });
            }
        }
        TransportEvent::Attributes(attributes) => {
            store.set_attributes(convert::sdcp_attributes(attributes));
        }
        TransportEvent::Response { command, data } => match link {
            Link::Cc2(_) => apply_cc2_response(inner, link, session, *command, data),
            Link::WebSocket(_) | Link::Mqtt(_) => {
                apply_sdcp_response(inner, link, session, *command, data);
            }
        },
        TransportEvent::Notice(_) | TransportEvent::Error(_) => {}
        TransportEvent::Closed { reason } => {
            warn!(device = %inner.config.device.id, reason = %reason, "printer connection lost");
            inner.connection_state.send_replace(ConnectionState::Failed);
            return false;
        }
    }
    true
}

fn apply_sdcp_response(
    inner: &Arc<PrinterInner>,
    link: &Link,
    session: &CancellationToken,
    command: u32,
    data: &Value,
) {
    match command {
        cmd::HISTORY_LIST => {
            let ids = convert::sdcp_history_ids(data);
            schedule_backfill(inner, link, session, &ids, cmd::HISTORY_DETAIL, "Id");
        }
        cmd::HISTORY_DETAIL => {
            for entry in convert::sdcp_history_details(data) {
                inner.store.history.backfill(entry);
            }
        }
        cmd::VIDEO_STREAM => {
            if let Some(url) = video_url(data) {
                inner.store.set_video_url(Some(url));
            }
        }
        _ => trace!(command, "response needs no store update"),
    }
}

fn apply_cc2_response(
    inner: &Arc<PrinterInner>,
    link: &Link,
    session: &CancellationToken,
    command: u32,
    result: &Value,
) {
    match command {
        method::STATUS => {
            let snapshot = {
                let mut cache = inner
                    .cc2_cache
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                cache.apply_full(result);
                convert::cc2_snapshot(cache.doc())
            };
            inner.store.set_status(snapshot);
        }
        method::ATTRIBUTES => inner.store.set_attributes(convert::cc2_attributes(result)),
        method::HISTORY_LIST => {
            let ids = convert::cc2_history_ids(result);
            schedule_backfill(inner, link, session, &ids, method::HISTORY_DETAIL, "id");
        }
        method::HISTORY_DETAIL => {
            for entry in convert::cc2_history_details(result) {
                inner.store.history.backfill(entry);
            }
        }
        method::VIDEO_STREAM => {
            if let Some(url) = video_url(result) {
                inner.store.set_video_url(Some(url));
            }
        }
        _ => trace!(command, "response needs no store update"),
    }
}

/// Seed bare entries and fetch details for the ids nobody is fetching yet.
fn schedule_backfill(
    inner: &Arc<PrinterInner>,
    link: &Link,
    session: &CancellationToken,
    ids: &[String],
    detail_command: u32,
    id_key: &str,
) {
    let history = &inner.store.history;
    history.seed(ids.iter().cloned());
    let claimed = history.claim(ids);
    if claimed.is_empty() {
        return;
    }
    debug!(count = claimed.len(), "fetching history detail");

    let inner = Arc::clone(inner);
    let link = link.clone();
    let params = json!({ id_key: claimed });
    spawn_scoped(session, async move {
        // The bridge backfills from the response event.
        if let Err(e) = link.send(detail_command, params, true).await {
            warn!(error = %e, "history detail fetch failed");
        }
        inner.store.history.release(&claimed);
    });
}

fn spawn_scoped<F>(session: &CancellationToken, fut: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let session = session.clone();
    tokio::spawn(async move {
        tokio::select! {
            () = session.cancelled() => {}
            () = fut => {}
        }
    });
}
