//! SDCP over a broker-mediated MQTT topic tree.
//!
//! The printer does not dial a broker on its own: it has to be told
//! over UDP (`M66666 <port>`) to connect to ours. Once it has joined,
//! requests go to `/sdcp/request/<id>` and replies, pushes, notices and
//! errors come back on their own `/sdcp/<kind>/<id>` topics with the same
//! JSON envelope the WebSocket transport uses.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet as MqttPacket, QoS};
use serde_json::{Value, json};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::broker::BrokerHandle;
use crate::error::Error;
use crate::event::TransportEvent;
use crate::sdcp::session::SdcpSession;
use crate::sdcp::{SdcpRequest, SdcpResponse, TopicKind, TopicStyle, command};

/// UDP port the printer listens on for the broker handshake.
pub const HANDSHAKE_PORT: u16 = 3000;
const MAX_PACKET_SIZE: usize = 1024 * 1024;
const JOIN_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

// ── SdcpMqttConfig ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SdcpMqttConfig {
    /// Printer address, target of the UDP handshake.
    pub printer_host: String,
    pub mainboard_id: String,
    /// Where our own client reaches the broker.
    pub broker_host: String,
    /// Port the printer is told to connect to.
    pub broker_port: u16,
    pub handshake_port: u16,
    /// Per-command response timeout. Default: 10s.
    pub command_timeout: Duration,
    /// How long to wait for the printer to join the broker. Default: 30s.
    pub join_timeout: Duration,
    /// Requested status push period. Default: 5s.
    pub status_period: Duration,
}

impl SdcpMqttConfig {
    pub fn new(
        printer_host: impl Into<String>,
        mainboard_id: impl Into<String>,
        broker_port: u16,
    ) -> Self {
        Self {
            printer_host: printer_host.into(),
            mainboard_id: mainboard_id.into(),
            broker_host: "127.0.0.1".into(),
            broker_port,
            handshake_port: HANDSHAKE_PORT,
            command_timeout: Duration::from_secs(10),
            join_timeout: Duration::from_secs(30),
            status_period: Duration::from_secs(5),
        }
    }
}

/// Ask a printer to connect to the broker on `broker_port`.
pub async fn send_broker_handshake(
    printer_host: &str,
    handshake_port: u16,
    broker_port: u16,
) -> Result<(), Error> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
    let message = format!("M66666 {broker_port}");
    socket
        .send_to(message.as_bytes(), (printer_host, handshake_port))
        .await?;
    debug!(printer = printer_host, broker_port, "sent broker handshake");
    Ok(())
}

// ── SdcpMqttClient ───────────────────────────────────────────────────

#[derive(Clone)]
pub struct SdcpMqttClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: SdcpMqttConfig,
    connection_id: String,
    session: SdcpSession,
    client: AsyncClient,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Keeps a shared embedded broker alive for as long as this session.
    _broker: Option<BrokerHandle>,
}

impl SdcpMqttClient {
    /// Connect to the broker, subscribe, hand the printer the broker
    /// address, and wait until it answers a status request.
    pub async fn connect(
        config: SdcpMqttConfig,
        broker: Option<BrokerHandle>,
        cancel: CancellationToken,
    ) -> Result<Self, Error> {
        let client_id = format!("sdcp-{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        let mut options = MqttOptions::new(client_id, &config.broker_host, config.broker_port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(true);
        options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

        let (client, eventloop) = AsyncClient::new(options, 64);
        let inner = Arc::new(ClientInner {
            session: SdcpSession::new(config.mainboard_id.clone()),
            connection_id: uuid::Uuid::new_v4().simple().to_string(),
            config,
            client,
            cancel: cancel.child_token(),
            tasks: Mutex::new(Vec::new()),
            _broker: broker,
        });

        let (connected_tx, connected_rx) = oneshot::channel();
        let poller = tokio::spawn(poll_loop(Arc::clone(&inner), eventloop, connected_tx));
        inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(poller);

        let this = Self { inner };
        if let Err(e) = this.establish(connected_rx).await {
            this.disconnect().await;
            return Err(e);
        }
        Ok(this)
    }

    async fn establish(&self, connected: oneshot::Receiver<Result<(), Error>>) -> Result<(), Error> {
        let config = &self.inner.config;

        match tokio::time::timeout(config.command_timeout, connected).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(Error::Mqtt("event loop exited before CONNACK".into())),
            Err(_) => return Err(Error::Mqtt("broker CONNACK timed out".into())),
        }

        for kind in [
            TopicKind::Response,
            TopicKind::Status,
            TopicKind::Attributes,
            TopicKind::Notice,
            TopicKind::Error,
        ] {
            let topic = kind.topic(TopicStyle::Mqtt, &config.mainboard_id);
            self.inner
                .client
                .subscribe(topic, QoS::AtMostOnce)
                .await
                .map_err(|e| Error::Mqtt(e.to_string()))?;
        }

        self.await_printer_join().await?;

        let period_ms = u64::try_from(config.status_period.as_millis()).unwrap_or(u64::MAX);
        self.send_command(command::STATUS_PERIOD, json!({ "TimePeriod": period_ms }), false)
            .await?;

        info!(mainboard_id = %config.mainboard_id, "printer joined broker");
        Ok(())
    }

    /// Repeat the handshake until the printer answers a status request.
    async fn await_printer_join(&self) -> Result<(), Error> {
        let config = &self.inner.config;
        let deadline = tokio::time::Instant::now() + config.join_timeout;
        let probe_timeout = config.command_timeout.min(JOIN_PROBE_TIMEOUT);

        loop {
            send_broker_handshake(&config.printer_host, config.handshake_port, config.broker_port)
                .await?;

            match self
                .request(command::STATUS, json!({}), true, probe_timeout)
                .await
            {
                Ok(_) => return Ok(()),
                Err(Error::Timeout { .. }) if tokio::time::Instant::now() < deadline => {
                    debug!(printer = %config.printer_host, "printer has not joined yet, retrying handshake");
                }
                Err(Error::Timeout { .. }) => {
                    return Err(Error::Connection(format!(
                        "printer {} did not join the broker within {}s",
                        config.printer_host,
                        config.join_timeout.as_secs()
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Issue a command. With `wait`, blocks until the matching response
    /// arrives or the command timeout elapses.
    pub async fn send_command(
        &self,
        cmd: u32,
        data: Value,
        wait: bool,
    ) -> Result<Option<SdcpResponse>, Error> {
        self.request(cmd, data, wait, self.inner.config.command_timeout)
            .await
    }

    async fn request(
        &self,
        cmd: u32,
        data: Value,
        wait: bool,
        timeout: Duration,
    ) -> Result<Option<SdcpResponse>, Error> {
        let inner = &self.inner;
        if !inner.session.is_alive() {
            return Err(Error::NotConnected);
        }

        let request = SdcpRequest::new(
            &inner.connection_id,
            &inner.config.mainboard_id,
            cmd,
            data,
            TopicStyle::Mqtt,
        );
        let waiter = wait.then(|| inner.session.pending.register(request.request_id().to_owned()));

        debug!(cmd, name = command::name(cmd), request_id = %request.request_id(), "publishing command");
        let published = inner
            .client
            .publish(request.topic.clone(), QoS::AtMostOnce, false, request.to_json())
            .await;
        if let Err(e) = published {
            let reason = e.to_string();
            inner.session.mark_dead(&reason);
            return Err(Error::Connection(reason));
        }

        match waiter {
            Some(waiter) => inner.session.finish(waiter, cmd, timeout).await.map(Some),
            None => Ok(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<TransportEvent>> {
        self.inner.session.subscribe()
    }

    pub fn is_alive(&self) -> bool {
        self.inner.session.is_alive()
    }

    pub fn mainboard_id(&self) -> &str {
        &self.inner.config.mainboard_id
    }

    pub async fn disconnect(&self) {
        if let Err(e) = self.inner.client.disconnect().await {
            debug!(error = %e, "MQTT disconnect request failed");
        }
        self.inner.cancel.cancel();
        self.inner.session.mark_dead("disconnected by owner");

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

// ── Event loop ───────────────────────────────────────────────────────

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
                    inner.session.dispatch(&publish.payload);
                }
                Ok(_) => {}
                Err(e) => {
                    // rumqttc would reconnect on the next poll; reconnecting is the owner's call.
                    let reason = e.to_string();
                    if let Some(tx) = connected.take() {
                        let _ = tx.send(Err(Error::Mqtt(reason.clone())));
                    } else {
                        warn!(error = %reason, "MQTT event loop failed");
                    }
                    break reason;
                }
            }
        }
    };
    inner.session.mark_dead(&reason);
}
