//! SDCP over WebSocket.
//!
//! Opens `ws://<host>:3030/websocket`, issues numbered commands, correlates
//! responses by `RequestID`, and pushes status/attributes/notice/error
//! frames through a [`tokio::sync::broadcast`] channel.
//!
//! The transport never reconnects on its own. When the socket dies it
//! releases every outstanding waiter, emits [`TransportEvent::Closed`],
//! and refuses further commands with [`Error::NotConnected`].
//!
//! # Example
//!
//! ```rust,ignore
//! use sdcp_api::websocket::{SdcpWsClient, SdcpWsConfig};
//! use sdcp_api::sdcp::command;
//! use tokio_util::sync::CancellationToken;
//!
//! let config = SdcpWsConfig::new("192.168.1.50", "f25273b12b094c5a8b9513a30ca60049");
//! let client = SdcpWsClient::connect(config, CancellationToken::new()).await?;
//! let mut events = client.subscribe();
//!
//! client.send_command(command::STATUS, serde_json::json!({}), false).await?;
//! while let Ok(event) = events.recv().await {
//!     println!("{}", event.kind());
//! }
//! ```

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::error::Error;
use crate::event::TransportEvent;
use crate::sdcp::session::SdcpSession;
use crate::sdcp::{SdcpRequest, SdcpResponse, TopicStyle, command};

pub const DEFAULT_PORT: u16 = 3030;
pub const WEBSOCKET_PATH: &str = "/websocket";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ── SdcpWsConfig ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SdcpWsConfig {
    pub host: String,
    pub port: u16,
    pub mainboard_id: String,
    /// Per-command response timeout. Default: 10s.
    pub command_timeout: Duration,
    /// Interval between text `ping` keep-alives. Default: 25s.
    pub keepalive_interval: Duration,
}

impl SdcpWsConfig {
    pub fn new(host: impl Into<String>, mainboard_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            mainboard_id: mainboard_id.into(),
            command_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(25),
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}:{}{WEBSOCKET_PATH}", self.host, self.port)
    }
}

// ── SdcpWsClient ─────────────────────────────────────────────────────

/// One live WebSocket session with one printer. Cheaply cloneable.
#[derive(Clone)]
pub struct SdcpWsClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: SdcpWsConfig,
    connection_id: String,
    session: SdcpSession,
    sink: tokio::sync::Mutex<SplitSink<WsStream, Message>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SdcpWsClient {
    /// Open the socket and spawn the listener and keep-alive tasks.
    ///
    /// `cancel` scopes the background tasks; cancelling it has the same
    /// effect as [`disconnect`](Self::disconnect) minus the close frame.
    pub async fn connect(config: SdcpWsConfig, cancel: CancellationToken) -> Result<Self, Error> {
        let url = config.url();
        info!(url = %url, "connecting to printer websocket");

        let (stream, _response) =
            tokio::time::timeout(config.command_timeout, tokio_tungstenite::connect_async(&url))
                .await
                .map_err(|_| Error::WebSocketConnect(format!("handshake with {url} timed out")))?
                .map_err(|e| Error::WebSocketConnect(e.to_string()))?;

        let (sink, read) = stream.split();
        let inner = Arc::new(ClientInner {
            session: SdcpSession::new(config.mainboard_id.clone()),
            connection_id: uuid::Uuid::new_v4().simple().to_string(),
            config,
            sink: tokio::sync::Mutex::new(sink),
            cancel: cancel.child_token(),
            tasks: Mutex::new(Vec::new()),
        });

        let reader = tokio::spawn(read_loop(Arc::clone(&inner), read));
        let keepalive = tokio::spawn(keepalive_loop(Arc::clone(&inner)));
        inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([reader, keepalive]);

        debug!(mainboard_id = %inner.config.mainboard_id, "printer websocket connected");
        Ok(Self { inner })
    }

    /// Issue a command. With `wait`, blocks until the matching response
    /// arrives or the command timeout elapses.
    pub async fn send_command(
        &self,
        cmd: u32,
        data: Value,
        wait: bool,
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
            TopicStyle::WebSocket,
        );
        let waiter = wait.then(|| inner.session.pending.register(request.request_id().to_owned()));

        debug!(
            cmd,
            name = command::name(cmd),
            request_id = %request.request_id(),
            "sending command"
        );

        let sent = inner
            .sink
            .lock()
            .await
            .send(Message::text(request.to_json()))
            .await;
        if let Err(e) = sent {
            let reason = e.to_string();
            inner.session.mark_dead(&reason);
            return Err(Error::Connection(reason));
        }

        match waiter {
            Some(waiter) => inner
                .session
                .finish(waiter, cmd, inner.config.command_timeout)
                .await
                .map(Some),
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

    pub fn pending_count(&self) -> usize {
        self.inner.session.pending.len()
    }

    /// Close the socket, release waiters, and join background tasks.
    pub async fn disconnect(&self) {
        {
            let mut sink = self.inner.sink.lock().await;
            let _ = sink.send(Message::Close(None)).await;
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

// ── Background tasks ─────────────────────────────────────────────────

async fn read_loop(inner: Arc<ClientInner>, mut read: SplitStream<WsStream>) {
    let reason = loop {
        tokio::select! {
            biased;
            () = inner.cancel.cancelled() => break "cancelled".to_owned(),
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => inner.session.dispatch(text.as_bytes()),
                Some(Ok(Message::Binary(bytes))) => inner.session.dispatch(&bytes),
                Some(Ok(Message::Close(frame))) => {
                    break frame.map_or_else(
                        || "close frame".to_owned(),
                        |cf| format!("close frame {}: {}", cf.code, cf.reason),
                    );
                }
                // Ping/Pong/raw frames: tungstenite answers pings itself.
                Some(Ok(_)) => {}
                Some(Err(e)) => break e.to_string(),
                None => break "stream ended".to_owned(),
            }
        }
    };
    inner.session.mark_dead(&reason);
}

async fn keepalive_loop(inner: Arc<ClientInner>) {
    let period = inner.config.keepalive_interval.max(Duration::from_millis(100));
    let mut interval = tokio::time::interval(period);
    interval.tick().await;

    loop {
        tokio::select! {
            biased;
            () = inner.cancel.cancelled() => break,
            _ = interval.tick() => {
                if !inner.session.is_alive() {
                    break;
                }
                trace!("keepalive ping");
                let sent = inner.sink.lock().await.send(Message::text("ping")).await;
                if let Err(e) = sent {
                    inner.session.mark_dead(&e.to_string());
                    break;
                }
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = SdcpWsConfig::new("10.0.0.5", "MB1");
        assert_eq!(config.url(), "ws://10.0.0.5:3030/websocket");
        assert_eq!(config.command_timeout, Duration::from_secs(10));
        assert_eq!(config.keepalive_interval, Duration::from_secs(25));
    }
}
