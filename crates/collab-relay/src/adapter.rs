//! A single relayed collaboration socket.

use crate::backoff::ReconnectBackoff;
use crate::error::{RelayError, Result};
use crate::frame::{classify_inbound, encode_outbound};
use crate::proxy::{AdapterKey, RelayConfig, RelayEvent, RelayEventKind};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;

/// Socket state of an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

/// What to do with a `disconnect` request from the surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectDecision {
    /// Mount/unmount churn from the UI layer; keep the socket.
    Ignore,
    Close,
}

impl DisconnectDecision {
    /// A socket that never opened, or opened less than `threshold` ago, is
    /// kept: closing it would break the session the surface is about to use.
    pub fn evaluate(
        state: ConnectionState,
        created_at: Instant,
        now: Instant,
        threshold: Duration,
    ) -> Self {
        if state != ConnectionState::Connected {
            return Self::Ignore;
        }
        if now.saturating_duration_since(created_at) < threshold {
            return Self::Ignore;
        }
        Self::Close
    }
}

/// Result of relaying surface data to the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    NotOpen,
    Failed,
}

/// One relayed socket plus its reconnect supervisor.
pub struct CollabAdapter {
    key: AdapterKey,
    url: Url,
    config: RelayConfig,
    created_at: Instant,
    state: Arc<RwLock<ConnectionState>>,
    writer: Arc<Mutex<Option<WsWriter>>>,
    backoff: Arc<Mutex<ReconnectBackoff>>,
    closing: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<RelayEvent>,
    supervisor: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl CollabAdapter {
    pub fn new(
        key: AdapterKey,
        url: &str,
        config: RelayConfig,
        events: mpsc::UnboundedSender<RelayEvent>,
    ) -> Result<Self> {
        let parsed_url = Url::parse(url)?;
        if parsed_url.scheme() != "ws" && parsed_url.scheme() != "wss" {
            return Err(RelayError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                parsed_url.scheme()
            )));
        }

        let backoff = ReconnectBackoff::new(config.reconnect_floor, config.reconnect_cap);
        Ok(Self {
            key,
            url: parsed_url,
            config,
            created_at: Instant::now(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            writer: Arc::new(Mutex::new(None)),
            backoff: Arc::new(Mutex::new(backoff)),
            closing: Arc::new(AtomicBool::new(false)),
            events,
            supervisor: Mutex::new(None),
        })
    }

    pub fn key(&self) -> &AdapterKey {
        &self.key
    }

    pub fn url(&self) -> &str {
        self.url.as_str()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Spawn the connect/read/reconnect loop.
    pub async fn start(self: &Arc<Self>) {
        let adapter = Arc::clone(self);
        let task = tokio::spawn(async move { adapter.supervise().await });
        if let Some(previous) = self.supervisor.lock().await.replace(task) {
            previous.abort();
        }
    }

    pub async fn disconnect_decision(&self, now: Instant) -> DisconnectDecision {
        DisconnectDecision::evaluate(
            self.state().await,
            self.created_at,
            now,
            self.config.disconnect_debounce,
        )
    }

    /// Relay surface data to the socket. Never fails; a closed socket is a
    /// logged no-op.
    pub async fn send(&self, data: &Value) -> SendOutcome {
        if self.state().await != ConnectionState::Connected {
            warn!(adapter_id = %self.key.adapter_id, "dropping relay message: socket not open");
            return SendOutcome::NotOpen;
        }

        let message = encode_outbound(data).into_message();
        let mut writer_guard = self.writer.lock().await;
        let Some(writer) = writer_guard.as_mut() else {
            warn!(adapter_id = %self.key.adapter_id, "dropping relay message: no writer");
            return SendOutcome::NotOpen;
        };
        match writer.send(message).await {
            Ok(()) => SendOutcome::Sent,
            Err(error) => {
                warn!(adapter_id = %self.key.adapter_id, "websocket write error: {}", error);
                self.emit(RelayEventKind::Error(error.to_string()));
                SendOutcome::Failed
            }
        }
    }

    /// Close the socket for good; no reconnect follows.
    pub async fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        if let Some(mut writer) = self.writer.lock().await.take()
            && let Err(error) = writer.send(Message::Close(None)).await
        {
            debug!(adapter_id = %self.key.adapter_id, "close frame not delivered: {}", error);
        }
        if let Some(task) = self.supervisor.lock().await.take() {
            task.abort();
        }
        *self.state.write().await = ConnectionState::Disconnected;
        self.emit(RelayEventKind::Closed);
    }

    async fn supervise(self: Arc<Self>) {
        loop {
            if self.closing.load(Ordering::SeqCst) {
                break;
            }
            *self.state.write().await = ConnectionState::Connecting;

            match timeout(self.config.connect_timeout, connect_async(self.url.as_str())).await {
                Ok(Ok((stream, _response))) => {
                    let (writer, reader) = stream.split();
                    *self.writer.lock().await = Some(writer);
                    self.backoff.lock().await.reset();
                    *self.state.write().await = ConnectionState::Connected;
                    self.emit(RelayEventKind::Status(ConnectionState::Connected));
                    self.pump(reader).await;
                    self.writer.lock().await.take();
                }
                Ok(Err(error)) => {
                    warn!(adapter_id = %self.key.adapter_id, url = %self.url, "websocket connect failed: {}", error);
                    self.emit(RelayEventKind::Error(error.to_string()));
                }
                Err(_) => {
                    let message = format!(
                        "connection timeout after {:?}",
                        self.config.connect_timeout
                    );
                    warn!(adapter_id = %self.key.adapter_id, url = %self.url, "{}", message);
                    self.emit(RelayEventKind::Error(message));
                }
            }

            *self.state.write().await = ConnectionState::Disconnected;
            if self.closing.load(Ordering::SeqCst) {
                break;
            }
            self.emit(RelayEventKind::Status(ConnectionState::Disconnected));

            let delay = self.backoff.lock().await.next_delay();
            debug!(adapter_id = %self.key.adapter_id, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
            tokio::time::sleep(delay).await;
        }
    }

    async fn pump(&self, mut reader: futures_util::stream::SplitStream<WsStream>) {
        while let Some(frame) = reader.next().await {
            match frame {
                Ok(Message::Close(_)) => break,
                Ok(message) => {
                    if let Some(payload) = classify_inbound(message) {
                        self.emit(RelayEventKind::Payload(payload));
                    }
                }
                Err(error) => {
                    warn!(adapter_id = %self.key.adapter_id, "websocket read error: {}", error);
                    self.emit(RelayEventKind::Error(error.to_string()));
                    break;
                }
            }
        }
    }

    fn emit(&self, kind: RelayEventKind) {
        let event = RelayEvent {
            key: self.key.clone(),
            kind,
        };
        if self.events.send(event).is_err() {
            debug!(adapter_id = %self.key.adapter_id, "relay event receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLD: Duration = Duration::from_millis(1_000);

    #[test]
    fn early_disconnect_is_ignored() {
        let created = Instant::now();
        let decision = DisconnectDecision::evaluate(
            ConnectionState::Connected,
            created,
            created + Duration::from_millis(500),
            THRESHOLD,
        );
        assert_eq!(decision, DisconnectDecision::Ignore);
    }

    #[test]
    fn settled_disconnect_closes() {
        let created = Instant::now();
        let decision = DisconnectDecision::evaluate(
            ConnectionState::Connected,
            created,
            created + Duration::from_millis(1_500),
            THRESHOLD,
        );
        assert_eq!(decision, DisconnectDecision::Close);
    }

    #[test]
    fn unopened_socket_is_never_closed_by_disconnect() {
        let created = Instant::now();
        for state in [ConnectionState::Connecting, ConnectionState::Disconnected] {
            let decision = DisconnectDecision::evaluate(
                state,
                created,
                created + Duration::from_secs(60),
                THRESHOLD,
            );
            assert_eq!(decision, DisconnectDecision::Ignore, "{state:?}");
        }
    }

    #[test]
    fn rejects_non_websocket_urls() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let key = AdapterKey::new("surface", "adapter");
        let result = CollabAdapter::new(key, "https://example.com", RelayConfig::default(), tx);
        assert!(matches!(result, Err(RelayError::InvalidUrl(_))));
    }
}
