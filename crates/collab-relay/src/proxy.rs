//! Adapter table and surface protocol handling.

use crate::adapter::{CollabAdapter, ConnectionState, DisconnectDecision, SendOutcome};
use crate::backoff::{DEFAULT_RECONNECT_CAP, DEFAULT_RECONNECT_FLOOR};
use crate::error::{RelayError, Result};
use crate::frame::InboundPayload;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub connect_timeout: Duration,
    /// Disconnects arriving sooner than this after adapter creation are ignored.
    pub disconnect_debounce: Duration,
    pub reconnect_floor: Duration,
    pub reconnect_cap: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            disconnect_debounce: Duration::from_millis(1_000),
            reconnect_floor: DEFAULT_RECONNECT_FLOOR,
            reconnect_cap: DEFAULT_RECONNECT_CAP,
        }
    }
}

/// Adapter identity: the owning surface plus the surface-chosen adapter id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AdapterKey {
    pub owner: String,
    pub adapter_id: String,
}

impl AdapterKey {
    pub fn new(owner: impl Into<String>, adapter_id: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            adapter_id: adapter_id.into(),
        }
    }
}

impl fmt::Display for AdapterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.owner, self.adapter_id)
    }
}

/// Request from the UI surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RelayRequest {
    Connect {
        #[serde(rename = "adapterId")]
        adapter_id: String,
        url: String,
    },
    Disconnect {
        #[serde(rename = "adapterId")]
        adapter_id: String,
    },
    Message {
        #[serde(rename = "adapterId")]
        adapter_id: String,
        #[serde(default)]
        data: Value,
    },
}

impl RelayRequest {
    pub fn adapter_id(&self) -> &str {
        match self {
            Self::Connect { adapter_id, .. }
            | Self::Disconnect { adapter_id }
            | Self::Message { adapter_id, .. } => adapter_id,
        }
    }
}

/// Event produced by an adapter for its owning surface.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayEvent {
    pub key: AdapterKey,
    pub kind: RelayEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelayEventKind {
    Status(ConnectionState),
    Payload(InboundPayload),
    Error(String),
    Closed,
}

impl RelayEvent {
    /// Surface message type for this event.
    pub fn message_type(&self) -> &'static str {
        match self.kind {
            RelayEventKind::Status(_) | RelayEventKind::Closed => "status",
            RelayEventKind::Payload(_) => "message",
            RelayEventKind::Error(_) => "error",
        }
    }

    /// Surface message body for this event.
    pub fn body(&self) -> Value {
        let adapter_id = self.key.adapter_id.as_str();
        match &self.kind {
            RelayEventKind::Status(state) => {
                json!({ "adapterId": adapter_id, "status": state.as_str() })
            }
            RelayEventKind::Closed => json!({ "adapterId": adapter_id, "status": "closed" }),
            RelayEventKind::Payload(payload) => {
                json!({ "adapterId": adapter_id, "data": payload.clone().into_value() })
            }
            RelayEventKind::Error(message) => {
                json!({ "adapterId": adapter_id, "message": message })
            }
        }
    }
}

/// Owns every live collaboration adapter for one host process.
pub struct CollabProxy {
    adapters: Mutex<HashMap<AdapterKey, Arc<CollabAdapter>>>,
    config: RelayConfig,
    events: mpsc::UnboundedSender<RelayEvent>,
}

impl CollabProxy {
    /// Create a proxy; relay events for all adapters arrive on the receiver.
    pub fn new(config: RelayConfig) -> (Self, mpsc::UnboundedReceiver<RelayEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                adapters: Mutex::new(HashMap::new()),
                config,
                events,
            },
            events_rx,
        )
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Handle one request from the surface identified by `owner`.
    pub async fn handle(&self, owner: &str, request: RelayRequest) -> Result<()> {
        match request {
            RelayRequest::Connect { adapter_id, url } => {
                self.connect(AdapterKey::new(owner, adapter_id), &url).await
            }
            RelayRequest::Disconnect { adapter_id } => {
                self.disconnect(&AdapterKey::new(owner, adapter_id), Instant::now())
                    .await;
                Ok(())
            }
            RelayRequest::Message { adapter_id, data } => {
                self.send(&AdapterKey::new(owner, adapter_id), &data).await;
                Ok(())
            }
        }
    }

    /// Open a socket for `key`, or re-report the status of the existing one.
    pub async fn connect(&self, key: AdapterKey, url: &str) -> Result<()> {
        let mut adapters = self.adapters.lock().await;
        if let Some(existing) = adapters.get(&key).cloned() {
            drop(adapters);
            let status = match existing.state().await {
                ConnectionState::Connected => ConnectionState::Connected,
                ConnectionState::Connecting | ConnectionState::Disconnected => {
                    ConnectionState::Connecting
                }
            };
            debug!(adapter = %key, status = status.as_str(), "adapter already exists, re-reporting status");
            self.emit(RelayEvent {
                key,
                kind: RelayEventKind::Status(status),
            });
            return Ok(());
        }

        let adapter = Arc::new(CollabAdapter::new(
            key.clone(),
            url,
            self.config.clone(),
            self.events.clone(),
        )?);
        adapters.insert(key.clone(), Arc::clone(&adapter));
        drop(adapters);

        info!(adapter = %key, url = %adapter.url(), "opening collaboration socket");
        self.emit(RelayEvent {
            key,
            kind: RelayEventKind::Status(ConnectionState::Connecting),
        });
        adapter.start().await;
        Ok(())
    }

    /// Apply the disconnect debounce; returns the decision taken.
    pub async fn disconnect(&self, key: &AdapterKey, now: Instant) -> Option<DisconnectDecision> {
        let adapter = self.adapters.lock().await.get(key).cloned();
        let Some(adapter) = adapter else {
            debug!(adapter = %key, "disconnect for unknown adapter");
            return None;
        };

        let decision = adapter.disconnect_decision(now).await;
        match decision {
            DisconnectDecision::Ignore => {
                debug!(adapter = %key, "ignoring early disconnect");
            }
            DisconnectDecision::Close => {
                self.adapters.lock().await.remove(key);
                adapter.close().await;
                info!(adapter = %key, "collaboration socket closed");
            }
        }
        Some(decision)
    }

    /// Relay surface data to the adapter's socket.
    pub async fn send(&self, key: &AdapterKey, data: &Value) -> SendOutcome {
        let adapter = self.adapters.lock().await.get(key).cloned();
        match adapter {
            Some(adapter) => adapter.send(data).await,
            None => {
                warn!(adapter = %key, "{}", RelayError::UnknownAdapter(key.to_string()));
                SendOutcome::NotOpen
            }
        }
    }

    pub async fn state(&self, key: &AdapterKey) -> Option<ConnectionState> {
        let adapter = self.adapters.lock().await.get(key).cloned();
        match adapter {
            Some(adapter) => Some(adapter.state().await),
            None => None,
        }
    }

    pub async fn adapter_count(&self) -> usize {
        self.adapters.lock().await.len()
    }

    /// Tear down every adapter owned by a disposed surface.
    pub async fn dispose_surface(&self, owner: &str) -> usize {
        let removed: Vec<Arc<CollabAdapter>> = {
            let mut adapters = self.adapters.lock().await;
            let keys: Vec<AdapterKey> = adapters
                .keys()
                .filter(|key| key.owner == owner)
                .cloned()
                .collect();
            keys.iter().filter_map(|key| adapters.remove(key)).collect()
        };
        for adapter in &removed {
            adapter.close().await;
        }
        if !removed.is_empty() {
            info!(owner, count = removed.len(), "disposed collaboration adapters");
        }
        removed.len()
    }

    /// Close every adapter.
    pub async fn shutdown(&self) {
        let removed: Vec<Arc<CollabAdapter>> =
            self.adapters.lock().await.drain().map(|(_, adapter)| adapter).collect();
        for adapter in removed {
            adapter.close().await;
        }
    }

    fn emit(&self, event: RelayEvent) {
        if self.events.send(event).is_err() {
            debug!("relay event receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_surface_requests() -> Result<()> {
        let connect: RelayRequest = serde_json::from_str(
            r#"{"type":"connect","adapterId":"a1","url":"wss://sync.example.com/room"}"#,
        )?;
        assert_eq!(
            connect,
            RelayRequest::Connect {
                adapter_id: "a1".to_string(),
                url: "wss://sync.example.com/room".to_string(),
            }
        );

        let message: RelayRequest =
            serde_json::from_str(r#"{"type":"message","adapterId":"a1","data":[1,2,3]}"#)?;
        assert_eq!(message.adapter_id(), "a1");

        let disconnect: RelayRequest =
            serde_json::from_str(r#"{"type":"disconnect","adapterId":"a2"}"#)?;
        assert_eq!(disconnect.adapter_id(), "a2");
        Ok(())
    }

    #[test]
    fn event_bodies_carry_adapter_id() {
        let key = AdapterKey::new("doc", "a1");
        let status = RelayEvent {
            key: key.clone(),
            kind: RelayEventKind::Status(ConnectionState::Connected),
        };
        assert_eq!(status.message_type(), "status");
        assert_eq!(status.body(), json!({"adapterId": "a1", "status": "connected"}));

        let update = RelayEvent {
            key,
            kind: RelayEventKind::Payload(InboundPayload::Update(vec![9])),
        };
        assert_eq!(update.message_type(), "message");
        assert_eq!(
            update.body(),
            json!({"adapterId": "a1", "data": {"type": "update", "bytes": [9]}})
        );
    }

    #[tokio::test]
    async fn invalid_url_leaves_no_adapter() {
        let (proxy, _events) = CollabProxy::new(RelayConfig::default());
        let result = proxy
            .connect(AdapterKey::new("doc", "a1"), "http://not-a-socket")
            .await;
        assert!(matches!(result, Err(RelayError::InvalidUrl(_))));
        assert_eq!(proxy.adapter_count().await, 0);
    }

    #[tokio::test]
    async fn send_to_unknown_adapter_is_noop() {
        let (proxy, _events) = CollabProxy::new(RelayConfig::default());
        let outcome = proxy
            .send(&AdapterKey::new("doc", "missing"), &json!("hello"))
            .await;
        assert_eq!(outcome, SendOutcome::NotOpen);
    }
}
