//! Request/response correlation over the surface message channel.

use crate::error::{BridgeError, Result};
use crate::protocol::{Envelope, MessageKind};
use crate::router::{MessageContext, MessageHandler};
use crate::surface::Surface;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, warn};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

type PendingRequest = oneshot::Sender<Value>;

/// What happened to an incoming `response`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    Delivered,
    /// Id was issued but already answered or timed out.
    AlreadyCompleted,
    /// Id was never issued by this broker.
    Unknown,
}

/// Pending requests keyed by `requestId`.
pub struct PendingRequests {
    request_counter: AtomicU64,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    timeout: Duration,
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

impl PendingRequests {
    pub fn new(timeout: Duration) -> Self {
        Self {
            request_counter: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    fn next_id(&self) -> u64 {
        self.request_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Post `{type, requestId, body}` and wait for the matching `response`.
    pub async fn post_with_response(
        &self,
        surface: &dyn Surface,
        kind: MessageKind,
        body: Value,
    ) -> Result<Value> {
        let request_id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, tx);

        let envelope = Envelope::new(kind.clone(), body).with_request_id(request_id);
        if let Err(error) = surface.post(envelope).await {
            self.pending.lock().await.remove(&request_id);
            return Err(error);
        }
        debug!(request_id, kind = %kind, surface = surface.id(), "awaiting surface response");

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(_)) => Err(BridgeError::SurfaceClosed(surface.id().to_string())),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                warn!(request_id, kind = %kind, "surface request timed out");
                Err(BridgeError::Timeout {
                    request_id,
                    kind: kind.to_string(),
                    timeout: self.timeout,
                })
            }
        }
    }

    /// Deliver a reply. Each id is answered at most once.
    pub async fn resolve(&self, request_id: u64, body: Value) -> ResolveOutcome {
        let sender = self.pending.lock().await.remove(&request_id);
        if let Some(sender) = sender {
            if sender.send(body).is_err() {
                debug!(request_id, "requester went away before the response arrived");
            }
            return ResolveOutcome::Delivered;
        }

        if request_id > 0 && request_id < self.request_counter.load(Ordering::SeqCst) {
            warn!(request_id, "dropping duplicate or late response");
            ResolveOutcome::AlreadyCompleted
        } else {
            warn!(request_id, "dropping response for unknown request id");
            ResolveOutcome::Unknown
        }
    }

    /// Fail every waiter, e.g. when the surface is disposed.
    pub async fn cancel_all(&self) -> usize {
        let mut pending = self.pending.lock().await;
        let count = pending.len();
        pending.clear();
        count
    }
}

/// Handler for the well-known `response` message.
pub struct ResponseHandler {
    requests: Arc<PendingRequests>,
}

impl ResponseHandler {
    pub fn new(requests: Arc<PendingRequests>) -> Self {
        Self { requests }
    }
}

#[async_trait]
impl MessageHandler for ResponseHandler {
    async fn handle(&self, envelope: Envelope, context: MessageContext) -> Result<()> {
        let Some(request_id) = envelope.request_id else {
            warn!(uri = %context.document_uri, "response without requestId, dropping");
            return Ok(());
        };
        self.requests.resolve(request_id, envelope.body).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::ChannelSurface;
    use serde_json::json;
    use std::collections::HashSet;

    #[tokio::test]
    async fn request_ids_are_distinct_and_single_delivery() -> anyhow::Result<()> {
        let requests = Arc::new(PendingRequests::new(Duration::from_secs(5)));
        let (surface, mut outbound) = ChannelSurface::new("file:///a.ipynb");
        let surface = Arc::new(surface);

        let mut waiters = Vec::new();
        for index in 0..8 {
            let requests = Arc::clone(&requests);
            let surface = Arc::clone(&surface);
            waiters.push(tokio::spawn(async move {
                requests
                    .post_with_response(surface.as_ref(), MessageKind::GetFileData, json!(index))
                    .await
            }));
        }

        let mut seen = HashSet::new();
        for _ in 0..8 {
            let envelope = outbound.recv().await.ok_or_else(|| anyhow::anyhow!("closed"))?;
            let id = envelope.request_id.ok_or_else(|| anyhow::anyhow!("no id"))?;
            assert!(seen.insert(id), "request id {id} reused");
            assert_eq!(requests.resolve(id, envelope.body.clone()).await, ResolveOutcome::Delivered);
            assert_eq!(
                requests.resolve(id, json!("again")).await,
                ResolveOutcome::AlreadyCompleted
            );
        }

        for waiter in waiters {
            waiter.await??;
        }
        assert_eq!(requests.pending_count().await, 0);
        assert_eq!(requests.resolve(10_000, json!(null)).await, ResolveOutcome::Unknown);
        Ok(())
    }

    #[tokio::test]
    async fn unanswered_request_times_out_and_is_removed() -> anyhow::Result<()> {
        let requests = PendingRequests::new(Duration::from_millis(50));
        let (surface, mut outbound) = ChannelSurface::new("file:///b.ipynb");

        let result = requests
            .post_with_response(&surface, MessageKind::GetFileData, Value::Null)
            .await;
        assert!(matches!(result, Err(BridgeError::Timeout { .. })));
        assert_eq!(requests.pending_count().await, 0);

        let sent = outbound.recv().await.ok_or_else(|| anyhow::anyhow!("closed"))?;
        let id = sent.request_id.ok_or_else(|| anyhow::anyhow!("no id"))?;
        assert_eq!(
            requests.resolve(id, json!("late")).await,
            ResolveOutcome::AlreadyCompleted
        );
        Ok(())
    }

    #[tokio::test]
    async fn closed_surface_fails_fast() {
        let requests = PendingRequests::default();
        let (surface, outbound) = ChannelSurface::new("file:///c.ipynb");
        drop(outbound);

        let result = requests
            .post_with_response(&surface, MessageKind::GetFileData, Value::Null)
            .await;
        assert!(matches!(result, Err(BridgeError::SurfaceClosed(_))));
        assert_eq!(requests.pending_count().await, 0);
    }
}
