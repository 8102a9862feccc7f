//! Handles to sandboxed editor surfaces.

use crate::error::{BridgeError, Result};
use crate::protocol::Envelope;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;

/// A UI surface the host can post messages to.
#[async_trait]
pub trait Surface: Send + Sync {
    /// Stable id of the surface (the document URI it renders).
    fn id(&self) -> &str;

    async fn post(&self, envelope: Envelope) -> Result<()>;
}

pub type SharedSurface = Arc<dyn Surface>;

/// Live surfaces keyed by document URI.
#[derive(Clone, Default)]
pub struct SurfaceTable {
    inner: Arc<RwLock<HashMap<String, SharedSurface>>>,
}

impl SurfaceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, uri: impl Into<String>, surface: SharedSurface) -> Option<SharedSurface> {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(uri.into(), surface)
    }

    pub fn remove(&self, uri: &str) -> Option<SharedSurface> {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(uri)
    }

    pub fn get(&self, uri: &str) -> Option<SharedSurface> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(uri)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Surface backed by an mpsc channel; the receiving end is drained by the
/// host transport.
#[derive(Clone)]
pub struct ChannelSurface {
    id: String,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl ChannelSurface {
    pub fn new(id: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id: id.into(), tx }, rx)
    }

    pub fn from_sender(id: impl Into<String>, tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self { id: id.into(), tx }
    }
}

impl fmt::Debug for ChannelSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSurface").field("id", &self.id).finish()
    }
}

#[async_trait]
impl Surface for ChannelSurface {
    fn id(&self) -> &str {
        &self.id
    }

    async fn post(&self, envelope: Envelope) -> Result<()> {
        self.tx
            .send(envelope)
            .map_err(|_| BridgeError::SurfaceClosed(self.id.clone()))
    }
}
