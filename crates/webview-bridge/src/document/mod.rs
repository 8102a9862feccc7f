//! Per-document edit state.
//!
//! Local documents (`file:`, `untitled:`) keep a host-side undo history and a
//! dirty flag derived from it. Remote documents are synchronized by the
//! collaboration layer: edits are only announced, the store is never written
//! by `save`, and the document is never dirty.

mod history;
mod registry;
mod store;
mod uri;

pub use history::{EditEntry, EditHistory};
pub use registry::DocumentRegistry;
pub use store::{
    ContentDelegate, DocumentStore, FsDocumentStore, SurfaceContentDelegate, decode_content,
    encode_content,
};
pub use uri::{DocumentKind, DocumentScheme, DocumentUri};

use crate::error::{BridgeError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentState {
    LocalClean,
    LocalDirty,
    RemoteCollaborative,
}

/// Change notifications for listeners of one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentEvent {
    /// A local edit was recorded in the history.
    ContentChanged { edit_id: u64, label: String },
    /// A remote document changed; the collaboration layer owns the content.
    Changed,
    /// Undo or redo moved through the history.
    HistoryMoved { dirty: bool },
    Saved { target: String },
    Reverted,
    Disposed,
}

/// Edit reported by the surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edit {
    pub label: String,
    /// Serialized document after the edit; `None` keeps the current content.
    pub content: Option<Vec<u8>>,
}

impl Edit {
    pub fn new(label: impl Into<String>, content: Option<Vec<u8>>) -> Self {
        Self {
            label: label.into(),
            content,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// Nothing to do for this document (remote save, remote revert).
    Skipped,
    /// The token fired before the write happened.
    Cancelled,
}

/// Handle to a backup written by [`Document::backup`].
pub struct DocumentBackup {
    id: DocumentUri,
    store: Arc<dyn DocumentStore>,
}

impl DocumentBackup {
    pub fn id(&self) -> &DocumentUri {
        &self.id
    }

    /// Remove the backup. Failures are logged, never returned.
    pub async fn delete(self) {
        if let Err(error) = self.store.delete(&self.id).await {
            debug!(backup = %self.id, "backup delete failed: {}", error);
        }
    }
}

pub struct Document {
    uri: DocumentUri,
    kind: DocumentKind,
    scheme: DocumentScheme,
    history: Mutex<EditHistory>,
    store: Arc<dyn DocumentStore>,
    delegate: std::sync::Mutex<Option<Arc<dyn ContentDelegate>>>,
    events: std::sync::Mutex<Option<broadcast::Sender<DocumentEvent>>>,
    disposed: AtomicBool,
}

impl Document {
    /// Load initial content, from `backup` when the editor restores one.
    pub async fn open(
        uri: DocumentUri,
        backup: Option<&DocumentUri>,
        store: Arc<dyn DocumentStore>,
    ) -> Result<Self> {
        let kind = uri.kind()?;
        let scheme = uri.scheme()?;

        let history = if let Some(backup) = backup {
            let content = store.read(backup).await?;
            info!(uri = %uri, backup = %backup, "restoring document from backup");
            if scheme == DocumentScheme::Remote {
                EditHistory::new(content)
            } else {
                EditHistory::unsaved(content)
            }
        } else {
            let content = match scheme {
                DocumentScheme::File => store.read(&uri).await?,
                DocumentScheme::Untitled => kind.empty_payload(),
                DocumentScheme::Remote => match store.read_remote_cache(&uri).await? {
                    Some(cached) => cached,
                    None => {
                        debug!(uri = %uri, "no cached copy, starting from empty payload");
                        kind.empty_payload()
                    }
                },
            };
            EditHistory::new(content)
        };

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            uri,
            kind,
            scheme,
            history: Mutex::new(history),
            store,
            delegate: std::sync::Mutex::new(None),
            events: std::sync::Mutex::new(Some(events)),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn uri(&self) -> &DocumentUri {
        &self.uri
    }

    pub fn kind(&self) -> DocumentKind {
        self.kind
    }

    pub fn is_remote(&self) -> bool {
        self.scheme == DocumentScheme::Remote
    }

    pub fn is_untitled(&self) -> bool {
        self.scheme == DocumentScheme::Untitled
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn set_content_delegate(&self, delegate: Arc<dyn ContentDelegate>) {
        *self.delegate.lock().unwrap_or_else(PoisonError::into_inner) = Some(delegate);
    }

    /// Subscribe to change notifications. `None` once disposed.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<DocumentEvent>> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(broadcast::Sender::subscribe)
    }

    pub async fn content(&self) -> Vec<u8> {
        self.history.lock().await.current_content().to_vec()
    }

    pub async fn is_dirty(&self) -> bool {
        !self.is_remote() && self.history.lock().await.is_dirty()
    }

    pub async fn state(&self) -> DocumentState {
        if self.is_remote() {
            DocumentState::RemoteCollaborative
        } else if self.history.lock().await.is_dirty() {
            DocumentState::LocalDirty
        } else {
            DocumentState::LocalClean
        }
    }

    pub async fn history_len(&self) -> usize {
        self.history.lock().await.len()
    }

    /// Record an edit from the surface. Returns the history id for local
    /// documents.
    pub async fn make_edit(&self, edit: Edit) -> Result<Option<u64>> {
        self.ensure_live()?;
        if self.is_remote() {
            self.emit(DocumentEvent::Changed);
            return Ok(None);
        }

        let edit_id = {
            let mut history = self.history.lock().await;
            let content = match edit.content {
                Some(content) => content,
                None => history.current_content().to_vec(),
            };
            history.push(edit.label.clone(), content)
        };
        debug!(uri = %self.uri, edit_id, label = %edit.label, "edit recorded");
        self.emit(DocumentEvent::ContentChanged {
            edit_id,
            label: edit.label,
        });
        Ok(Some(edit_id))
    }

    /// Write the surface's current content back to the document's own URI.
    pub async fn save(&self, cancel: &CancellationToken) -> Result<WriteOutcome> {
        self.ensure_live()?;
        if self.is_remote() {
            debug!(uri = %self.uri, "save skipped for collaborative document");
            return Ok(WriteOutcome::Skipped);
        }
        if self.is_untitled() {
            return Err(BridgeError::InvalidUri(format!(
                "untitled document needs a save target: {}",
                self.uri
            )));
        }
        let target = self.uri.clone();
        self.save_as(&target, cancel).await
    }

    /// Write to `target`. Dirty state is only cleared when `target` is this
    /// document.
    pub async fn save_as(
        &self,
        target: &DocumentUri,
        cancel: &CancellationToken,
    ) -> Result<WriteOutcome> {
        self.ensure_live()?;
        let content = self.latest_content().await?;
        if cancel.is_cancelled() {
            debug!(uri = %self.uri, target = %target, "save cancelled before write");
            return Ok(WriteOutcome::Cancelled);
        }

        self.store.write(target, &content).await?;

        if *target == self.uri && !self.is_remote() {
            let mut history = self.history.lock().await;
            history.replace_current(content);
            history.mark_saved();
        }
        info!(uri = %self.uri, target = %target, "document saved");
        self.emit(DocumentEvent::Saved {
            target: target.to_string(),
        });
        Ok(WriteOutcome::Written)
    }

    /// Reload from the store and rewind the history to the last save.
    pub async fn revert(&self, cancel: &CancellationToken) -> Result<WriteOutcome> {
        self.ensure_live()?;
        if self.is_remote() {
            return Ok(WriteOutcome::Skipped);
        }
        let stored = if self.is_untitled() {
            self.kind.empty_payload()
        } else {
            self.store.read(&self.uri).await?
        };
        if cancel.is_cancelled() {
            debug!(uri = %self.uri, "revert cancelled");
            return Ok(WriteOutcome::Cancelled);
        }

        self.history.lock().await.revert(stored);
        self.emit(DocumentEvent::Reverted);
        Ok(WriteOutcome::Written)
    }

    pub async fn backup(
        &self,
        destination: DocumentUri,
        cancel: &CancellationToken,
    ) -> Result<DocumentBackup> {
        match self.save_as(&destination, cancel).await? {
            WriteOutcome::Written | WriteOutcome::Skipped => Ok(DocumentBackup {
                id: destination,
                store: Arc::clone(&self.store),
            }),
            WriteOutcome::Cancelled => Err(BridgeError::Cancelled(format!(
                "backup of {} to {}",
                self.uri, destination
            ))),
        }
    }

    /// Step back one edit; returns the content to show.
    pub async fn undo(&self) -> Option<Vec<u8>> {
        self.move_history(EditHistory::undo).await
    }

    pub async fn redo(&self) -> Option<Vec<u8>> {
        self.move_history(EditHistory::redo).await
    }

    /// Notify listeners and release them.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.emit(DocumentEvent::Disposed);
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.delegate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        debug!(uri = %self.uri, "document disposed");
    }

    async fn move_history<F>(&self, step: F) -> Option<Vec<u8>>
    where
        F: for<'a> FnOnce(&'a mut EditHistory) -> Option<&'a [u8]>,
    {
        if self.is_remote() || self.is_disposed() {
            return None;
        }
        let (content, dirty) = {
            let mut history = self.history.lock().await;
            let content = step(&mut *history)?.to_vec();
            (content, history.is_dirty())
        };
        self.emit(DocumentEvent::HistoryMoved { dirty });
        Some(content)
    }

    async fn latest_content(&self) -> Result<Vec<u8>> {
        let delegate = self
            .delegate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match delegate {
            Some(delegate) => delegate.get_file_data().await,
            None => Ok(self.content().await),
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(BridgeError::Protocol(format!(
                "document already disposed: {}",
                self.uri
            )));
        }
        Ok(())
    }

    fn emit(&self, event: DocumentEvent) {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(events) = events.as_ref() {
            // No receivers is fine.
            let _ = events.send(event);
        }
    }
}
