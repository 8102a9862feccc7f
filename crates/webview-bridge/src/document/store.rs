use super::uri::{DocumentScheme, DocumentUri};
use crate::error::{BridgeError, Result};
use crate::protocol::MessageKind;
use crate::requests::PendingRequests;
use crate::surface::SharedSurface;
use async_trait::async_trait;
use serde_json::Value;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Persistent storage behind documents.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn read(&self, uri: &DocumentUri) -> Result<Vec<u8>>;

    async fn write(&self, uri: &DocumentUri, content: &[u8]) -> Result<()>;

    async fn delete(&self, uri: &DocumentUri) -> Result<()>;

    /// Last cached copy of a remote document, if any.
    async fn read_remote_cache(&self, uri: &DocumentUri) -> Result<Option<Vec<u8>>>;
}

/// Source of the surface's latest serialized content.
#[async_trait]
pub trait ContentDelegate: Send + Sync {
    async fn get_file_data(&self) -> Result<Vec<u8>>;
}

/// Filesystem store. Remote documents map into `cache_dir`.
#[derive(Debug, Clone, Default)]
pub struct FsDocumentStore {
    cache_dir: Option<PathBuf>,
}

impl FsDocumentStore {
    pub fn new(cache_dir: Option<PathBuf>) -> Self {
        Self { cache_dir }
    }

    pub fn cache_dir(&self) -> Option<&Path> {
        self.cache_dir.as_deref()
    }

    /// Cache location of a remote document; `None` without a cache dir.
    pub fn cache_path(&self, uri: &DocumentUri) -> Option<PathBuf> {
        let cache_dir = self.cache_dir.as_ref()?;
        let mut path = cache_dir.clone();
        if let Some(host) = uri.host().filter(|host| !host.is_empty()) {
            path.push(sanitize_segment(host));
        }
        for segment in uri.path().split('/').filter(|segment| !segment.is_empty()) {
            path.push(sanitize_segment(segment));
        }
        Some(path)
    }

    fn resolve(&self, uri: &DocumentUri) -> Result<PathBuf> {
        match uri.scheme()? {
            DocumentScheme::File => uri.to_file_path(),
            DocumentScheme::Remote => self.cache_path(uri).ok_or_else(|| {
                BridgeError::InvalidUri(format!("no cache directory for remote document {uri}"))
            }),
            DocumentScheme::Untitled => Err(BridgeError::InvalidUri(format!(
                "untitled document has no storage location: {uri}"
            ))),
        }
    }
}

fn sanitize_segment(segment: &str) -> String {
    match segment {
        "." | ".." => "_".to_string(),
        other => other
            .chars()
            .map(|c| if c == '\\' || c == ':' { '_' } else { c })
            .collect(),
    }
}

#[async_trait]
impl DocumentStore for FsDocumentStore {
    async fn read(&self, uri: &DocumentUri) -> Result<Vec<u8>> {
        let path = self.resolve(uri)?;
        tokio::fs::read(&path)
            .await
            .map_err(|error| BridgeError::io(uri.as_str(), error))
    }

    async fn write(&self, uri: &DocumentUri, content: &[u8]) -> Result<()> {
        let path = self.resolve(uri)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|error| BridgeError::io(uri.as_str(), error))?;
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|error| BridgeError::io(uri.as_str(), error))?;
        debug!(uri = %uri, bytes = content.len(), "document written");
        Ok(())
    }

    async fn delete(&self, uri: &DocumentUri) -> Result<()> {
        let path = self.resolve(uri)?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|error| BridgeError::io(uri.as_str(), error))
    }

    async fn read_remote_cache(&self, uri: &DocumentUri) -> Result<Option<Vec<u8>>> {
        let Some(path) = self.cache_path(uri) else {
            return Ok(None);
        };
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(BridgeError::io(uri.as_str(), error)),
        }
    }
}

/// Asks the surface for its content with a `getFileData` request.
pub struct SurfaceContentDelegate {
    requests: Arc<PendingRequests>,
    surface: SharedSurface,
}

impl SurfaceContentDelegate {
    pub fn new(requests: Arc<PendingRequests>, surface: SharedSurface) -> Self {
        Self { requests, surface }
    }
}

#[async_trait]
impl ContentDelegate for SurfaceContentDelegate {
    async fn get_file_data(&self) -> Result<Vec<u8>> {
        let body = self
            .requests
            .post_with_response(self.surface.as_ref(), MessageKind::GetFileData, Value::Null)
            .await?;
        decode_content(body)
    }
}

/// Surfaces reply with a byte array, a string, or the structured document.
/// Content as sent to the surface: text when the bytes are UTF-8, otherwise
/// a byte array that [`decode_content`] reads back unchanged.
pub fn encode_content(content: &[u8]) -> Value {
    match std::str::from_utf8(content) {
        Ok(text) => Value::String(text.to_string()),
        Err(_) => Value::Array(content.iter().map(|byte| Value::from(*byte)).collect()),
    }
}

pub fn decode_content(body: Value) -> Result<Vec<u8>> {
    match body {
        Value::Array(items) => items
            .iter()
            .map(|item| item.as_u64().and_then(|value| u8::try_from(value).ok()))
            .collect::<Option<Vec<u8>>>()
            .ok_or_else(|| BridgeError::Protocol("content array is not a byte array".to_string())),
        Value::String(text) => Ok(text.into_bytes()),
        Value::Null => Err(BridgeError::Protocol("surface returned no content".to_string())),
        other => Ok(serde_json::to_vec(&other)?),
    }
}
