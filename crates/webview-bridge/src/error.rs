//! Bridge error types.

use std::time::Duration;
use thiserror::Error;

/// Bridge error type.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("request {request_id} ({kind}) timed out after {timeout:?}")]
    Timeout {
        request_id: u64,
        kind: String,
        timeout: Duration,
    },

    #[error("surface closed: {0}")]
    SurfaceClosed(String),

    #[error("document I/O error for {uri}: {source}")]
    DocumentIo {
        uri: String,
        #[source]
        source: std::io::Error,
    },

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("invalid document URI: {0}")]
    InvalidUri(String),

    #[error("unsupported document kind: {0}")]
    UnsupportedKind(String),

    #[error("strategy {strategy} failed: {message}")]
    Strategy { strategy: String, message: String },

    #[error("runtime directory error: {0}")]
    Directory(String),

    #[error("handler error: {0}")]
    Handler(String),

    #[error("collaboration relay error: {0}")]
    Relay(#[from] collab_relay::RelayError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BridgeError {
    pub fn io(uri: impl Into<String>, source: std::io::Error) -> Self {
        Self::DocumentIo {
            uri: uri.into(),
            source,
        }
    }
}

/// Bridge result type.
pub type Result<T> = std::result::Result<T, BridgeError>;
