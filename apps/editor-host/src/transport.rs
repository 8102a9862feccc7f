//! Newline-delimited JSON between the editor and this process.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webview_bridge::{BridgeError, Envelope, MessageKind, Surface};

/// One request from the editor.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum HostCommand {
    Open {
        uri: String,
        #[serde(default)]
        backup: Option<String>,
    },
    Close {
        uri: String,
    },
    Save {
        uri: String,
    },
    SaveAs {
        uri: String,
        target: String,
    },
    Revert {
        uri: String,
    },
    Backup {
        uri: String,
        destination: String,
    },
    Undo {
        uri: String,
    },
    Redo {
        uri: String,
    },
    /// A message posted by the surface rendering `uri`.
    Message {
        uri: String,
        message: Envelope,
    },
}

impl HostCommand {
    pub fn uri(&self) -> &str {
        match self {
            Self::Open { uri, .. }
            | Self::Close { uri }
            | Self::Save { uri }
            | Self::SaveAs { uri, .. }
            | Self::Revert { uri }
            | Self::Backup { uri, .. }
            | Self::Undo { uri }
            | Self::Redo { uri }
            | Self::Message { uri, .. } => uri,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Open { .. } => "open",
            Self::Close { .. } => "close",
            Self::Save { .. } => "save",
            Self::SaveAs { .. } => "saveAs",
            Self::Revert { .. } => "revert",
            Self::Backup { .. } => "backup",
            Self::Undo { .. } => "undo",
            Self::Redo { .. } => "redo",
            Self::Message { .. } => "message",
        }
    }

    /// A surface reply to a host request; it only settles a waiting caller.
    pub fn is_surface_response(&self) -> bool {
        matches!(self, Self::Message { message, .. } if message.kind == MessageKind::Response)
    }

    /// Commands that wait on the surface (content fetch) and must not block
    /// the input loop.
    pub fn waits_on_surface(&self) -> bool {
        matches!(
            self,
            Self::Save { .. } | Self::SaveAs { .. } | Self::Revert { .. } | Self::Backup { .. }
        )
    }
}

/// Inbound line: a command plus an optional correlation id echoed in the reply.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CommandFrame {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(flatten)]
    pub command: HostCommand,
}

/// Outbound line.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum HostFrame {
    /// Message for the surface rendering `uri`.
    Message { uri: String, message: Envelope },
    Reply {
        id: Option<Value>,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Host-level notification not addressed to a surface.
    Event { event: String, uri: String },
}

impl HostFrame {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self::Reply {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<Value>, error: impl ToString) -> Self {
        Self::Reply {
            id,
            ok: false,
            result: None,
            error: Some(error.to_string()),
        }
    }

    pub fn event(event: impl Into<String>, uri: impl Into<String>) -> Self {
        Self::Event {
            event: event.into(),
            uri: uri.into(),
        }
    }
}

/// Blank lines yield `None`.
pub fn parse_command(line: &str) -> Result<Option<CommandFrame>, serde_json::Error> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(line).map(Some)
}

pub fn encode_frame(frame: &HostFrame) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');
    Ok(line)
}

/// Surface whose messages leave the process on the outbound channel.
pub struct StdioSurface {
    uri: String,
    outbound: mpsc::UnboundedSender<HostFrame>,
}

impl StdioSurface {
    pub fn new(uri: impl Into<String>, outbound: mpsc::UnboundedSender<HostFrame>) -> Self {
        Self {
            uri: uri.into(),
            outbound,
        }
    }
}

#[async_trait]
impl Surface for StdioSurface {
    fn id(&self) -> &str {
        &self.uri
    }

    async fn post(&self, envelope: Envelope) -> webview_bridge::Result<()> {
        self.outbound
            .send(HostFrame::Message {
                uri: self.uri.clone(),
                message: envelope,
            })
            .map_err(|_| BridgeError::SurfaceClosed(self.uri.clone()))
    }
}

/// Drain outbound frames to `writer`, one JSON object per line, until every
/// sender is gone.
pub async fn write_frames<W>(
    mut frames: mpsc::UnboundedReceiver<HostFrame>,
    mut writer: W,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        let line = match encode_frame(&frame) {
            Ok(line) => line,
            Err(error) => {
                warn!("dropping unencodable frame: {}", error);
                continue;
            }
        };
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
    }
    debug!("outbound channel closed");
    Ok(())
}
