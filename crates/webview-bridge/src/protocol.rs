//! Wire envelope exchanged with editor surfaces.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Message type tag. Unknown tags survive as [`MessageKind::Other`] so the
/// router can log and drop them instead of failing to parse.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageKind {
    Ready,
    Response,
    GetFileData,
    Init,
    Update,
    Edit,
    Connect,
    Disconnect,
    Message,
    Status,
    SelectRuntime,
    SelectKernel,
    KernelSelected,
    KernelTerminated,
    KernelDetached,
    CollaborationConfig,
    Error,
    Other(String),
}

impl MessageKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Ready => "ready",
            Self::Response => "response",
            Self::GetFileData => "getFileData",
            Self::Init => "init",
            Self::Update => "update",
            Self::Edit => "edit",
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Message => "message",
            Self::Status => "status",
            Self::SelectRuntime => "select-runtime",
            Self::SelectKernel => "select-kernel",
            Self::KernelSelected => "kernel-selected",
            Self::KernelTerminated => "kernel-terminated",
            Self::KernelDetached => "kernel-detached",
            Self::CollaborationConfig => "collaboration-config",
            Self::Error => "error",
            Self::Other(other) => other.as_str(),
        }
    }
}

impl From<&str> for MessageKind {
    fn from(value: &str) -> Self {
        match value {
            "ready" => Self::Ready,
            "response" => Self::Response,
            "getFileData" => Self::GetFileData,
            "init" => Self::Init,
            "update" => Self::Update,
            "edit" => Self::Edit,
            "connect" => Self::Connect,
            "disconnect" => Self::Disconnect,
            "message" => Self::Message,
            "status" => Self::Status,
            "select-runtime" => Self::SelectRuntime,
            "select-kernel" => Self::SelectKernel,
            "kernel-selected" => Self::KernelSelected,
            "kernel-terminated" => Self::KernelTerminated,
            "kernel-detached" => Self::KernelDetached,
            "collaboration-config" => Self::CollaborationConfig,
            "error" => Self::Error,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for MessageKind {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl From<MessageKind> for String {
    fn from(value: MessageKind) -> Self {
        match value {
            MessageKind::Other(other) => other,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{type, body, id?, requestId?}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub body: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(
        default,
        rename = "requestId",
        skip_serializing_if = "Option::is_none"
    )]
    pub request_id: Option<u64>,
}

impl Envelope {
    pub fn new(kind: MessageKind, body: Value) -> Self {
        Self {
            kind,
            body,
            id: None,
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: u64) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Reply to a request: `response` carrying the original `requestId`.
    pub fn response(request_id: u64, body: Value) -> Self {
        Self::new(MessageKind::Response, body).with_request_id(request_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_kind_wire_names() {
        struct Case {
            wire: &'static str,
            kind: MessageKind,
        }

        let cases = vec![
            Case { wire: "ready", kind: MessageKind::Ready },
            Case { wire: "getFileData", kind: MessageKind::GetFileData },
            Case { wire: "select-runtime", kind: MessageKind::SelectRuntime },
            Case { wire: "kernel-detached", kind: MessageKind::KernelDetached },
            Case { wire: "collaboration-config", kind: MessageKind::CollaborationConfig },
            Case { wire: "custom-thing", kind: MessageKind::Other("custom-thing".to_string()) },
        ];

        for case in cases {
            assert_eq!(MessageKind::from(case.wire), case.kind, "{}", case.wire);
            assert_eq!(String::from(case.kind), case.wire);
        }
    }

    #[test]
    fn envelope_round_trips_request_id() -> Result<(), serde_json::Error> {
        let raw = r#"{"type":"response","requestId":7,"body":{"ok":true}}"#;
        let envelope: Envelope = serde_json::from_str(raw)?;
        assert_eq!(envelope.kind, MessageKind::Response);
        assert_eq!(envelope.request_id, Some(7));
        assert_eq!(envelope.body, json!({"ok": true}));

        let encoded = serde_json::to_value(Envelope::new(MessageKind::Init, json!({})))?;
        assert_eq!(encoded, json!({"type": "init", "body": {}}));
        Ok(())
    }

    #[test]
    fn missing_body_defaults_to_null() -> Result<(), serde_json::Error> {
        let envelope: Envelope = serde_json::from_str(r#"{"type":"ready"}"#)?;
        assert_eq!(envelope.kind, MessageKind::Ready);
        assert_eq!(envelope.body, Value::Null);
        Ok(())
    }
}
