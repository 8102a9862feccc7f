//! Frame classification between the socket and the UI surface.

use serde_json::{Value, json};
use tokio_tungstenite::tungstenite::Message;

/// Inbound socket frame as it will be forwarded to the surface.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundPayload {
    /// Frame parsed as JSON; forwarded unmodified.
    Json(Value),
    /// Raw sync bytes; forwarded as `{type: "update", bytes: [...]}`.
    Update(Vec<u8>),
}

impl InboundPayload {
    /// Body forwarded to the surface as the `data` field of a relay message.
    pub fn into_value(self) -> Value {
        match self {
            Self::Json(value) => value,
            Self::Update(bytes) => json!({ "type": "update", "bytes": bytes }),
        }
    }
}

/// Outbound payload to write to the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundPayload {
    Text(String),
    Binary(Vec<u8>),
}

impl OutboundPayload {
    pub fn into_message(self) -> Message {
        match self {
            Self::Text(text) => Message::Text(text.into()),
            Self::Binary(bytes) => Message::Binary(bytes.into()),
        }
    }
}

/// Classify a socket frame. Control frames yield `None`.
pub fn classify_inbound(message: Message) -> Option<InboundPayload> {
    match message {
        Message::Text(text) => Some(match serde_json::from_str::<Value>(text.as_str()) {
            Ok(value) => InboundPayload::Json(value),
            Err(_) => InboundPayload::Update(text.as_bytes().to_vec()),
        }),
        Message::Binary(bytes) => Some(match serde_json::from_slice::<Value>(&bytes) {
            Ok(value) => InboundPayload::Json(value),
            Err(_) => InboundPayload::Update(bytes.to_vec()),
        }),
        Message::Ping(_) | Message::Pong(_) | Message::Close(_) | Message::Frame(_) => None,
    }
}

/// Encode data sent by the surface for the socket.
///
/// Strings go out verbatim as text, non-empty arrays of byte values go out as
/// a binary frame, and anything else is serialized to JSON text.
pub fn encode_outbound(data: &Value) -> OutboundPayload {
    match data {
        Value::String(text) => OutboundPayload::Text(text.clone()),
        Value::Array(items) if !items.is_empty() => match byte_array(items) {
            Some(bytes) => OutboundPayload::Binary(bytes),
            None => OutboundPayload::Text(data.to_string()),
        },
        other => OutboundPayload::Text(other.to_string()),
    }
}

fn byte_array(items: &[Value]) -> Option<Vec<u8>> {
    items
        .iter()
        .map(|item| item.as_u64().and_then(|value| u8::try_from(value).ok()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_classification() {
        struct Case {
            name: &'static str,
            message: Message,
            expected: Option<InboundPayload>,
        }

        let cases = vec![
            Case {
                name: "json text",
                message: Message::Text(r#"{"type":"awareness","clients":[1]}"#.into()),
                expected: Some(InboundPayload::Json(
                    json!({"type": "awareness", "clients": [1]}),
                )),
            },
            Case {
                name: "json in binary frame",
                message: Message::Binary(br#"{"type":"ack"}"#.to_vec().into()),
                expected: Some(InboundPayload::Json(json!({"type": "ack"}))),
            },
            Case {
                name: "raw sync bytes",
                message: Message::Binary(vec![0x00, 0x01, 0xff, 0x7b].into()),
                expected: Some(InboundPayload::Update(vec![0x00, 0x01, 0xff, 0x7b])),
            },
            Case {
                name: "non-json text",
                message: Message::Text("not json".into()),
                expected: Some(InboundPayload::Update(b"not json".to_vec())),
            },
            Case {
                name: "ping",
                message: Message::Ping(vec![1, 2].into()),
                expected: None,
            },
            Case {
                name: "close",
                message: Message::Close(None),
                expected: None,
            },
        ];

        for case in cases {
            assert_eq!(classify_inbound(case.message), case.expected, "{}", case.name);
        }
    }

    #[test]
    fn update_payload_is_tagged() {
        let value = InboundPayload::Update(vec![3, 4]).into_value();
        assert_eq!(value, json!({"type": "update", "bytes": [3, 4]}));
    }

    #[test]
    fn outbound_encoding() {
        struct Case {
            name: &'static str,
            data: Value,
            expected: OutboundPayload,
        }

        let cases = vec![
            Case {
                name: "pre-serialized string",
                data: json!("{\"a\":1}"),
                expected: OutboundPayload::Text("{\"a\":1}".to_string()),
            },
            Case {
                name: "byte array",
                data: json!([0, 127, 255]),
                expected: OutboundPayload::Binary(vec![0, 127, 255]),
            },
            Case {
                name: "array with out-of-range values",
                data: json!([1, 256]),
                expected: OutboundPayload::Text("[1,256]".to_string()),
            },
            Case {
                name: "empty array",
                data: json!([]),
                expected: OutboundPayload::Text("[]".to_string()),
            },
            Case {
                name: "structured object",
                data: json!({"type": "sync"}),
                expected: OutboundPayload::Text(r#"{"type":"sync"}"#.to_string()),
            },
        ];

        for case in cases {
            assert_eq!(encode_outbound(&case.data), case.expected, "{}", case.name);
        }
    }
}
