//! Glue between surface messages and the collaboration relay.

use crate::error::{BridgeError, Result};
use crate::protocol::{Envelope, MessageKind};
use crate::surface::SurfaceTable;
use collab_relay::{RelayEvent, RelayRequest};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Build a relay request from a `connect` / `disconnect` / `message` envelope.
pub fn relay_request(kind: &MessageKind, body: &Value) -> Result<RelayRequest> {
    let tag = match kind {
        MessageKind::Connect | MessageKind::Disconnect | MessageKind::Message => kind.as_str(),
        other => {
            return Err(BridgeError::Protocol(format!(
                "{other} is not a collaboration request"
            )));
        }
    };
    let mut fields = match body {
        Value::Object(fields) => fields.clone(),
        _ => {
            return Err(BridgeError::Protocol(format!(
                "{tag} body must be an object"
            )));
        }
    };
    fields.insert("type".to_string(), Value::String(tag.to_string()));
    serde_json::from_value(Value::Object(fields))
        .map_err(|error| BridgeError::Protocol(format!("invalid {tag} request: {error}")))
}

pub fn relay_event_envelope(event: &RelayEvent) -> Envelope {
    Envelope::new(MessageKind::from(event.message_type()), event.body())
}

/// Forward relay events to the surface owning each adapter, in order.
pub fn spawn_relay_forwarder(
    mut events: mpsc::UnboundedReceiver<RelayEvent>,
    surfaces: SurfaceTable,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(surface) = surfaces.get(&event.key.owner) else {
                debug!(adapter = %event.key, "relay event for closed surface dropped");
                continue;
            };
            if let Err(error) = surface.post(relay_event_envelope(&event)).await {
                warn!(adapter = %event.key, "failed to forward relay event: {}", error);
            }
        }
        debug!("relay event stream ended");
    })
}
