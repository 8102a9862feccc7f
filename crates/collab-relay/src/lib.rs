//! Host-side relay for collaborative document sync sessions.
//!
//! The UI surface cannot always open raw sockets, so the host owns one
//! WebSocket per collaboration adapter and relays frames in both directions:
//! - `connect` / `disconnect` / `message` requests from the surface
//! - JSON frames forwarded as structured messages, everything else as raw
//!   sync updates
//! - reconnect with capped exponential backoff on unexpected closure

pub mod adapter;
pub mod backoff;
pub mod error;
pub mod frame;
pub mod proxy;

pub use adapter::{CollabAdapter, ConnectionState, DisconnectDecision, SendOutcome};
pub use backoff::ReconnectBackoff;
pub use error::{RelayError, Result};
pub use frame::{InboundPayload, OutboundPayload, classify_inbound, encode_outbound};
pub use proxy::{AdapterKey, CollabProxy, RelayConfig, RelayEvent, RelayEventKind, RelayRequest};
