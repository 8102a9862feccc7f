//! Host-side bridge between an editor and sandboxed document editor surfaces.
//!
//! The surface renders the document and talks to the host only through
//! [`protocol::Envelope`] messages. The host owns everything privileged:
//! - document storage, edit history and save/revert/backup
//! - request/response correlation over the message channel
//! - collaboration sockets relayed through [`collab_relay`]
//! - runtime selection and kernel lifecycle notifications

pub mod collab;
pub mod config;
pub mod document;
pub mod editor;
pub mod error;
pub mod protocol;
pub mod requests;
pub mod router;
pub mod runtime;
pub mod surface;

pub use config::{BridgeConfig, ConfigError};
pub use document::{
    ContentDelegate, Document, DocumentBackup, DocumentEvent, DocumentKind, DocumentRegistry,
    DocumentScheme, DocumentState, DocumentStore, DocumentUri, Edit, FsDocumentStore,
    WriteOutcome,
};
pub use editor::{DocumentSession, EditorHost};
pub use error::{BridgeError, Result};
pub use protocol::{Envelope, MessageKind};
pub use requests::{PendingRequests, ResolveOutcome};
pub use router::{MessageContext, MessageHandler, MessageRouter, RouteOutcome, handler_fn};
pub use runtime::{
    AutoConnectResolver, AutoConnectStrategy, Runtime, RuntimeBridge, RuntimeDirectory,
    RuntimePicker, RuntimeTarget,
};
pub use surface::{ChannelSurface, SharedSurface, Surface, SurfaceTable};
