//! Typed dispatch of surface messages to handlers.

use crate::error::Result;
use crate::protocol::{Envelope, MessageKind};
use crate::surface::SharedSurface;
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

/// Where a message came from.
#[derive(Clone)]
pub struct MessageContext {
    pub document_uri: String,
    pub surface: SharedSurface,
    pub is_remote: bool,
}

impl MessageContext {
    pub fn new(document_uri: impl Into<String>, surface: SharedSurface, is_remote: bool) -> Self {
        Self {
            document_uri: document_uri.into(),
            surface,
            is_remote,
        }
    }
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: Envelope, context: MessageContext) -> Result<()>;
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct FnHandler<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Envelope, MessageContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Envelope, MessageContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, envelope: Envelope, context: MessageContext) -> Result<()> {
        (self.0)(envelope, context).await
    }
}

pub type SharedHandler = Arc<dyn MessageHandler>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Dispatched,
    Unhandled,
}

/// One handler per message kind.
#[derive(Default)]
pub struct MessageRouter {
    handlers: RwLock<HashMap<MessageKind, SharedHandler>>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `handler` for `kind`, returning the handler it replaced.
    pub fn register_handler<H>(&self, kind: MessageKind, handler: H) -> Option<SharedHandler>
    where
        H: MessageHandler + 'static,
    {
        self.register_shared(kind, Arc::new(handler))
    }

    pub fn register_shared(&self, kind: MessageKind, handler: SharedHandler) -> Option<SharedHandler> {
        let previous = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind.clone(), handler);
        if previous.is_some() {
            warn!(kind = %kind, "replacing existing message handler");
        }
        previous
    }

    pub fn unregister_handler(&self, kind: &MessageKind) -> Option<SharedHandler> {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(kind)
    }

    pub fn has_handler(&self, kind: &MessageKind) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(kind)
    }

    /// Dispatch one message. Unknown kinds are logged and dropped. A handler
    /// error is logged and returned to the caller, never posted to the surface.
    pub async fn route_message(
        &self,
        envelope: Envelope,
        context: MessageContext,
    ) -> Result<RouteOutcome> {
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&envelope.kind)
            .cloned();

        let Some(handler) = handler else {
            warn!(
                kind = %envelope.kind,
                uri = %context.document_uri,
                "no handler for message type, dropping"
            );
            return Ok(RouteOutcome::Unhandled);
        };

        let kind = envelope.kind.clone();
        let uri = context.document_uri.clone();
        debug!(kind = %kind, uri = %uri, "routing message");
        if let Err(error) = handler.handle(envelope, context).await {
            warn!(kind = %kind, uri = %uri, "message handler failed: {}", error);
            return Err(error);
        }
        Ok(RouteOutcome::Dispatched)
    }
}
