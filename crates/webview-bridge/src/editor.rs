//! Editor session wiring: one router and document per open surface.

use crate::collab::{relay_request, spawn_relay_forwarder};
use crate::config::BridgeConfig;
use crate::document::{
    Document, DocumentBackup, DocumentRegistry, DocumentStore, DocumentUri, Edit,
    SurfaceContentDelegate, WriteOutcome, decode_content, encode_content,
};
use crate::error::{BridgeError, Result};
use crate::protocol::{Envelope, MessageKind};
use crate::requests::{PendingRequests, ResponseHandler};
use crate::router::{MessageContext, MessageRouter, RouteOutcome, handler_fn};
use crate::runtime::{AutoConnectResolver, RuntimeBridge, RuntimeDirectory, RuntimePicker};
use crate::surface::{SharedSurface, SurfaceTable};
use chrono::{DateTime, Utc};
use collab_relay::{CollabProxy, RelayRequest};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// An open document bound to its surface.
pub struct DocumentSession {
    id: u64,
    document: Arc<Document>,
    surface: SharedSurface,
    router: MessageRouter,
}

impl DocumentSession {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn document(&self) -> &Arc<Document> {
        &self.document
    }

    pub fn surface(&self) -> &SharedSurface {
        &self.surface
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub fn context(&self) -> MessageContext {
        MessageContext::new(
            self.document.uri().as_str(),
            Arc::clone(&self.surface),
            self.document.is_remote(),
        )
    }
}

/// Owns every table shared by the open documents of one host process.
pub struct EditorHost {
    config: BridgeConfig,
    store: Arc<dyn DocumentStore>,
    requests: Arc<PendingRequests>,
    bridge: Arc<RuntimeBridge>,
    resolver: Arc<AutoConnectResolver>,
    relay: Arc<CollabProxy>,
    registry: Arc<DocumentRegistry>,
    sessions: Mutex<HashMap<String, Arc<DocumentSession>>>,
    relay_forwarder: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl EditorHost {
    /// Must be called inside a tokio runtime; spawns the relay forwarder.
    pub fn new(
        config: BridgeConfig,
        store: Arc<dyn DocumentStore>,
        directory: Arc<dyn RuntimeDirectory>,
        picker: Option<Arc<dyn RuntimePicker>>,
    ) -> Self {
        let surfaces = SurfaceTable::new();
        let (relay, relay_events) = CollabProxy::new(config.relay.clone());
        let relay_forwarder = spawn_relay_forwarder(relay_events, surfaces.clone());
        let resolver = AutoConnectResolver::new(config.autoconnect.clone(), directory, picker);

        Self {
            requests: Arc::new(PendingRequests::new(config.request_timeout)),
            bridge: Arc::new(RuntimeBridge::new(surfaces)),
            resolver: Arc::new(resolver),
            relay: Arc::new(relay),
            registry: Arc::new(DocumentRegistry::new()),
            sessions: Mutex::new(HashMap::new()),
            relay_forwarder: std::sync::Mutex::new(Some(relay_forwarder)),
            store,
            config,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn requests(&self) -> &Arc<PendingRequests> {
        &self.requests
    }

    pub fn runtime_bridge(&self) -> &Arc<RuntimeBridge> {
        &self.bridge
    }

    pub fn resolver(&self) -> &Arc<AutoConnectResolver> {
        &self.resolver
    }

    pub fn relay(&self) -> &Arc<CollabProxy> {
        &self.relay
    }

    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.registry
    }

    pub async fn session(&self, uri: &str) -> Option<Arc<DocumentSession>> {
        let key = session_key(uri);
        self.sessions.lock().await.get(&key).cloned()
    }

    pub async fn open_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Create the document state machine for `uri` and install the default
    /// handlers for its surface.
    pub async fn open_document(
        &self,
        uri: &str,
        surface: SharedSurface,
        backup: Option<&str>,
    ) -> Result<Arc<DocumentSession>> {
        let uri = DocumentUri::parse(uri)?;
        if let Some(existing) = self.session(uri.as_str()).await {
            warn!(uri = %uri, "document already open, reusing session");
            return Ok(existing);
        }
        let backup = backup.map(DocumentUri::parse).transpose()?;

        let document = Arc::new(Document::open(uri.clone(), backup.as_ref(), Arc::clone(&self.store)).await?);
        document.set_content_delegate(Arc::new(SurfaceContentDelegate::new(
            Arc::clone(&self.requests),
            Arc::clone(&surface),
        )));

        let id = self.registry.register(uri.as_str());
        self.bridge.register_webview(uri.as_str(), Arc::clone(&surface));

        let router = MessageRouter::new();
        self.install_default_handlers(&router, id, &document);

        let session = Arc::new(DocumentSession {
            id,
            document,
            surface,
            router,
        });
        self.sessions
            .lock()
            .await
            .insert(uri.to_string(), Arc::clone(&session));
        info!(uri = %uri, document_id = id, remote = session.document.is_remote(), "document opened");
        Ok(session)
    }

    /// Dispose the document, unregister its surface and tear down its
    /// collaboration sockets.
    pub async fn close_document(&self, uri: &str) -> bool {
        let key = session_key(uri);
        let Some(session) = self.sessions.lock().await.remove(&key) else {
            debug!(uri, "close for unknown document");
            return false;
        };
        session.document.dispose();
        self.bridge.unregister_webview(&key).await;
        let adapters = self.relay.dispose_surface(&key).await;
        self.registry.unregister(&key);
        info!(uri = %key, adapters, "document closed");
        true
    }

    /// Route one message from the surface of `uri`.
    pub async fn handle_message(&self, uri: &str, envelope: Envelope) -> Result<RouteOutcome> {
        let session = self
            .session(uri)
            .await
            .ok_or_else(|| BridgeError::Protocol(format!("message for unopened document {uri}")))?;
        session
            .router
            .route_message(envelope, session.context())
            .await
    }

    pub async fn save(&self, uri: &str, cancel: &CancellationToken) -> Result<WriteOutcome> {
        self.require(uri).await?.document.save(cancel).await
    }

    pub async fn save_as(
        &self,
        uri: &str,
        target: &str,
        cancel: &CancellationToken,
    ) -> Result<WriteOutcome> {
        let target = DocumentUri::parse(target)?;
        self.require(uri).await?.document.save_as(&target, cancel).await
    }

    /// Revert and push the restored content to the surface.
    pub async fn revert(&self, uri: &str, cancel: &CancellationToken) -> Result<WriteOutcome> {
        let session = self.require(uri).await?;
        let outcome = session.document.revert(cancel).await?;
        if outcome == WriteOutcome::Written {
            let content = session.document.content().await;
            post_update(&session, &content).await?;
        }
        Ok(outcome)
    }

    pub async fn backup(
        &self,
        uri: &str,
        destination: &str,
        cancel: &CancellationToken,
    ) -> Result<DocumentBackup> {
        let destination = DocumentUri::parse(destination)?;
        self.require(uri).await?.document.backup(destination, cancel).await
    }

    /// Host-managed undo; the surface receives an `update` with the content.
    pub async fn undo(&self, uri: &str) -> Result<bool> {
        let session = self.require(uri).await?;
        match session.document.undo().await {
            Some(content) => {
                post_update(&session, &content).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn redo(&self, uri: &str) -> Result<bool> {
        let session = self.require(uri).await?;
        match session.document.redo().await {
            Some(content) => {
                post_update(&session, &content).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<String> {
        self.bridge.sweep_expired(now).await
    }

    /// Close every document and socket.
    pub async fn shutdown(&self) {
        let uris: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        for uri in uris {
            self.close_document(&uri).await;
        }
        self.relay.shutdown().await;
        self.requests.cancel_all().await;
        if let Some(task) = self
            .relay_forwarder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }

    async fn require(&self, uri: &str) -> Result<Arc<DocumentSession>> {
        self.session(uri)
            .await
            .ok_or_else(|| BridgeError::Protocol(format!("document not open: {uri}")))
    }

    fn install_default_handlers(&self, router: &MessageRouter, id: u64, document: &Arc<Document>) {
        router.register_handler(
            MessageKind::Response,
            ResponseHandler::new(Arc::clone(&self.requests)),
        );

        let ready_document = Arc::clone(document);
        let resolver = Arc::clone(&self.resolver);
        let bridge = Arc::clone(&self.bridge);
        let run_url = self.config.run_url.clone();
        router.register_handler(
            MessageKind::Ready,
            handler_fn(move |_envelope, context| {
                let document = Arc::clone(&ready_document);
                let resolver = Arc::clone(&resolver);
                let bridge = Arc::clone(&bridge);
                let run_url = run_url.clone();
                async move {
                    let content = document.content().await;
                    let init = json!({
                        "documentId": id,
                        "uri": context.document_uri,
                        "kind": document.kind().as_str(),
                        "content": encode_content(&content),
                        "isRemote": document.is_remote(),
                        "isUntitled": document.is_untitled(),
                        "dirty": document.is_dirty().await,
                    });
                    context
                        .surface
                        .post(Envelope::new(MessageKind::Init, init))
                        .await?;

                    if document.is_remote() {
                        let collaboration = json!({
                            "enabled": true,
                            "documentUri": context.document_uri,
                            "serverUrl": run_url,
                            "proxied": true,
                        });
                        context
                            .surface
                            .post(Envelope::new(MessageKind::CollaborationConfig, collaboration))
                            .await?;
                    }

                    // A reloaded surface keeps its kernel.
                    if let Some(target) = bridge.binding(&context.document_uri).await {
                        debug!(uri = %context.document_uri, target = ?target, "runtime already bound, skipping auto-connect");
                        return Ok(());
                    }
                    resolver.connect(&context.document_uri, &bridge).await;
                    Ok(())
                }
            }),
        );

        let edit_document = Arc::clone(document);
        router.register_handler(
            MessageKind::Edit,
            handler_fn(move |envelope, _context| {
                let document = Arc::clone(&edit_document);
                async move {
                    let edit = parse_edit(envelope.body)?;
                    document.make_edit(edit).await?;
                    Ok(())
                }
            }),
        );

        for kind in [
            MessageKind::Connect,
            MessageKind::Disconnect,
            MessageKind::Message,
        ] {
            let relay = Arc::clone(&self.relay);
            router.register_handler(
                kind,
                handler_fn(move |envelope, context| {
                    let relay = Arc::clone(&relay);
                    async move {
                        let request = relay_request(&envelope.kind, &envelope.body)?;
                        let adapter_id = request.adapter_id().to_string();
                        let is_connect = matches!(request, RelayRequest::Connect { .. });
                        if let Err(error) = relay.handle(&context.document_uri, request).await {
                            warn!(uri = %context.document_uri, adapter_id = %adapter_id, "relay request failed: {}", error);
                            if is_connect {
                                context
                                    .surface
                                    .post(Envelope::new(
                                        MessageKind::Error,
                                        json!({ "adapterId": adapter_id, "message": error.to_string() }),
                                    ))
                                    .await?;
                            }
                        }
                        Ok(())
                    }
                }),
            );
        }

        for kind in [MessageKind::SelectRuntime, MessageKind::SelectKernel] {
            let resolver = Arc::clone(&self.resolver);
            let bridge = Arc::clone(&self.bridge);
            router.register_handler(
                kind,
                handler_fn(move |_envelope, context| {
                    let resolver = Arc::clone(&resolver);
                    let bridge = Arc::clone(&bridge);
                    async move {
                        select_runtime(&resolver, &bridge, &context.document_uri).await;
                        Ok(())
                    }
                }),
            );
        }
    }
}

/// Sessions are keyed by the normalized URI so callers may pass either form.
fn session_key(uri: &str) -> String {
    DocumentUri::parse(uri).map_or_else(|_| uri.trim().to_string(), |parsed| parsed.to_string())
}

/// Interactive selection, or the fallback when no picker exists.
async fn select_runtime(resolver: &AutoConnectResolver, bridge: &RuntimeBridge, uri: &str) {
    if resolver.picker().is_none() {
        bridge.request_selection(uri);
        return;
    }

    match resolver.ask(uri).await {
        Ok(Some(runtime)) => bridge.connect_webview_document(uri, runtime).await,
        Ok(None) => debug!(uri, "runtime selection cancelled"),
        Err(error) => warn!(uri, "runtime selection failed: {}", error),
    }
}

fn parse_edit(body: Value) -> Result<Edit> {
    let Value::Object(mut fields) = body else {
        return Ok(Edit::new("edit", None));
    };
    let label = fields
        .get("label")
        .and_then(Value::as_str)
        .unwrap_or("edit")
        .to_string();
    let content = match fields.remove("content") {
        None | Some(Value::Null) => None,
        Some(content) => Some(decode_content(content)?),
    };
    Ok(Edit::new(label, content))
}

async fn post_update(session: &DocumentSession, content: &[u8]) -> Result<()> {
    let body = json!({
        "content": encode_content(content),
        "dirty": session.document.is_dirty().await,
    });
    session
        .surface
        .post(Envelope::new(MessageKind::Update, body))
        .await
}
