use super::RuntimeTarget;
use crate::protocol::{Envelope, MessageKind};
use crate::surface::{SharedSurface, SurfaceTable};
use chrono::{DateTime, Utc};
use platform_client::Runtime;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Called when a surface asks for a runtime and no picker is available.
pub type SelectionFallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Document URI to runtime bindings, plus the surfaces to notify.
pub struct RuntimeBridge {
    surfaces: SurfaceTable,
    bindings: Mutex<HashMap<String, RuntimeTarget>>,
    fallback: RwLock<Option<SelectionFallback>>,
}

impl RuntimeBridge {
    pub fn new(surfaces: SurfaceTable) -> Self {
        Self {
            surfaces,
            bindings: Mutex::new(HashMap::new()),
            fallback: RwLock::new(None),
        }
    }

    pub fn register_webview(&self, uri: &str, surface: SharedSurface) {
        if self.surfaces.insert(uri, surface).is_some() {
            debug!(uri, "surface re-registered");
        }
    }

    /// Forget the surface and its binding. No notification is sent.
    pub async fn unregister_webview(&self, uri: &str) -> bool {
        let removed = self.surfaces.remove(uri).is_some();
        self.bindings.lock().await.remove(uri);
        removed
    }

    pub fn surface(&self, uri: &str) -> Option<SharedSurface> {
        self.surfaces.get(uri)
    }

    pub async fn binding(&self, uri: &str) -> Option<RuntimeTarget> {
        self.bindings.lock().await.get(uri).cloned()
    }

    pub async fn connect_webview_document(&self, uri: &str, runtime: Runtime) {
        self.attach(uri, RuntimeTarget::Remote(runtime)).await;
    }

    pub async fn connect_webview_document_to_local(&self, uri: &str) {
        self.attach(uri, RuntimeTarget::LocalExecution).await;
    }

    async fn attach(&self, uri: &str, target: RuntimeTarget) {
        let previous = self
            .bindings
            .lock()
            .await
            .insert(uri.to_string(), target.clone());

        if let Some(previous) = previous
            && previous.runtime_uid() != target.runtime_uid()
        {
            self.post(
                uri,
                MessageKind::KernelDetached,
                json!({ "runtimeUid": previous.runtime_uid(), "reason": "replaced" }),
            )
            .await;
        }

        info!(uri, runtime = ?target.runtime_uid(), "kernel selected");
        self.post(uri, MessageKind::KernelSelected, selected_body(&target))
            .await;
    }

    /// Tell every surface bound to `runtime_uid` that it is gone; returns how
    /// many documents were unbound.
    pub async fn notify_runtime_terminated(&self, runtime_uid: &str) -> usize {
        self.terminate(runtime_uid, "terminated").await
    }

    /// Terminate bound runtimes whose expiry has passed. Returns their uids.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut expired: Vec<String> = self
            .bindings
            .lock()
            .await
            .values()
            .filter_map(RuntimeTarget::runtime)
            .filter(|runtime| runtime.is_expired(now))
            .map(|runtime| runtime.uid.clone())
            .collect();
        expired.sort();
        expired.dedup();

        for uid in &expired {
            self.terminate(uid, "expired").await;
        }
        expired
    }

    async fn terminate(&self, runtime_uid: &str, reason: &str) -> usize {
        let affected: Vec<String> = {
            let mut bindings = self.bindings.lock().await;
            let uris: Vec<String> = bindings
                .iter()
                .filter(|(_, target)| target.runtime_uid() == Some(runtime_uid))
                .map(|(uri, _)| uri.clone())
                .collect();
            for uri in &uris {
                bindings.remove(uri);
            }
            uris
        };

        for uri in &affected {
            self.post(
                uri,
                MessageKind::KernelTerminated,
                json!({ "runtimeUid": runtime_uid, "reason": reason }),
            )
            .await;
        }
        if !affected.is_empty() {
            info!(runtime = runtime_uid, reason, documents = affected.len(), "runtime terminated");
        }
        affected.len()
    }

    pub fn set_selection_fallback(&self, fallback: SelectionFallback) {
        *self.fallback.write().unwrap_or_else(PoisonError::into_inner) = Some(fallback);
    }

    /// Run the fallback for `uri`; false when none is installed.
    pub fn request_selection(&self, uri: &str) -> bool {
        let fallback = self
            .fallback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match fallback {
            Some(fallback) => {
                fallback(uri);
                true
            }
            None => {
                warn!(uri, "runtime selection requested but no selector is available");
                false
            }
        }
    }

    async fn post(&self, uri: &str, kind: MessageKind, body: Value) {
        let Some(surface) = self.surfaces.get(uri) else {
            debug!(uri, kind = %kind, "no surface registered, notification dropped");
            return;
        };
        if let Err(error) = surface.post(Envelope::new(kind.clone(), body)).await {
            warn!(uri, kind = %kind, "failed to notify surface: {}", error);
        }
    }
}

fn selected_body(target: &RuntimeTarget) -> Value {
    match target {
        RuntimeTarget::LocalExecution => json!({ "kind": "pyodide", "runtime": null }),
        RuntimeTarget::Remote(runtime) => json!({
            "kind": "remote",
            "runtime": {
                "uid": runtime.uid,
                "podName": runtime.pod_name,
                "givenName": runtime.given_name,
                "environmentName": runtime.environment_name,
                "ingress": runtime.ingress,
                "token": runtime.token,
                "burningRate": runtime.burning_rate,
                "startedAt": runtime.started_at.map(|at| at.to_rfc3339()),
                "expiredAt": runtime.expired_at.map(|at| at.to_rfc3339()),
            },
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::ChannelSurface;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    fn runtime(uid: &str, expired_at: DateTime<Utc>) -> Runtime {
        Runtime {
            uid: uid.to_string(),
            pod_name: format!("pod-{uid}"),
            given_name: String::new(),
            environment_name: "python-cpu-env".to_string(),
            environment_title: None,
            ingress: String::new(),
            token: String::new(),
            burning_rate: 0.0,
            started_at: None,
            expired_at: Some(expired_at),
        }
    }

    fn bridge_with(uri: &str) -> (RuntimeBridge, mpsc::UnboundedReceiver<Envelope>) {
        let bridge = RuntimeBridge::new(SurfaceTable::new());
        let (surface, rx) = ChannelSurface::new(uri);
        bridge.register_webview(uri, Arc::new(surface));
        (bridge, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            out.push(envelope);
        }
        out
    }

    #[tokio::test]
    async fn replacing_binding_detaches_previous() {
        let uri = "remote:/doc.ipynb";
        let (bridge, mut rx) = bridge_with(uri);
        let later = Utc::now() + Duration::hours(1);

        bridge.connect_webview_document(uri, runtime("r1", later)).await;
        bridge.connect_webview_document(uri, runtime("r2", later)).await;

        let kinds: Vec<MessageKind> = drain(&mut rx).into_iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                MessageKind::KernelSelected,
                MessageKind::KernelDetached,
                MessageKind::KernelSelected,
            ]
        );
        assert_eq!(
            bridge.binding(uri).await.and_then(|t| t.runtime_uid().map(str::to_string)),
            Some("r2".to_string())
        );
    }

    #[tokio::test]
    async fn local_binding_reports_pyodide() {
        let uri = "file:///doc.ipynb";
        let (bridge, mut rx) = bridge_with(uri);
        bridge.connect_webview_document_to_local(uri).await;

        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, MessageKind::KernelSelected);
        assert_eq!(sent[0].body["kind"], "pyodide");
        assert_eq!(bridge.binding(uri).await, Some(RuntimeTarget::LocalExecution));
    }

    #[tokio::test]
    async fn termination_notifies_all_bound_documents() {
        let bridge = RuntimeBridge::new(SurfaceTable::new());
        let (a, mut rx_a) = ChannelSurface::new("remote:/a.ipynb");
        let (b, mut rx_b) = ChannelSurface::new("remote:/b.ipynb");
        bridge.register_webview("remote:/a.ipynb", Arc::new(a));
        bridge.register_webview("remote:/b.ipynb", Arc::new(b));

        let shared = runtime("shared", Utc::now() + Duration::hours(1));
        bridge.connect_webview_document("remote:/a.ipynb", shared.clone()).await;
        bridge.connect_webview_document("remote:/b.ipynb", shared).await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        assert_eq!(bridge.notify_runtime_terminated("shared").await, 2);
        for rx in [&mut rx_a, &mut rx_b] {
            let sent = drain(rx);
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].kind, MessageKind::KernelTerminated);
            assert_eq!(sent[0].body["runtimeUid"], "shared");
        }
        assert_eq!(bridge.binding("remote:/a.ipynb").await, None);
        assert_eq!(bridge.notify_runtime_terminated("shared").await, 0);
    }

    #[tokio::test]
    async fn sweep_terminates_only_expired() {
        let now = Utc::now();
        let bridge = RuntimeBridge::new(SurfaceTable::new());
        bridge
            .connect_webview_document("remote:/old.ipynb", runtime("old", now - Duration::minutes(1)))
            .await;
        bridge
            .connect_webview_document("remote:/new.ipynb", runtime("new", now + Duration::minutes(30)))
            .await;

        assert_eq!(bridge.sweep_expired(now).await, vec!["old".to_string()]);
        assert_eq!(bridge.binding("remote:/old.ipynb").await, None);
        assert!(bridge.binding("remote:/new.ipynb").await.is_some());
    }

    #[tokio::test]
    async fn selection_fallback_is_invoked() {
        let bridge = RuntimeBridge::new(SurfaceTable::new());
        assert!(!bridge.request_selection("file:///a.ipynb"));

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        bridge.set_selection_fallback(Arc::new(move |_uri: &str| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(bridge.request_selection("file:///a.ipynb"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
