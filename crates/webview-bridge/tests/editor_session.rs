use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use webview_bridge::document::decode_content;
use webview_bridge::{
    BridgeConfig, ChannelSurface, DocumentState, DocumentUri, EditorHost, Envelope,
    FsDocumentStore, MessageKind, RouteOutcome, Runtime, RuntimeDirectory, RuntimeTarget,
    WriteOutcome,
};

const WAIT: Duration = Duration::from_secs(5);

struct StaticDirectory(Vec<Runtime>);

#[async_trait]
impl RuntimeDirectory for StaticDirectory {
    async fn list_runtimes(&self) -> webview_bridge::Result<Vec<Runtime>> {
        Ok(self.0.clone())
    }
}

fn host_with(autoconnect: &[&str], cache_dir: Option<std::path::PathBuf>, runtimes: Vec<Runtime>) -> Arc<EditorHost> {
    let mut config = BridgeConfig {
        request_timeout: Duration::from_secs(2),
        autoconnect: autoconnect.iter().map(|name| (*name).to_string()).collect(),
        cache_dir: cache_dir.clone(),
        ..BridgeConfig::default()
    };
    config.relay.reconnect_floor = Duration::from_millis(20);
    config.relay.reconnect_cap = Duration::from_millis(80);
    Arc::new(EditorHost::new(
        config,
        Arc::new(FsDocumentStore::new(cache_dir)),
        Arc::new(StaticDirectory(runtimes)),
        None,
    ))
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> anyhow::Result<Envelope> {
    tokio::time::timeout(WAIT, rx.recv())
        .await?
        .ok_or_else(|| anyhow::anyhow!("surface channel closed"))
}

async fn next_of(
    rx: &mut mpsc::UnboundedReceiver<Envelope>,
    kind: MessageKind,
) -> anyhow::Result<Envelope> {
    loop {
        let envelope = next(rx).await?;
        if envelope.kind == kind {
            return Ok(envelope);
        }
    }
}

#[tokio::test]
async fn local_document_lifecycle() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("analysis.ipynb");
    tokio::fs::write(&path, br#"{"cells":[]}"#).await?;
    let uri = DocumentUri::from_file_path(&path)?.to_string();

    let host = host_with(&["pyodide"], None, Vec::new());
    let (surface, mut rx) = ChannelSurface::new(uri.clone());
    let session = host.open_document(&uri, Arc::new(surface), None).await?;
    assert_eq!(host.registry().lookup_id(&uri), Some(session.id()));

    let outcome = host
        .handle_message(&uri, Envelope::new(MessageKind::Ready, json!({})))
        .await?;
    assert_eq!(outcome, RouteOutcome::Dispatched);

    let init = next(&mut rx).await?;
    assert_eq!(init.kind, MessageKind::Init);
    assert_eq!(init.body["content"], r#"{"cells":[]}"#);
    assert_eq!(init.body["isRemote"], false);
    let selected = next(&mut rx).await?;
    assert_eq!(selected.kind, MessageKind::KernelSelected);
    assert_eq!(selected.body["kind"], "pyodide");
    assert_eq!(
        host.runtime_bridge().binding(&uri).await,
        Some(RuntimeTarget::LocalExecution)
    );

    host.handle_message(
        &uri,
        Envelope::new(MessageKind::Edit, json!({"label": "add cell", "content": r#"{"cells":[1]}"#})),
    )
    .await?;
    assert_eq!(session.document().state().await, DocumentState::LocalDirty);

    // Undo pushes the baseline back to the surface, redo restores the edit.
    assert!(host.undo(&uri).await?);
    let update = next(&mut rx).await?;
    assert_eq!(update.kind, MessageKind::Update);
    assert_eq!(update.body["content"], r#"{"cells":[]}"#);
    assert!(host.redo(&uri).await?);
    let update = next(&mut rx).await?;
    assert_eq!(update.body["content"], r#"{"cells":[1]}"#);

    // Save asks the surface for its content through a getFileData request.
    let responder_host = Arc::clone(&host);
    let responder_uri = uri.clone();
    let responder = tokio::spawn(async move {
        let request = next_of(&mut rx, MessageKind::GetFileData).await?;
        let request_id = request
            .request_id
            .ok_or_else(|| anyhow::anyhow!("getFileData without requestId"))?;
        responder_host
            .handle_message(
                &responder_uri,
                Envelope::response(request_id, json!(r#"{"cells":["saved"]}"#)),
            )
            .await?;
        anyhow::Ok(rx)
    });

    let saved = host.save(&uri, &CancellationToken::new()).await?;
    assert_eq!(saved, WriteOutcome::Written);
    let _rx = responder.await??;
    assert_eq!(tokio::fs::read(&path).await?, br#"{"cells":["saved"]}"#.to_vec());
    assert_eq!(session.document().state().await, DocumentState::LocalClean);
    assert_eq!(host.requests().pending_count().await, 0);

    assert!(host.close_document(&uri).await);
    assert!(session.document().is_disposed());
    assert_eq!(host.registry().lookup_id(&uri), None);
    assert_eq!(host.runtime_bridge().binding(&uri).await, None);
    assert!(!host.close_document(&uri).await);
    Ok(())
}

#[tokio::test]
async fn remote_document_gets_collaboration_config_and_active_runtime() -> anyhow::Result<()> {
    let now = Utc::now();
    let runtime = Runtime {
        uid: "rt-1".to_string(),
        pod_name: "jupyter-rt-1".to_string(),
        given_name: "Analysis".to_string(),
        environment_name: "python-cpu-env".to_string(),
        environment_title: None,
        ingress: "https://runtimes.example.com/rt-1".to_string(),
        token: "token".to_string(),
        burning_rate: 0.01,
        started_at: Some(now),
        expired_at: Some(now + chrono::Duration::minutes(30)),
    };
    let host = host_with(&["active-runtime", "ask"], None, vec![runtime]);
    let uri = "remote:/space-1/plan.lexical";
    let (surface, mut rx) = ChannelSurface::new(uri);
    let session = host.open_document(uri, Arc::new(surface), None).await?;
    assert_eq!(session.document().state().await, DocumentState::RemoteCollaborative);

    host.handle_message(uri, Envelope::new(MessageKind::Ready, json!(null)))
        .await?;
    let init = next(&mut rx).await?;
    assert_eq!(init.body["isRemote"], true);
    let content: serde_json::Value =
        serde_json::from_str(init.body["content"].as_str().unwrap_or_default())?;
    assert_eq!(content["root"]["type"], "root");

    let collaboration = next(&mut rx).await?;
    assert_eq!(collaboration.kind, MessageKind::CollaborationConfig);
    assert_eq!(collaboration.body["enabled"], true);

    let selected = next(&mut rx).await?;
    assert_eq!(selected.kind, MessageKind::KernelSelected);
    assert_eq!(selected.body["runtime"]["uid"], "rt-1");

    // Remote save never touches storage.
    assert_eq!(
        host.save(uri, &CancellationToken::new()).await?,
        WriteOutcome::Skipped
    );
    assert!(!session.document().is_dirty().await);

    // Expiry sweep terminates the binding once the runtime has run out.
    let swept = host.sweep_expired(now + chrono::Duration::minutes(31)).await;
    assert_eq!(swept, vec!["rt-1".to_string()]);
    let terminated = next(&mut rx).await?;
    assert_eq!(terminated.kind, MessageKind::KernelTerminated);
    assert_eq!(terminated.body["reason"], "expired");

    host.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn invalid_utf8_content_round_trips_through_the_surface() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("binary.ipynb");
    let raw = b"{\"cells\":[\"\xff\xfe\"]}".to_vec();
    tokio::fs::write(&path, &raw).await?;
    let uri = DocumentUri::from_file_path(&path)?.to_string();

    let host = host_with(&[], None, Vec::new());
    let (surface, mut rx) = ChannelSurface::new(uri.clone());
    host.open_document(&uri, Arc::new(surface), None).await?;
    host.handle_message(&uri, Envelope::new(MessageKind::Ready, json!({})))
        .await?;

    let init = next_of(&mut rx, MessageKind::Init).await?;
    assert!(init.body["content"].is_array());
    let shown = decode_content(init.body["content"].clone())?;
    assert_eq!(shown, raw);

    // The surface hands back exactly what it was given.
    host.handle_message(
        &uri,
        Envelope::new(MessageKind::Edit, json!({"label": "touch", "content": "{}"})),
    )
    .await?;
    let responder_host = Arc::clone(&host);
    let responder_uri = uri.clone();
    let echoed = init.body["content"].clone();
    let responder = tokio::spawn(async move {
        let request = next_of(&mut rx, MessageKind::GetFileData).await?;
        let request_id = request
            .request_id
            .ok_or_else(|| anyhow::anyhow!("getFileData without requestId"))?;
        responder_host
            .handle_message(&responder_uri, Envelope::response(request_id, echoed))
            .await?;
        anyhow::Ok(rx)
    });

    assert_eq!(
        host.save(&uri, &CancellationToken::new()).await?,
        WriteOutcome::Written
    );
    let mut rx = responder.await??;
    assert_eq!(tokio::fs::read(&path).await?, raw);

    // Undo back to the opening bytes pushes them unaltered as well.
    host.handle_message(
        &uri,
        Envelope::new(MessageKind::Edit, json!({"label": "touch", "content": "{}"})),
    )
    .await?;
    assert!(host.undo(&uri).await?);
    let update = next_of(&mut rx, MessageKind::Update).await?;
    assert_eq!(decode_content(update.body["content"].clone())?, raw);
    Ok(())
}

struct CountingDirectory {
    runtimes: Vec<Runtime>,
    calls: AtomicUsize,
}

#[async_trait]
impl RuntimeDirectory for CountingDirectory {
    async fn list_runtimes(&self) -> webview_bridge::Result<Vec<Runtime>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.runtimes.clone())
    }
}

#[tokio::test]
async fn reloaded_surface_keeps_its_runtime() -> anyhow::Result<()> {
    let now = Utc::now();
    let directory = Arc::new(CountingDirectory {
        runtimes: vec![Runtime {
            uid: "rt-7".to_string(),
            pod_name: "jupyter-rt-7".to_string(),
            given_name: "Shared".to_string(),
            environment_name: "python-cpu-env".to_string(),
            environment_title: None,
            ingress: "https://runtimes.example.com/rt-7".to_string(),
            token: "token".to_string(),
            burning_rate: 0.01,
            started_at: Some(now),
            expired_at: Some(now + chrono::Duration::minutes(30)),
        }],
        calls: AtomicUsize::new(0),
    });
    let host = Arc::new(EditorHost::new(
        BridgeConfig {
            autoconnect: vec!["active-runtime".to_string()],
            ..BridgeConfig::default()
        },
        Arc::new(FsDocumentStore::new(None)),
        directory.clone(),
        None,
    ));
    let uri = "remote:/space-1/reload.ipynb";
    let (surface, mut rx) = ChannelSurface::new(uri);
    host.open_document(uri, Arc::new(surface), None).await?;

    host.handle_message(uri, Envelope::new(MessageKind::Ready, json!({})))
        .await?;
    let selected = next_of(&mut rx, MessageKind::KernelSelected).await?;
    assert_eq!(selected.body["runtime"]["uid"], "rt-7");

    host.handle_message(uri, Envelope::new(MessageKind::Ready, json!({})))
        .await?;
    let mut kinds = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        kinds.push(envelope.kind);
    }
    assert_eq!(kinds, vec![MessageKind::Init, MessageKind::CollaborationConfig]);
    assert_eq!(directory.calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        host.runtime_bridge()
            .binding(uri)
            .await
            .and_then(|target| target.runtime_uid().map(str::to_string)),
        Some("rt-7".to_string())
    );
    host.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn remote_document_uses_cache_when_present() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let cache = dir.path().to_path_buf();
    tokio::fs::create_dir_all(cache.join("space-1")).await?;
    tokio::fs::write(cache.join("space-1").join("nb.ipynb"), b"{\"cells\":[\"cached\"]}").await?;

    let host = host_with(&[], Some(cache), Vec::new());
    let uri = "datalayer://space-1/nb.ipynb";
    let (surface, _rx) = ChannelSurface::new(uri);
    let session = host.open_document(uri, Arc::new(surface), None).await?;
    assert_eq!(session.document().content().await, b"{\"cells\":[\"cached\"]}".to_vec());
    Ok(())
}

#[tokio::test]
async fn unknown_messages_are_unhandled_and_unopened_documents_error() -> anyhow::Result<()> {
    let host = host_with(&[], None, Vec::new());
    let uri = "untitled:Untitled-1.ipynb";
    let (surface, _rx) = ChannelSurface::new(uri);
    host.open_document(uri, Arc::new(surface), None).await?;

    let outcome = host
        .handle_message(uri, Envelope::new(MessageKind::from("telemetry"), json!({})))
        .await?;
    assert_eq!(outcome, RouteOutcome::Unhandled);

    assert!(
        host.handle_message("file:///nowhere.ipynb", Envelope::new(MessageKind::Ready, json!({})))
            .await
            .is_err()
    );
    Ok(())
}

#[tokio::test]
async fn select_runtime_without_picker_uses_fallback() -> anyhow::Result<()> {
    let host = host_with(&[], None, Vec::new());
    let uri = "untitled:Untitled-2.lexical";
    let (surface, _rx) = ChannelSurface::new(uri);
    host.open_document(uri, Arc::new(surface), None).await?;

    let (tx, mut requested) = mpsc::unbounded_channel::<String>();
    host.runtime_bridge()
        .set_selection_fallback(Arc::new(move |uri: &str| {
            let _ = tx.send(uri.to_string());
        }));

    host.handle_message(uri, Envelope::new(MessageKind::SelectKernel, json!({})))
        .await?;
    assert_eq!(requested.recv().await.as_deref(), Some(uri));
    Ok(())
}

#[tokio::test]
async fn collaboration_messages_are_relayed_through_the_host() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let ws_url = format!("ws://{}/room", listener.local_addr()?);
    let (received_tx, mut received) = mpsc::unbounded_channel::<Message>();
    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let Ok(socket) = accept_async(stream).await else {
            return;
        };
        let (mut writer, mut reader) = socket.split();
        let _ = writer.send(Message::Binary(vec![1, 2, 3].into())).await;
        while let Some(Ok(message)) = reader.next().await {
            let _ = received_tx.send(message);
        }
    });

    let host = host_with(&[], None, Vec::new());
    let uri = "remote:/space-1/shared.ipynb";
    let (surface, mut rx) = ChannelSurface::new(uri);
    host.open_document(uri, Arc::new(surface), None).await?;

    host.handle_message(
        uri,
        Envelope::new(MessageKind::Connect, json!({"adapterId": "y1", "url": ws_url})),
    )
    .await?;

    let connecting = next_of(&mut rx, MessageKind::Status).await?;
    assert_eq!(connecting.body["status"], "connecting");
    let connected = next_of(&mut rx, MessageKind::Status).await?;
    assert_eq!(connected.body["status"], "connected");
    let update = next_of(&mut rx, MessageKind::Message).await?;
    assert_eq!(update.body["data"], json!({"type": "update", "bytes": [1, 2, 3]}));

    host.handle_message(
        uri,
        Envelope::new(MessageKind::Message, json!({"adapterId": "y1", "data": [9, 8]})),
    )
    .await?;
    let frame = tokio::time::timeout(WAIT, received.recv()).await?;
    assert_eq!(frame, Some(Message::Binary(vec![9, 8].into())));

    // An invalid URL is reported to the surface, not raised.
    host.handle_message(
        uri,
        Envelope::new(MessageKind::Connect, json!({"adapterId": "bad", "url": "https://nope"})),
    )
    .await?;
    let error = next_of(&mut rx, MessageKind::Error).await?;
    assert_eq!(error.body["adapterId"], "bad");

    assert!(host.close_document(uri).await);
    assert_eq!(host.relay().adapter_count().await, 0);
    Ok(())
}
