use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use webview_bridge::{EditorHost, RouteOutcome, WriteOutcome};

use crate::transport::{CommandFrame, HostCommand, HostFrame, StdioSurface, parse_command};

/// Read commands until EOF or shutdown, replying on `outbound`.
///
/// Each document gets its own queue, so its commands start in arrival order
/// while a slow handler never holds up other documents. Surface responses
/// are routed as soon as they are read.
pub async fn serve<R>(
    host: Arc<EditorHost>,
    input: R,
    outbound: mpsc::UnboundedSender<HostFrame>,
    shutdown: CancellationToken,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    let mut queues: HashMap<String, mpsc::UnboundedSender<CommandFrame>> = HashMap::new();
    let mut workers = JoinSet::new();
    loop {
        let line = tokio::select! {
            () = shutdown.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            debug!("input closed");
            break;
        };

        let frame = match parse_command(&line) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(error) => {
                warn!("dropping malformed command: {}", error);
                send(&outbound, HostFrame::failure(None, format!("malformed command: {error}")));
                continue;
            }
        };

        if frame.command.is_surface_response() {
            run(&host, &outbound, frame, &shutdown).await;
        } else {
            let key = frame.command.uri().trim().to_string();
            let queue = queues.entry(key).or_insert_with(|| {
                let (queue, pending) = mpsc::unbounded_channel();
                workers.spawn(document_worker(
                    Arc::clone(&host),
                    pending,
                    outbound.clone(),
                    shutdown.child_token(),
                ));
                queue
            });
            if queue.send(frame).is_err() {
                debug!("document queue closed, command dropped");
            }
        }
    }

    // Let queued commands finish unless shutting down.
    drop(queues);
    while let Some(joined) = workers.join_next().await {
        if let Err(error) = joined {
            warn!("document worker ended abnormally: {}", error);
        }
    }
    Ok(())
}

/// Commands that wait on the surface are spawned so the response they need
/// can still be routed.
async fn document_worker(
    host: Arc<EditorHost>,
    mut pending: mpsc::UnboundedReceiver<CommandFrame>,
    outbound: mpsc::UnboundedSender<HostFrame>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = pending.recv() => frame,
        };
        let Some(frame) = frame else {
            break;
        };
        if frame.command.waits_on_surface() {
            let host = Arc::clone(&host);
            let outbound = outbound.clone();
            let cancel = cancel.child_token();
            tokio::spawn(async move {
                run(&host, &outbound, frame, &cancel).await;
            });
            continue;
        }
        tokio::select! {
            () = cancel.cancelled() => break,
            () = run(&host, &outbound, frame, &cancel) => {}
        }
    }
}

async fn run(
    host: &EditorHost,
    outbound: &mpsc::UnboundedSender<HostFrame>,
    frame: CommandFrame,
    cancel: &CancellationToken,
) {
    let CommandFrame { id, command } = frame;
    let name = command.name();
    let uri = command.uri().to_string();
    let reply = match execute(host, outbound, command, cancel).await {
        Ok(result) => HostFrame::success(id, result),
        Err(error) => {
            warn!(uri = %uri, command = name, "command failed: {}", error);
            HostFrame::failure(id, error)
        }
    };
    send(outbound, reply);
}

pub async fn execute(
    host: &EditorHost,
    outbound: &mpsc::UnboundedSender<HostFrame>,
    command: HostCommand,
    cancel: &CancellationToken,
) -> webview_bridge::Result<Value> {
    match command {
        HostCommand::Open { uri, backup } => {
            let surface = Arc::new(StdioSurface::new(uri.clone(), outbound.clone()));
            let session = host.open_document(&uri, surface, backup.as_deref()).await?;
            Ok(json!({ "documentId": session.id() }))
        }
        HostCommand::Close { uri } => Ok(json!({ "closed": host.close_document(&uri).await })),
        HostCommand::Save { uri } => Ok(outcome(host.save(&uri, cancel).await?)),
        HostCommand::SaveAs { uri, target } => {
            Ok(outcome(host.save_as(&uri, &target, cancel).await?))
        }
        HostCommand::Revert { uri } => Ok(outcome(host.revert(&uri, cancel).await?)),
        HostCommand::Backup { uri, destination } => {
            let backup = host.backup(&uri, &destination, cancel).await?;
            Ok(json!({ "backup": backup.id().as_str() }))
        }
        HostCommand::Undo { uri } => Ok(json!({ "applied": host.undo(&uri).await? })),
        HostCommand::Redo { uri } => Ok(json!({ "applied": host.redo(&uri).await? })),
        HostCommand::Message { uri, message } => {
            let routed = host.handle_message(&uri, message).await?;
            Ok(json!({ "dispatched": routed == RouteOutcome::Dispatched }))
        }
    }
}

fn outcome(outcome: WriteOutcome) -> Value {
    let name = match outcome {
        WriteOutcome::Written => "written",
        WriteOutcome::Skipped => "skipped",
        WriteOutcome::Cancelled => "cancelled",
    };
    json!({ "outcome": name })
}

fn send(outbound: &mpsc::UnboundedSender<HostFrame>, frame: HostFrame) {
    if outbound.send(frame).is_err() {
        debug!("outbound channel closed, frame dropped");
    }
}
