//! Editor host process.
//!
//! Reads [`transport::HostCommand`] lines on stdin and writes surface
//! messages and replies on stdout. Logs go to stderr.

mod commands;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::Parser;
use platform_client::{PlatformClient, PlatformClientConfig};
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use webview_bridge::config::parse_strategy_list;
use webview_bridge::{BridgeConfig, EditorHost, FsDocumentStore};

use crate::transport::HostFrame;

#[derive(Parser, Debug, Default)]
#[command(name = "editor-host", about = "Host-side bridge for notebook and rich-text editor surfaces")]
struct Cli {
    /// Directory holding cached copies of remote documents.
    #[arg(long, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    /// Comma-separated auto-connect strategies; empty disables auto-connect.
    #[arg(long, value_name = "STRATEGIES")]
    autoconnect: Option<String>,

    #[arg(long, value_name = "URL")]
    run_url: Option<String>,

    #[arg(long, value_name = "MS")]
    request_timeout_ms: Option<u64>,

    #[arg(long, value_name = "SECONDS")]
    expiry_sweep_seconds: Option<u64>,
}

impl Cli {
    /// Flags win over the environment.
    fn apply(self, mut config: BridgeConfig) -> Result<BridgeConfig> {
        if let Some(cache_dir) = self.cache_dir {
            config.cache_dir = Some(cache_dir);
        }
        if let Some(autoconnect) = self.autoconnect {
            config.autoconnect = parse_strategy_list(&autoconnect);
        }
        if let Some(run_url) = self.run_url {
            config.run_url = run_url;
        }
        if let Some(timeout_ms) = self.request_timeout_ms {
            if timeout_ms == 0 {
                bail!("--request-timeout-ms must be greater than zero");
            }
            config.request_timeout = Duration::from_millis(timeout_ms);
        }
        if let Some(seconds) = self.expiry_sweep_seconds {
            if seconds == 0 {
                bail!("--expiry-sweep-seconds must be greater than zero");
            }
            config.expiry_sweep_interval = Duration::from_secs(seconds);
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.apply(BridgeConfig::from_env().context("load bridge config")?)?;

    let mut platform = PlatformClientConfig::new(config.run_url.clone());
    if let Some(token) = &config.token {
        platform = platform.with_token(token.clone());
    }
    let directory = Arc::new(PlatformClient::new(platform).context("build platform client")?);
    let store = Arc::new(FsDocumentStore::new(config.cache_dir.clone()));
    let host = Arc::new(EditorHost::new(config.clone(), store, directory, None));

    let (outbound, frames) = mpsc::unbounded_channel::<HostFrame>();
    let fallback = outbound.clone();
    host.runtime_bridge()
        .set_selection_fallback(Arc::new(move |uri: &str| {
            if fallback.send(HostFrame::event("selectRuntime", uri)).is_err() {
                warn!(uri, "selection request dropped, output closed");
            }
        }));
    let writer = tokio::spawn(transport::write_frames(frames, tokio::io::stdout()));

    let shutdown = CancellationToken::new();
    let sweeper = spawn_expiry_sweeper(
        Arc::clone(&host),
        config.expiry_sweep_interval,
        shutdown.clone(),
    );
    let interrupt = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            interrupt.cancel();
        }
    });

    info!(
        run_url = %config.run_url,
        autoconnect = ?config.autoconnect,
        cache_dir = ?config.cache_dir,
        "editor host ready"
    );
    let served = commands::serve(
        Arc::clone(&host),
        BufReader::new(tokio::io::stdin()),
        outbound,
        shutdown.clone(),
    )
    .await;

    shutdown.cancel();
    host.shutdown().await;
    if let Err(error) = sweeper.await {
        warn!("expiry sweeper ended abnormally: {}", error);
    }
    drop(host);
    // The selection fallback keeps a sender alive inside the host; give the
    // writer a moment to flush what is queued.
    match tokio::time::timeout(Duration::from_secs(1), writer).await {
        Ok(Ok(Err(error))) => warn!("output writer failed: {}", error),
        Ok(Err(error)) => warn!("output writer panicked: {}", error),
        Ok(Ok(Ok(()))) | Err(_) => {}
    }
    served
}

/// Periodically terminate bound runtimes whose credits ran out.
fn spawn_expiry_sweeper(
    host: Arc<EditorHost>,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let expired = host.sweep_expired(Utc::now()).await;
                    if !expired.is_empty() {
                        info!(count = expired.len(), runtimes = ?expired, "expired runtimes terminated");
                    }
                }
            }
        }
    })
}
