use super::{RuntimeBridge, RuntimeDirectory, RuntimePicker, RuntimeTarget};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use platform_client::Runtime;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

pub const PYODIDE: &str = "pyodide";
pub const ACTIVE_RUNTIME: &str = "active-runtime";
pub const ASK: &str = "ask";

/// Inputs available to a strategy for one resolution.
pub struct StrategyContext {
    pub document_uri: String,
    pub directory: Arc<dyn RuntimeDirectory>,
    pub picker: Option<Arc<dyn RuntimePicker>>,
    pub now: DateTime<Utc>,
}

impl StrategyContext {
    async fn live_runtimes(&self) -> Result<Vec<Runtime>> {
        let runtimes = self.directory.list_runtimes().await?;
        Ok(runtimes
            .into_iter()
            .filter(|runtime| !runtime.is_expired(self.now))
            .collect())
    }
}

#[async_trait]
pub trait AutoConnectStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Local-execution strategies end resolution whatever `try_connect` says.
    fn is_local_execution(&self) -> bool {
        false
    }

    async fn try_connect(&self, context: &StrategyContext) -> Result<Option<Runtime>>;
}

/// In-process execution; always available.
pub struct PyodideStrategy;

#[async_trait]
impl AutoConnectStrategy for PyodideStrategy {
    fn name(&self) -> &str {
        PYODIDE
    }

    fn is_local_execution(&self) -> bool {
        true
    }

    async fn try_connect(&self, _context: &StrategyContext) -> Result<Option<Runtime>> {
        Ok(None)
    }
}

/// Picks the live runtime with the most time left. Runtimes without an
/// expiry rank above all others.
pub struct ActiveRuntimeStrategy;

#[async_trait]
impl AutoConnectStrategy for ActiveRuntimeStrategy {
    fn name(&self) -> &str {
        ACTIVE_RUNTIME
    }

    async fn try_connect(&self, context: &StrategyContext) -> Result<Option<Runtime>> {
        let runtimes = context.live_runtimes().await?;
        Ok(runtimes.into_iter().max_by_key(|runtime| {
            runtime
                .remaining(context.now)
                .map_or(i64::MAX, |remaining| remaining.num_milliseconds())
        }))
    }
}

/// Asks the user through the picker; cancelling is a miss.
pub struct AskStrategy;

#[async_trait]
impl AutoConnectStrategy for AskStrategy {
    fn name(&self) -> &str {
        ASK
    }

    async fn try_connect(&self, context: &StrategyContext) -> Result<Option<Runtime>> {
        let Some(picker) = context.picker.as_ref() else {
            debug!(uri = %context.document_uri, "no runtime picker available");
            return Ok(None);
        };
        let runtimes = context.live_runtimes().await?;
        picker.pick(&context.document_uri, &runtimes).await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub strategy: String,
    pub target: RuntimeTarget,
}

/// Tries configured strategies in order until one yields a target.
pub struct AutoConnectResolver {
    strategies: RwLock<HashMap<String, Arc<dyn AutoConnectStrategy>>>,
    order: Vec<String>,
    directory: Arc<dyn RuntimeDirectory>,
    picker: Option<Arc<dyn RuntimePicker>>,
}

impl AutoConnectResolver {
    /// Resolver with the built-in strategies registered.
    pub fn new(
        order: Vec<String>,
        directory: Arc<dyn RuntimeDirectory>,
        picker: Option<Arc<dyn RuntimePicker>>,
    ) -> Self {
        let resolver = Self {
            strategies: RwLock::new(HashMap::new()),
            order,
            directory,
            picker,
        };
        resolver.register_strategy(Arc::new(PyodideStrategy));
        resolver.register_strategy(Arc::new(ActiveRuntimeStrategy));
        resolver.register_strategy(Arc::new(AskStrategy));
        resolver
    }

    pub fn register_strategy(
        &self,
        strategy: Arc<dyn AutoConnectStrategy>,
    ) -> Option<Arc<dyn AutoConnectStrategy>> {
        self.strategies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(strategy.name().to_string(), strategy)
    }

    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn picker(&self) -> Option<Arc<dyn RuntimePicker>> {
        self.picker.clone()
    }

    pub fn directory(&self) -> Arc<dyn RuntimeDirectory> {
        Arc::clone(&self.directory)
    }

    fn context(&self, document_uri: &str, now: DateTime<Utc>) -> StrategyContext {
        StrategyContext {
            document_uri: document_uri.to_string(),
            directory: Arc::clone(&self.directory),
            picker: self.picker.clone(),
            now,
        }
    }

    /// Explicit selection through the picker, outside the configured order.
    pub async fn ask(&self, document_uri: &str) -> Result<Option<Runtime>> {
        AskStrategy
            .try_connect(&self.context(document_uri, Utc::now()))
            .await
    }

    pub async fn resolve(&self, document_uri: &str) -> Option<Resolution> {
        self.resolve_at(document_uri, Utc::now()).await
    }

    pub async fn resolve_at(&self, document_uri: &str, now: DateTime<Utc>) -> Option<Resolution> {
        if self.order.is_empty() {
            return None;
        }

        let context = self.context(document_uri, now);

        for name in &self.order {
            let strategy = self
                .strategies
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(name)
                .cloned();
            let Some(strategy) = strategy else {
                warn!(strategy = %name, "unknown auto-connect strategy, skipping");
                continue;
            };

            if strategy.is_local_execution() {
                if let Err(error) = strategy.try_connect(&context).await {
                    debug!(strategy = %name, "local strategy reported: {}", error);
                }
                info!(uri = %document_uri, strategy = %name, "auto-connect chose local execution");
                return Some(Resolution {
                    strategy: name.clone(),
                    target: RuntimeTarget::LocalExecution,
                });
            }

            match strategy.try_connect(&context).await {
                Ok(Some(runtime)) if !runtime.uid.trim().is_empty() => {
                    info!(
                        uri = %document_uri,
                        strategy = %name,
                        runtime = %runtime.uid,
                        "auto-connect chose runtime"
                    );
                    return Some(Resolution {
                        strategy: name.clone(),
                        target: RuntimeTarget::Remote(runtime),
                    });
                }
                Ok(_) => debug!(uri = %document_uri, strategy = %name, "strategy found nothing"),
                Err(error) => {
                    warn!(uri = %document_uri, strategy = %name, "strategy failed: {}", error);
                }
            }
        }

        debug!(uri = %document_uri, "no auto-connect strategy succeeded");
        None
    }

    /// Resolve and attach the result through `bridge`.
    pub async fn connect(&self, document_uri: &str, bridge: &RuntimeBridge) -> Option<Resolution> {
        let resolution = self.resolve(document_uri).await?;
        match &resolution.target {
            RuntimeTarget::LocalExecution => {
                bridge.connect_webview_document_to_local(document_uri).await;
            }
            RuntimeTarget::Remote(runtime) => {
                bridge
                    .connect_webview_document(document_uri, runtime.clone())
                    .await;
            }
        }
        Some(resolution)
    }
}
