//! Runtime selection and kernel notifications.

mod bridge;
mod resolver;

pub use bridge::{RuntimeBridge, SelectionFallback};
pub use resolver::{
    ActiveRuntimeStrategy, AskStrategy, AutoConnectResolver, AutoConnectStrategy, PyodideStrategy,
    Resolution, StrategyContext,
};

use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use platform_client::PlatformClient;
pub use platform_client::Runtime;

/// What a document is attached to.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeTarget {
    /// In-process execution; carries no runtime reference.
    LocalExecution,
    Remote(Runtime),
}

impl RuntimeTarget {
    pub fn runtime_uid(&self) -> Option<&str> {
        match self {
            Self::LocalExecution => None,
            Self::Remote(runtime) => Some(runtime.uid.as_str()),
        }
    }

    pub fn runtime(&self) -> Option<&Runtime> {
        match self {
            Self::LocalExecution => None,
            Self::Remote(runtime) => Some(runtime),
        }
    }
}

/// Lists the runtimes available to the user.
#[async_trait]
pub trait RuntimeDirectory: Send + Sync {
    async fn list_runtimes(&self) -> Result<Vec<Runtime>>;
}

#[async_trait]
impl RuntimeDirectory for PlatformClient {
    async fn list_runtimes(&self) -> Result<Vec<Runtime>> {
        PlatformClient::list_runtimes(self)
            .await
            .map_err(|error| BridgeError::Directory(error.to_string()))
    }
}

/// Interactive runtime choice. `Ok(None)` means the user cancelled.
#[async_trait]
pub trait RuntimePicker: Send + Sync {
    async fn pick(&self, document_uri: &str, runtimes: &[Runtime]) -> Result<Option<Runtime>>;
}
