use async_trait::async_trait;
use eyre::Result;
use tokio::sync::mpsc;

use crate::config::models::ManagerConfig;

/// Source of the manager configuration that can signal when it changes.
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    /// Load the current configuration.
    async fn load_config(&self) -> Result<ManagerConfig>;

    /// Take the change notification channel. Each message means the source
    /// changed and `load_config` should be called again.
    ///
    /// Returns `None` once the channel has already been taken.
    fn watch(&self) -> Option<mpsc::Receiver<()>>;
}
