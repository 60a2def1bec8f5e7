use async_trait::async_trait;
use thiserror::Error;

use crate::core::api::Api;

/// Errors reported by gateway drivers.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GatewayError {
    /// The named API is not known to the gateway
    #[error("api '{0}' not found in gateway")]
    NotFound(String),

    /// The API record could not be encoded for the gateway backend
    #[error("failed to marshal api: {0}")]
    Marshal(String),

    /// Any other failure talking to the gateway backend
    #[error("gateway driver error: {0}")]
    Driver(String),
}

impl GatewayError {
    /// The controller treats a missing API on delete as success.
    pub fn is_not_found(&self) -> bool {
        matches!(self, GatewayError::NotFound(_))
    }
}

/// Result type alias for gateway driver operations
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Gateway is the port implemented by every route driver (local router, Kong).
///
/// Drivers assign `id` and `created_at` on creation; callers persist them and
/// pass them back on later updates.
#[async_trait]
pub trait Gateway: Send + Sync + 'static {
    /// Create a route binding, returning the record as stored by the driver.
    async fn add_api(&self, api: &Api) -> GatewayResult<Api>;

    /// Fetch a copy of the named record.
    async fn get_api(&self, name: &str) -> GatewayResult<Api>;

    /// Replace the record registered under `name`.
    async fn update_api(&self, name: &str, api: &Api) -> GatewayResult<Api>;

    /// Remove the record. Unknown names yield [`GatewayError::NotFound`].
    async fn delete_api(&self, api: &Api) -> GatewayResult<()>;
}
