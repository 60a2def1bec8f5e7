//! Capability traits the core depends on. Implementations live in `adapters`.
pub mod config_provider;
pub mod entity_store;
pub mod function_client;
pub mod gateway;

pub use config_provider::ConfigProvider;
pub use entity_store::{EntityFilter, EntityStore, StoreError, StoreResult};
pub use function_client::{
    FunctionClient, FunctionClientError, FunctionClientResult, RunRequest, RunResponse,
};
pub use gateway::{Gateway, GatewayError, GatewayResult};
