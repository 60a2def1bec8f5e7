pub mod admin;
pub mod config_providers;
pub mod function_client;
pub mod kong;
pub mod local_gateway;
pub mod memory_store;
pub mod server;

/// Re-export commonly used types from adapters
pub use config_providers::FileConfigProvider;
pub use function_client::HttpFunctionClient;
pub use kong::KongClient;
pub use local_gateway::LocalGateway;
pub use memory_store::InMemoryEntityStore;
