//! apiman - declarative API routes reconciled onto a gateway, with an embedded gateway.
//!
//! API routes are declared per organization (through the management API or the
//! `[[apis]]` section of the config file) and stored as entities with a
//! lifecycle status. A reconciliation controller converges a gateway driver
//! towards the stored state and records the outcome back on each entity.
//!
//! Two drivers are provided:
//! - [`adapters::LocalGateway`]: an in-process router that matches requests by
//!   path, method and host and dispatches them to a function manager.
//! - [`adapters::KongClient`]: an external Kong gateway driven over its admin API.
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters** (implementations) while keeping
//! domain logic inside `core`:
//! - [`ports::Gateway`], [`ports::EntityStore`], [`ports::FunctionClient`] and
//!   [`ports::ConfigProvider`] are the seams.
//! - [`core::RoutingTable`] and [`core::Dispatcher`] implement request matching and execution.
//! - [`core::Controller`] and [`core::ApiService`] implement reconciliation and management.
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use apiman::{
//!     adapters::{HttpFunctionClient, InMemoryEntityStore, LocalGateway},
//!     core::{ApiService, Controller, ControllerOptions, DispatchOptions},
//!     ports::EntityStore,
//! };
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let store: Arc<dyn EntityStore> = Arc::new(InMemoryEntityStore::new());
//! let client = Arc::new(HttpFunctionClient::new(
//!     "http://localhost:8080",
//!     std::time::Duration::from_secs(60),
//! )?);
//! let gateway = Arc::new(
//!     LocalGateway::new(Some(store.clone()), client, DispatchOptions::default()).await,
//! );
//! let controller = Controller::new(ControllerOptions::default(), store.clone(), gateway);
//! controller.start().await?;
//! let service = ApiService::new(store).with_watcher(controller.watcher());
//! # let _ = service;
//! # Ok(()) }
//! ```
//!
//! # Error Handling
//! Ports return domain specific `thiserror` enums; application plumbing returns
//! `eyre::Result<T>` with context attached through `WrapErr`.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

pub use crate::{
    adapters::{HttpFunctionClient, InMemoryEntityStore, KongClient, LocalGateway},
    core::{ApiService, Controller},
    utils::GracefulShutdown,
};
