pub mod api;
pub mod controller;
pub mod dispatcher;
pub mod input;
pub mod routing_table;
pub mod service;

pub use api::{Api, ApiEntity, ApiSpec, Status};
pub use controller::{ApiEntityHandler, Controller, ControllerOptions, Watcher};
pub use dispatcher::{DispatchOptions, Dispatcher};
pub use routing_table::RoutingTable;
pub use service::{ApiService, ApplySummary, ServiceError};
