pub mod clock;
pub mod conditions;
pub mod config;
pub mod distribution;
pub mod error;
pub mod files;
pub mod kv;
pub mod model;
pub mod schema;
pub mod service;
pub mod shutdown;
pub mod statistics;
pub mod store;
pub mod task;

pub use clock::{Clock, SharedClock, UtcTime};
pub use config::{ProviderKind, ServiceConfig};
pub use error::{Error, Result};
pub use service::{ApiNode, WorkerNode};
pub use shutdown::ShutdownGroup;
pub use statistics::{Collector, Provider};
pub use store::Store;
