pub mod backup;
pub mod config;
pub mod error;
pub mod executor;
pub mod facade;
pub mod hooks;
pub mod migrations;
pub mod pool;
pub mod stmt_cache;
pub mod subscriptions;
pub mod tracker;
pub mod value;

pub use config::{DatabaseDescriptor, PoolOptions, TrackerOptions};
pub use error::{Error, Result};
pub use executor::ExecuteResult;
pub use facade::Database;
pub use hooks::{HookConfig, HookEvent, HookRegistry};
pub use migrations::{MigrationFile, MigrationReport};
pub use pool::DbPool;
pub use subscriptions::{Callback, SubscriptionId, SubscriptionManager};
pub use tracker::{ChangeEvent, ChangeKind, ChangeTracker};
pub use value::{Filter, Row, Value};
