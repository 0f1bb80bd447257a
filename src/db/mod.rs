//! Data source facade.
//!
//! A [`Database`] is one data source: a backend, its transaction registry
//! and its configuration. [`DbManager`] keeps several of them by name and
//! tears them down together.

mod api;
mod config;
mod dict;
mod manager;

pub use api::{Database, DatabaseError, DatabaseResult, DatabaseStats, TransactionOptions};
pub use config::{DbConfig, ManagerConfig, PropagationConfig};
pub use dict::DbDict;
pub use manager::{DbManager, DestroyOutcome};
