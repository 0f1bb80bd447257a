//! trxflow - declarative transaction propagation for a SQL query builder.
//!
//! Service methods declare how they relate to the transaction already in
//! scope (REQUIRED, REQUIRES_NEW, SUPPORTS, MANDATORY, NOT_SUPPORTED,
//! NEVER). Queries built inside them find their transaction through a
//! task-local ambient scope, so repositories never pass handles around.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use trxflow::backend::MemoryBackend;
//! use trxflow::db::{Database, DatabaseError, DbConfig, DbDict};
//! use trxflow::propagation::{Propagator, Transactional};
//!
//! # async fn run() -> Result<(), DatabaseError> {
//! let dict = DbDict::new().with_table("tb_user", ["uid", "name"]);
//! let db = Database::new("master", Arc::new(MemoryBackend::from_dict(&dict)), dict, DbConfig::default());
//! let propagator = Propagator::new(db.clone());
//!
//! propagator
//!     .propagate(Transactional::required(), "UserService", "rename", || async {
//!         db.table("tb_user").set("name", "alice").where_eq("uid", 1).execute().await?;
//!         Ok::<_, DatabaseError>(())
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod db;
pub mod propagation;
pub mod query;
pub mod sql;
pub mod transaction;
pub mod types;

#[cfg(test)]
mod testing;

pub use db::{Database, DatabaseError, DatabaseResult, DbManager};
pub use propagation::{with_scope, Propagator, Transactional};
pub use query::QueryBuilder;
pub use transaction::TransactionHandle;
pub use types::{PropagateOptions, PropagationType, RowLockLevel};
