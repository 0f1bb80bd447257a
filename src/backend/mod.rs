//! The query-builder/connection collaborator.
//!
//! The propagation engine never talks SQL to a database directly. It asks
//! a [`Backend`] for connections, savepoints and statement execution, and
//! keeps all bookkeeping (which query belongs to which transaction, which
//! lock to take) on its own side.
//!
//! ```text
//!   Database ──► TransactionHandle ──► Backend::begin_transaction / commit / rollback
//!       │                 │
//!       │                 └────────► Backend::begin_savepoint(parent)
//!       ▼
//!   QueryBuilder ─(resolve)─► Backend::execute(Some(conn) | None, &Statement)
//! ```
//!
//! [`MemoryBackend`] is a complete in-process implementation with real
//! savepoint visibility: writes through a transaction or any of its
//! savepoints are visible on that transaction's connection immediately
//! and to everyone else only after the top-level commit.

mod error;
mod eval;
mod memory;
mod result;

use std::fmt;

use async_trait::async_trait;

pub use error::{BackendError, BackendResult};
pub use eval::{compare_values, evaluate, matches_where, values_equal};
pub use memory::{BackendStats, MemoryBackend};
pub use result::ResultSet;

use crate::sql::Statement;

/// Opaque handle to a live backend transaction or savepoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Connection(u64);

impl Connection {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Connection-level operations the engine relies on.
///
/// `commit`/`rollback` on a savepoint connection mean release and
/// rollback-to. Executing with `None` runs outside any transaction.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn begin_transaction(&self) -> BackendResult<Connection>;

    async fn begin_savepoint(&self, parent: &Connection) -> BackendResult<Connection>;

    async fn commit(&self, conn: &Connection) -> BackendResult<()>;

    async fn rollback(&self, conn: &Connection) -> BackendResult<()>;

    async fn execute(&self, conn: Option<&Connection>, statement: &Statement) -> BackendResult<ResultSet>;

    /// Release every resource. Later calls fail with [`BackendError::Closed`].
    async fn destroy(&self) -> BackendResult<()>;
}
