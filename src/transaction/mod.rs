//! Transaction bookkeeping.
//!
//! Every live transaction or savepoint is a [`TransactionHandle`] tracked
//! by the data source's [`TransactionRegistry`]. The registry answers the
//! two questions propagation keeps asking: which transaction does this
//! scope run in, and which queries are still running in it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   TransactionRegistry                       │
//! │  scope ─► [tx stack]    tx ─► {queries}    query ─► tx      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//!                  ┌───────────────────────┐
//!                  │   TransactionHandle   │──► Backend connection
//!                  │  Active ─► Completing │
//!                  │  ─► Committed/RolledBack
//!                  └───────────────────────┘
//!                              │ savepoint()
//!                              ▼
//!                  ┌───────────────────────┐
//!                  │   TransactionHandle   │  (parent = above)
//!                  └───────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let trx = db.transaction(TransactionOptions::default()).await?;
//! let sp = trx.savepoint().await?;
//!
//! db.table("tb_user").set("name", "n1").where_eq("uid", 1).transacting(&sp)?.execute().await?;
//!
//! sp.commit().await?;   // parent stays active
//! trx.commit().await?;  // durable now; a second commit is a no-op
//! ```

mod error;
mod handle;
mod registry;

pub use error::{TransactionError, TransactionResult};
pub use handle::{TransactionHandle, TransactionStatus};
pub(crate) use handle::{BeginOptions, HandleContext};
pub use registry::TransactionRegistry;
