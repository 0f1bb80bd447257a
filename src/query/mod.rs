//! Query builder and the interception layer around it.
//!
//! A [`QueryBuilder`] snapshots the ambient frame when it is created. When
//! the query is awaited the snapshot picks the transaction: an attached or
//! tied handle first, then the frame's bound transaction, then the scope's
//! registry entry, and finally an implicit transaction when the options
//! require one. Success detaches the query (and commits an implicit
//! transaction once nothing else is pending on it); failure rolls the
//! transaction back and returns the backend error unchanged.

mod builder;
mod error;
mod intercept;
mod paging;
mod rowlock;
mod smart_join;

pub use builder::QueryBuilder;
pub use error::{QueryError, QueryResult};
pub use paging::{page_window, Page, PagingRole, TOTAL_COLUMN};
pub use rowlock::{apply_row_lock, select_lock_level};
pub use smart_join::{column_mapping, resolve_column_aliases, smart_join, split_scoped_column};
