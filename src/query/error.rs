//! Query builder errors.

use thiserror::Error;

use crate::types::{QueryId, RowLockLevel, TransactionId};

/// Result type for builder operations.
pub type QueryResult<T> = Result<T, QueryError>;

/// Errors raised by the query builder before anything reaches a backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("query {query_id} is tied to {tx_id}, which has already completed")]
    StaleBuilder { query_id: QueryId, tx_id: TransactionId },

    #[error("query {query_id}: {level} cannot be combined with an aggregate")]
    IncompatibleLock { query_id: QueryId, level: RowLockLevel },

    #[error("invalid scoped column '{0}', expected table.column")]
    InvalidScopedColumn(String),

    #[error("query {query_id} already carries propagate options")]
    PropagationAlreadySet { query_id: QueryId },
}
