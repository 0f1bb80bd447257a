//! Transaction error types.

use thiserror::Error;

use crate::backend::BackendError;
use crate::types::{QueryId, ScopeKey, TransactionId};

/// Result type for transaction operations.
pub type TransactionResult<T> = Result<T, TransactionError>;

/// Errors raised by the registry and transaction handles.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// Backend failed to begin, commit or roll back.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// Another live transaction already owns the scope.
    #[error("scope {scope} is already bound to transaction {existing}")]
    DuplicateScope {
        scope: ScopeKey,
        existing: TransactionId,
    },

    /// The transaction is not registered: never begun, or already completed.
    #[error("transaction {tx_id} is unknown or already completed{}", query_suffix(.query_id))]
    UnknownTransaction {
        tx_id: TransactionId,
        query_id: Option<QueryId>,
    },

    /// A query can belong to one transaction at a time.
    #[error("query {query_id} is attached to {attached}, cannot attach to {requested}")]
    QueryAlreadyAttached {
        query_id: QueryId,
        attached: TransactionId,
        requested: TransactionId,
    },

    /// Completing a transaction that still has open savepoints.
    #[error("transaction {tx_id} has {open} open savepoint(s)")]
    OpenSavepoint { tx_id: TransactionId, open: usize },

    /// The owner finished normally but its transaction had already been
    /// rolled back, e.g. by a failed query.
    #[error("transaction {tx_id} was rolled back before it could commit")]
    RolledBack { tx_id: TransactionId },

    /// Opening a savepoint under a completed transaction.
    #[error("cannot open a savepoint on completed transaction {tx_id}")]
    SavepointOnCompleted { tx_id: TransactionId },
}

fn query_suffix(query_id: &Option<QueryId>) -> String {
    match query_id {
        Some(q) => format!(" (query {})", q),
        None => String::new(),
    }
}

impl TransactionError {
    pub(crate) fn unknown(tx_id: &TransactionId) -> Self {
        Self::UnknownTransaction {
            tx_id: tx_id.clone(),
            query_id: None,
        }
    }

    /// Misuse of the transaction lifecycle, as opposed to a backend failure.
    pub fn is_usage_error(&self) -> bool {
        !matches!(self, TransactionError::Backend(_))
    }
}
