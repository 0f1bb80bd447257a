//! Backend errors.

use thiserror::Error;

/// Result type for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Failures reported by the query-builder/connection collaborator.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BackendError {
    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("column not found: {0}")]
    ColumnNotFound(String),

    #[error("column reference \"{column}\" is ambiguous between {tables}")]
    AmbiguousColumn { column: String, tables: String },

    #[error("unknown connection: {0}")]
    UnknownConnection(u64),

    #[error("invalid expression: {0}")]
    InvalidExpression(String),

    #[error("division by zero")]
    DivisionByZero,

    #[error("backend already destroyed")]
    Closed,

    #[error("backend error: {0}")]
    Other(String),
}
