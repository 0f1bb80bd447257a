//! Propagation and registration errors.

use thiserror::Error;

use crate::types::TransactionId;

/// Result type for dispatch decisions.
pub type PropagationResult<T> = Result<T, PropagationError>;

/// Result type for interceptor registration.
pub type UsageResult<T> = Result<T, UsageError>;

/// The declared propagation type cannot be satisfied in the current scope.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PropagationError {
    #[error("{caller} requires an existing transaction (MANDATORY) but none is in scope")]
    NoTransaction { caller: String },

    #[error("{caller} must not run in a transaction (NEVER) but {tx_id} is in scope")]
    UnexpectedTransaction { caller: String, tx_id: TransactionId },
}

/// Invalid declaration, raised when a policy is registered.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UsageError {
    #[error("propagation already declared for {target}")]
    DuplicateDeclaration { target: String },

    #[error("{target} is not async; transactional methods must be async")]
    NotAsync { target: String },

    #[error("invalid decorator target: {0}")]
    InvalidTarget(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
