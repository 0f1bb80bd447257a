//! Core value types: identifiers and the propagation vocabulary.

mod ids;
mod propagation;

pub use ids::{IdGenerator, QueryId, ScopeKey, TransactionId};
pub use propagation::{caller_key, PropagateOptions, PropagationType, RowLockLevel, TrxActionOnEnd};
