//! Ambient execution context.
//!
//! A task-local frame carries the scope key, the propagation options of
//! the innermost decorated call, and the transaction that call resolved
//! to. It survives every `.await` inside the task but is not inherited by
//! `tokio::spawn`; spawned work must re-enter a scope with
//! [`with_scope`] or attach queries explicitly with `transacting`.

use std::future::Future;
use std::sync::Arc;

use crate::types::{PropagateOptions, ScopeKey, TransactionId};

tokio::task_local! {
    static FRAME: AmbientFrame;
}

/// Transaction a frame resolved to, for one data source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundTransaction {
    pub db_id: Arc<str>,
    pub tx_id: TransactionId,
}

/// Snapshot of the ambient state.
#[derive(Debug, Clone, Default)]
pub struct AmbientFrame {
    pub scope: Option<ScopeKey>,
    pub options: Option<Arc<PropagateOptions>>,
    pub bound: Option<BoundTransaction>,
}

impl AmbientFrame {
    /// Bound transaction if it belongs to `db_id`.
    pub fn bound_for(&self, db_id: &str) -> Option<&TransactionId> {
        self.bound
            .as_ref()
            .filter(|b| &*b.db_id == db_id)
            .map(|b| &b.tx_id)
    }
}

/// Run `fut` with `key` as the ambient scope.
///
/// Hosts call this once per request (or other logical call chain).
pub async fn with_scope<F>(key: impl Into<ScopeKey>, fut: F) -> F::Output
where
    F: Future,
{
    let frame = AmbientFrame {
        scope: Some(key.into()),
        ..Default::default()
    };
    FRAME.scope(frame, fut).await
}

/// Current scope key, if any.
pub fn current_scope_key() -> Option<ScopeKey> {
    FRAME.try_with(|f| f.scope.clone()).ok().flatten()
}

/// Snapshot of the current frame; empty outside any scope.
pub fn current_frame() -> AmbientFrame {
    FRAME.try_with(|f| f.clone()).unwrap_or_default()
}

pub(crate) async fn enter<F>(frame: AmbientFrame, fut: F) -> F::Output
where
    F: Future,
{
    FRAME.scope(frame, fut).await
}
