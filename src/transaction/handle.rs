//! Transaction handle - a live transaction or savepoint.
//!
//! Completion happens exactly once: the first `commit`/`rollback` moves
//! the handle out of `Active`, every later call is a no-op. A handle with
//! open savepoints refuses to complete until they are finished, except on
//! error paths where the whole chain is rolled back deepest first.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::backend::{Backend, Connection};
use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::registry::TransactionRegistry;
use crate::types::{IdGenerator, PropagateOptions, ScopeKey, TransactionId, TrxActionOnEnd};

/// Lifecycle state of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Active,
    /// Commit or rollback in flight.
    Completing,
    Committed,
    RolledBack,
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionStatus::Active => write!(f, "active"),
            TransactionStatus::Completing => write!(f, "completing"),
            TransactionStatus::Committed => write!(f, "committed"),
            TransactionStatus::RolledBack => write!(f, "rolled back"),
        }
    }
}

/// Services a handle needs to begin children and report completion.
#[derive(Clone)]
pub(crate) struct HandleContext {
    pub backend: Arc<dyn Backend>,
    pub registry: TransactionRegistry,
    pub ids: Arc<IdGenerator>,
}

/// How a transaction is being started.
#[derive(Debug, Clone, Default)]
pub(crate) struct BeginOptions {
    pub options: Option<Arc<PropagateOptions>>,
    pub scope: Option<ScopeKey>,
    pub action_on_end: TrxActionOnEnd,
    /// Started by a query with no surrounding transaction.
    pub implicit: bool,
}

/// Handle to a live transaction or savepoint.
///
/// Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct TransactionHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    id: TransactionId,
    conn: Connection,
    ctx: HandleContext,
    parent: Option<TransactionHandle>,
    options: Option<Arc<PropagateOptions>>,
    scope: Option<ScopeKey>,
    action_on_end: TrxActionOnEnd,
    implicit: bool,
    started_at: DateTime<Utc>,
    state: Mutex<HandleState>,
}

struct HandleState {
    status: TransactionStatus,
    /// Savepoints being opened on the backend right now.
    reserved: usize,
    children: Vec<TransactionHandle>,
}

impl TransactionHandle {
    fn new(
        ctx: HandleContext,
        id: TransactionId,
        conn: Connection,
        parent: Option<TransactionHandle>,
        begin: BeginOptions,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                conn,
                ctx,
                parent,
                options: begin.options,
                scope: begin.scope,
                action_on_end: begin.action_on_end,
                implicit: begin.implicit,
                started_at: Utc::now(),
                state: Mutex::new(HandleState {
                    status: TransactionStatus::Active,
                    reserved: 0,
                    children: Vec::new(),
                }),
            }),
        }
    }

    /// Begin a top-level transaction and register it.
    pub(crate) async fn begin(ctx: &HandleContext, begin: BeginOptions) -> TransactionResult<Self> {
        let entry_key = begin.options.as_ref().and_then(|o| o.entry_key.clone());
        let id = ctx.ids.next_transaction_id(entry_key.as_deref());
        let conn = ctx.backend.begin_transaction().await?;

        let handle = Self::new(ctx.clone(), id, conn, None, begin);
        ctx.registry.register(handle.clone());
        log::info!(
            "transaction {} started on {}{}",
            handle.id(),
            conn,
            if handle.is_implicit() { " (implicit)" } else { "" }
        );
        Ok(handle)
    }

    /// Open a savepoint under this transaction.
    ///
    /// The savepoint shares this transaction's connection: its writes are
    /// visible here immediately and become durable with the top-level
    /// commit.
    pub async fn savepoint(&self) -> TransactionResult<TransactionHandle> {
        self.open_savepoint(BeginOptions {
            options: self.inner.options.clone(),
            scope: None,
            action_on_end: self.inner.action_on_end,
            implicit: false,
        })
        .await
    }

    pub(crate) async fn open_savepoint(&self, begin: BeginOptions) -> TransactionResult<TransactionHandle> {
        {
            let mut state = self.inner.state.lock();
            if state.status != TransactionStatus::Active {
                return Err(TransactionError::SavepointOnCompleted {
                    tx_id: self.inner.id.clone(),
                });
            }
            state.reserved += 1;
        }

        let result = self.inner.ctx.backend.begin_savepoint(&self.inner.conn).await;

        let child = {
            let mut state = self.inner.state.lock();
            state.reserved -= 1;
            let conn = result?;
            let id = self.inner.ctx.ids.next_savepoint_id(&self.inner.id);
            let child = Self::new(self.inner.ctx.clone(), id, conn, Some(self.clone()), begin);
            state.children.push(child.clone());
            child
        };

        self.inner.ctx.registry.register(child.clone());
        log::info!("savepoint {} opened under {}", child.id(), self.id());
        Ok(child)
    }

    /// Commit. A second completion is a no-op.
    ///
    /// Fails with `OpenSavepoint` while savepoints are open. A failed
    /// backend commit leaves the handle rolled back.
    pub async fn commit(&self) -> TransactionResult<()> {
        if !self.begin_completion()? {
            return Ok(());
        }

        let backend = &self.inner.ctx.backend;
        match backend.commit(&self.inner.conn).await {
            Ok(()) => {
                self.settle(TransactionStatus::Committed);
                log::info!("{} {} committed", self.kind(), self.id());
                Ok(())
            }
            Err(e) => {
                log::warn!("commit of {} failed: {}", self.id(), e);
                if let Err(rb) = backend.rollback(&self.inner.conn).await {
                    log::warn!("rollback after failed commit of {} failed: {}", self.id(), rb);
                }
                self.settle(TransactionStatus::RolledBack);
                Err(e.into())
            }
        }
    }

    /// Roll back. A second completion is a no-op.
    pub async fn rollback(&self) -> TransactionResult<()> {
        if !self.begin_completion()? {
            return Ok(());
        }

        let result = self.inner.ctx.backend.rollback(&self.inner.conn).await;
        self.settle(TransactionStatus::RolledBack);
        log::info!("{} {} rolled back", self.kind(), self.id());
        result.map_err(Into::into)
    }

    /// Roll back this handle and every open savepoint below it, deepest
    /// first. Never fails: backend errors are logged.
    pub async fn rollback_on_error(&self) {
        let mut chain = Vec::new();
        self.collect_open(&mut chain);

        for handle in chain {
            {
                let mut state = handle.inner.state.lock();
                if state.status != TransactionStatus::Active {
                    continue;
                }
                state.status = TransactionStatus::Completing;
            }
            if let Err(e) = handle.inner.ctx.backend.rollback(&handle.inner.conn).await {
                log::warn!("rollback of {} failed: {}", handle.id(), e);
            }
            handle.settle(TransactionStatus::RolledBack);
            log::info!("{} {} rolled back", handle.kind(), handle.id());
        }
    }

    /// Complete according to the handle's `TrxActionOnEnd`.
    pub(crate) async fn finish(&self) -> TransactionResult<()> {
        match self.inner.action_on_end {
            TrxActionOnEnd::Commit => {
                if let Err(e) = self.commit().await {
                    self.rollback_on_error().await;
                    return Err(e);
                }
                Ok(())
            }
            TrxActionOnEnd::Rollback => {
                self.rollback_on_error().await;
                Ok(())
            }
            TrxActionOnEnd::None => {
                log::debug!("leaving {} open at end of scope", self.id());
                Ok(())
            }
        }
    }

    /// Moves `Active` to `Completing`. `Ok(false)` when already completed.
    fn begin_completion(&self) -> TransactionResult<bool> {
        let mut state = self.inner.state.lock();
        if state.status != TransactionStatus::Active {
            log::debug!("{} already {}, ignoring completion", self.id(), state.status);
            return Ok(false);
        }
        let open = state.reserved + state.children.len();
        if open > 0 {
            return Err(TransactionError::OpenSavepoint {
                tx_id: self.inner.id.clone(),
                open,
            });
        }
        state.status = TransactionStatus::Completing;
        Ok(true)
    }

    fn settle(&self, status: TransactionStatus) {
        {
            let mut state = self.inner.state.lock();
            state.status = status;
            state.children.clear();
        }
        self.inner.ctx.registry.complete_transaction(&self.inner.id);
        if let Some(parent) = &self.inner.parent {
            parent
                .inner
                .state
                .lock()
                .children
                .retain(|c| c.id() != self.id());
        }
    }

    /// Post-order walk of the open savepoint tree rooted here.
    fn collect_open(&self, out: &mut Vec<TransactionHandle>) {
        let children = {
            let state = self.inner.state.lock();
            if state.status != TransactionStatus::Active {
                return;
            }
            state.children.clone()
        };
        for child in children.iter().rev() {
            child.collect_open(out);
        }
        out.push(self.clone());
    }

    fn kind(&self) -> &'static str {
        if self.is_savepoint() {
            "savepoint"
        } else {
            "transaction"
        }
    }

    pub fn id(&self) -> &TransactionId {
        &self.inner.id
    }

    pub fn status(&self) -> TransactionStatus {
        self.inner.state.lock().status
    }

    /// True once commit or rollback has started.
    pub fn is_completed(&self) -> bool {
        self.status() != TransactionStatus::Active
    }

    /// Handles always represent a transaction; bare runs have no handle.
    pub fn is_transaction(&self) -> bool {
        true
    }

    pub fn is_savepoint(&self) -> bool {
        self.inner.parent.is_some()
    }

    pub fn is_implicit(&self) -> bool {
        self.inner.implicit
    }

    pub fn parent_id(&self) -> Option<&TransactionId> {
        self.inner.parent.as_ref().map(|p| p.id())
    }

    pub fn scope(&self) -> Option<&ScopeKey> {
        self.inner.scope.as_ref()
    }

    pub fn propagate_options(&self) -> Option<&PropagateOptions> {
        self.inner.options.as_deref()
    }

    pub fn action_on_end(&self) -> TrxActionOnEnd {
        self.inner.action_on_end
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    pub fn open_savepoints(&self) -> usize {
        let state = self.inner.state.lock();
        state.reserved + state.children.len()
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.inner.conn
    }
}

impl PartialEq for TransactionHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for TransactionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionHandle")
            .field("id", &self.inner.id)
            .field("conn", &self.inner.conn)
            .field("status", &self.status())
            .field("parent", &self.parent_id())
            .field("scope", &self.inner.scope)
            .field("implicit", &self.inner.implicit)
            .finish()
    }
}
