//! Database API - one data source with its transaction registry.

use std::sync::Arc;

use thiserror::Error;

use crate::backend::{Backend, BackendError};
use crate::db::config::DbConfig;
use crate::db::dict::DbDict;
use crate::propagation::{AmbientFrame, PropagationError, UsageError};
use crate::query::{QueryBuilder, QueryError};
use crate::sql::{ParseError, Parser, Statement};
use crate::transaction::{
    BeginOptions, HandleContext, TransactionError, TransactionHandle, TransactionRegistry,
};
use crate::types::{IdGenerator, PropagateOptions, QueryId, ScopeKey, TrxActionOnEnd};

/// Result type for database operations.
pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Database errors.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("transaction error: {0}")]
    Transaction(#[from] TransactionError),

    #[error("propagation error: {0}")]
    Propagation(#[from] PropagationError),

    #[error("usage error: {0}")]
    Usage(#[from] UsageError),

    #[error("query error: {0}")]
    Query(#[from] QueryError),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("data source already exists: {0}")]
    AlreadyExists(String),

    #[error("data source not found: {0}")]
    NotFound(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Options for an explicitly started transaction.
#[derive(Debug, Clone, Default)]
pub struct TransactionOptions {
    /// Bind the transaction to this scope so ambient queries join it.
    pub scope: Option<ScopeKey>,
    /// Overrides the data source's `trx_action_on_end`.
    pub action_on_end: Option<TrxActionOnEnd>,
    pub propagate_options: Option<PropagateOptions>,
    pub entry_key: Option<String>,
}

impl TransactionOptions {
    pub fn scope(mut self, scope: impl Into<ScopeKey>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn action_on_end(mut self, action: TrxActionOnEnd) -> Self {
        self.action_on_end = Some(action);
        self
    }

    pub fn propagate_options(mut self, options: PropagateOptions) -> Self {
        self.propagate_options = Some(options);
        self
    }

    pub fn entry_key(mut self, key: impl Into<String>) -> Self {
        self.entry_key = Some(key.into());
        self
    }
}

/// Database statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseStats {
    /// Number of tables in the dictionary.
    pub tables: usize,
    /// Live transactions and savepoints.
    pub active_transactions: usize,
}

/// Handle to one data source.
///
/// Cheap to clone; clones share the backend and the registry.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    id: Arc<str>,
    ctx: HandleContext,
    dict: DbDict,
    config: DbConfig,
}

impl Database {
    pub fn new(id: impl Into<Arc<str>>, backend: Arc<dyn Backend>, dict: DbDict, config: DbConfig) -> Self {
        let id: Arc<str> = id.into();
        let ctx = HandleContext {
            backend,
            registry: TransactionRegistry::new(),
            ids: Arc::new(IdGenerator::new(id.clone())),
        };
        Self {
            inner: Arc::new(DatabaseInner { id, ctx, dict, config }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub(crate) fn id_arc(&self) -> Arc<str> {
        self.inner.id.clone()
    }

    pub fn config(&self) -> &DbConfig {
        &self.inner.config
    }

    pub fn dict(&self) -> &DbDict {
        &self.inner.dict
    }

    pub fn registry(&self) -> &TransactionRegistry {
        &self.inner.ctx.registry
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.inner.ctx.backend
    }

    /// Start a query against `table`.
    pub fn table(&self, table: impl Into<String>) -> QueryBuilder {
        QueryBuilder::new(self.clone(), Statement::new(table))
    }

    /// Start a query from raw SQL.
    pub fn raw(&self, sql: &str) -> DatabaseResult<QueryBuilder> {
        let statement = Parser::parse(sql)?;
        Ok(QueryBuilder::new(self.clone(), statement))
    }

    /// Begin a transaction explicitly.
    ///
    /// The caller completes it; queries reach it through `transacting`, or
    /// through the ambient scope when `options.scope` is set.
    pub async fn transaction(&self, options: TransactionOptions) -> DatabaseResult<TransactionHandle> {
        let mut propagate = options.propagate_options.unwrap_or_else(|| {
            let defaults = &self.config().propagation;
            PropagateOptions::new(defaults.default_propagation)
                .read_row_lock_level(defaults.read_row_lock_level)
                .write_row_lock_level(defaults.write_row_lock_level)
        });
        if let Some(key) = options.entry_key {
            propagate = propagate.entry_key(key);
        }

        let handle = TransactionHandle::begin(
            &self.inner.ctx,
            BeginOptions {
                options: Some(Arc::new(propagate)),
                scope: options.scope.clone(),
                action_on_end: options.action_on_end.unwrap_or(self.config().trx_action_on_end),
                implicit: false,
            },
        )
        .await?;

        if let Some(scope) = &options.scope {
            self.bind_scope(scope, &handle, false).await?;
        }
        Ok(handle)
    }

    /// Live transaction a frame runs in: its bound transaction for this
    /// data source, else the top of its scope.
    ///
    /// A bound transaction that already completed is an error: the frame
    /// still belongs to it, and starting over would commit half its work.
    pub(crate) fn ambient_transaction(&self, frame: &AmbientFrame) -> DatabaseResult<Option<TransactionHandle>> {
        let registry = self.registry();
        if let Some(tx_id) = frame.bound_for(self.id()) {
            return match registry.handle(tx_id) {
                Some(handle) if !handle.is_completed() => Ok(Some(handle)),
                _ => Err(TransactionError::unknown(tx_id).into()),
            };
        }
        Ok(frame
            .scope
            .as_ref()
            .and_then(|s| registry.lookup(s))
            .and_then(|id| registry.handle(&id))
            .filter(|h| !h.is_completed()))
    }

    /// Begin a transaction owned by a decorated call and bind it to `scope`.
    pub(crate) async fn begin_scoped(
        &self,
        scope: &ScopeKey,
        options: Arc<PropagateOptions>,
    ) -> DatabaseResult<TransactionHandle> {
        let handle = TransactionHandle::begin(
            &self.inner.ctx,
            BeginOptions {
                options: Some(options),
                scope: Some(scope.clone()),
                action_on_end: self.config().trx_action_on_end,
                implicit: false,
            },
        )
        .await?;
        self.bind_scope(scope, &handle, false).await?;
        Ok(handle)
    }

    /// Open a savepoint under `parent` and push it onto `scope`.
    pub(crate) async fn begin_nested(
        &self,
        scope: &ScopeKey,
        parent: &TransactionHandle,
        options: Arc<PropagateOptions>,
    ) -> DatabaseResult<TransactionHandle> {
        let handle = parent
            .open_savepoint(BeginOptions {
                options: Some(options),
                scope: Some(scope.clone()),
                action_on_end: parent.action_on_end(),
                implicit: false,
            })
            .await?;
        self.bind_scope(scope, &handle, true).await?;
        Ok(handle)
    }

    /// Begin a transaction for a single query with nothing in scope.
    pub(crate) async fn begin_implicit(
        &self,
        options: Option<Arc<PropagateOptions>>,
    ) -> DatabaseResult<TransactionHandle> {
        let handle = TransactionHandle::begin(
            &self.inner.ctx,
            BeginOptions {
                options,
                scope: None,
                action_on_end: TrxActionOnEnd::Commit,
                implicit: true,
            },
        )
        .await?;
        Ok(handle)
    }

    async fn bind_scope(&self, scope: &ScopeKey, handle: &TransactionHandle, nested: bool) -> DatabaseResult<()> {
        if let Err(e) = self.registry().begin_scope(scope, handle.id(), nested) {
            handle.rollback_on_error().await;
            return Err(e.into());
        }
        Ok(())
    }

    pub(crate) fn next_query_id(&self) -> QueryId {
        self.inner.ctx.ids.next_query_id()
    }

    /// Apply `TrxActionOnEnd` to every transaction still bound to `scope`,
    /// innermost first. Returns how many were completed.
    pub async fn finish_scope(&self, scope: &ScopeKey) -> DatabaseResult<usize> {
        let registry = self.registry();
        let mut finished = 0;
        let mut failure = None;

        for tx_id in registry.scope_transactions(scope).into_iter().rev() {
            let Some(handle) = registry.handle(&tx_id) else { continue };
            if let Err(e) = handle.finish().await {
                log::warn!("finishing {} at end of scope {} failed: {}", tx_id, scope, e);
                failure.get_or_insert(e);
            }
            if handle.is_completed() {
                finished += 1;
            }
        }

        match failure {
            Some(e) => Err(e.into()),
            None => Ok(finished),
        }
    }

    pub fn stats(&self) -> DatabaseStats {
        DatabaseStats {
            tables: self.dict().table_count(),
            active_transactions: self.registry().active_count(),
        }
    }

    /// Roll back every live transaction and close the backend.
    pub async fn destroy(&self) -> DatabaseResult<()> {
        let handles = self.registry().top_level_handles();
        if !handles.is_empty() {
            log::warn!("{}: rolling back {} open transaction(s) on destroy", self.id(), handles.len());
        }
        for handle in handles {
            handle.rollback_on_error().await;
        }
        self.registry().clear();
        self.backend().destroy().await?;
        log::info!("data source {} destroyed", self.id());
        Ok(())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("id", &self.inner.id)
            .field("registry", self.registry())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use crate::transaction::TransactionStatus;
    use serde_json::json;

    #[tokio::test]
    async fn test_transaction_bound_to_scope() {
        let db = testing::database();
        let scope = ScopeKey::new("req-1");

        let trx = db
            .transaction(TransactionOptions::default().scope("req-1").entry_key("Api:handle"))
            .await
            .unwrap();
        assert_eq!(db.registry().lookup(&scope), Some(trx.id().clone()));
        assert!(trx.id().as_str().ends_with("Api:handle"));

        // a second explicit transaction cannot take the same scope
        let err = db
            .transaction(TransactionOptions::default().scope("req-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Transaction(TransactionError::DuplicateScope { .. })));
        assert_eq!(db.stats().active_transactions, 1);
    }

    #[tokio::test]
    async fn test_finish_scope_applies_action() {
        let (db, backend) = testing::setup();
        let trx = db
            .transaction(
                TransactionOptions::default()
                    .scope("req-2")
                    .action_on_end(TrxActionOnEnd::Commit),
            )
            .await
            .unwrap();
        db.table("tb_user")
            .insert(json!({"uid": 3, "name": "carol"}))
            .transacting(&trx)
            .unwrap()
            .execute()
            .await
            .unwrap();

        let finished = db.finish_scope(&ScopeKey::new("req-2")).await.unwrap();
        assert_eq!(finished, 1);
        assert_eq!(trx.status(), TransactionStatus::Committed);
        assert_eq!(backend.rows("tb_user").len(), 3);
    }

    #[tokio::test]
    async fn test_finish_scope_rolls_back_by_default() {
        let (db, backend) = testing::setup();
        let trx = db
            .transaction(TransactionOptions::default().scope("req-3"))
            .await
            .unwrap();
        let _sp = trx.savepoint().await.unwrap();

        let finished = db.finish_scope(&ScopeKey::new("req-3")).await.unwrap();
        assert_eq!(finished, 1);
        assert_eq!(trx.status(), TransactionStatus::RolledBack);
        assert_eq!(backend.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_destroy_rolls_back_open_work() {
        let (db, backend) = testing::setup();
        let trx = testing::begin(&db).await;
        let sp = trx.savepoint().await.unwrap();

        db.destroy().await.unwrap();

        assert!(sp.is_completed() && trx.is_completed());
        assert_eq!(db.registry().active_count(), 0);
        assert!(backend.is_destroyed());
        // the implicit transaction for the read cannot begin any more
        assert!(matches!(
            db.table("tb_user").fetch().await,
            Err(DatabaseError::Transaction(TransactionError::Backend(BackendError::Closed)))
        ));
    }

    #[test]
    fn test_raw_parse_error() {
        let db = testing::database();
        assert!(matches!(db.raw(""), Err(DatabaseError::Parse(_))));
        let q = db.raw("select count(*) from tb_user where uid > 1 for update").unwrap();
        assert_eq!(q.statement().lock, Some(crate::types::RowLockLevel::ForUpdate));
    }
}
