//! Query builder returned by `Database::table`.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::db::{Database, DatabaseResult};
use crate::propagation::{current_frame, AmbientFrame, UsageError};
use crate::query::error::QueryError;
use crate::query::paging::PagingRole;
use crate::query::rowlock::apply_row_lock;
use crate::query::smart_join::smart_join;
use crate::sql::{
    Aggregate, AggregateFunc, Assignment, BinaryOperator, Clause, Expr, JoinKind, Method, OrderBy,
    SelectColumn, Statement,
};
use crate::transaction::{TransactionError, TransactionHandle};
use crate::types::{PropagateOptions, QueryId, RowLockLevel, TransactionId};

/// A statement under construction plus the ambient state it was built in.
///
/// Nothing touches the backend until `fetch`, `fetch_one`, `execute` or
/// `paginate` is awaited.
pub struct QueryBuilder {
    pub(crate) db: Database,
    pub(crate) query_id: QueryId,
    pub(crate) statement: Statement,
    pub(crate) frame: AmbientFrame,
    pub(crate) propagate_options: Option<Arc<PropagateOptions>>,
    options_overridden: bool,
    pub(crate) trx_propagated: bool,
    /// Transaction this builder resolved to or was attached to.
    pub(crate) transaction: Option<TransactionHandle>,
    pub(crate) tables_join: Vec<String>,
    pub(crate) paging: PagingRole,
    /// Builder misuse reported when the query is awaited.
    pub(crate) deferred: Option<UsageError>,
}

impl QueryBuilder {
    pub(crate) fn new(db: Database, statement: Statement) -> Self {
        let frame = current_frame();
        let query_id = db.next_query_id();
        Self {
            db,
            query_id,
            statement,
            propagate_options: frame.options.clone(),
            frame,
            options_overridden: false,
            trx_propagated: false,
            transaction: None,
            tables_join: Vec::new(),
            paging: PagingRole::None,
            deferred: None,
        }
    }

    /// Sub-query sharing this builder's snapshot, with its own id.
    pub(crate) fn derive(&self, statement: Statement, paging: PagingRole) -> Self {
        Self {
            db: self.db.clone(),
            query_id: self.db.next_query_id(),
            statement,
            frame: self.frame.clone(),
            propagate_options: self.propagate_options.clone(),
            options_overridden: self.options_overridden,
            trx_propagated: false,
            transaction: self.transaction.clone(),
            tables_join: self.tables_join.clone(),
            paging,
            deferred: self.deferred.clone(),
        }
    }

    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let columns = columns
            .into_iter()
            .map(|c| {
                let c = c.into();
                if c == "*" {
                    SelectColumn::Wildcard
                } else {
                    SelectColumn::Column(c)
                }
            })
            .collect();
        self.statement.clauses.push(Clause::Columns(columns));
        self
    }

    pub fn column_as(mut self, column: impl Into<String>, alias: impl Into<String>) -> Self {
        self.statement.clauses.push(Clause::Columns(vec![SelectColumn::Aliased {
            column: column.into(),
            alias: alias.into(),
        }]));
        self
    }

    pub fn where_eq(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.where_cmp(column, BinaryOperator::Eq, value)
    }

    pub fn where_cmp(self, column: impl Into<String>, op: BinaryOperator, value: impl Into<Value>) -> Self {
        self.where_expr(Expr::binary(Expr::column(column), op, Expr::value(value)))
    }

    pub fn where_in<I, V>(self, column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.where_expr(Expr::InList {
            expr: Box::new(Expr::column(column)),
            list: values.into_iter().map(Expr::value).collect(),
            negated: false,
        })
    }

    pub fn where_null(self, column: impl Into<String>) -> Self {
        self.where_expr(Expr::IsNull {
            expr: Box::new(Expr::column(column)),
            negated: false,
        })
    }

    pub fn where_expr(mut self, expr: Expr) -> Self {
        self.statement.clauses.push(Clause::Where(expr));
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, ascending: bool) -> Self {
        self.statement.clauses.push(Clause::OrderBy(OrderBy {
            column: column.into(),
            ascending,
        }));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.statement.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.statement.offset = Some(offset);
        self
    }

    /// Add an aggregate projection. `column: None` aggregates `*`.
    pub fn aggregate(mut self, func: AggregateFunc, column: Option<&str>, alias: Option<&str>) -> Self {
        self.statement.clauses.push(Clause::Aggregate(Aggregate {
            func,
            column: column.map(String::from),
            alias: alias.map(String::from),
        }));
        self
    }

    pub fn count_all(self) -> Self {
        self.aggregate(AggregateFunc::Count, None, None)
    }

    pub fn count(self, column: &str, alias: Option<&str>) -> Self {
        self.aggregate(AggregateFunc::Count, Some(column), alias)
    }

    pub fn sum(self, column: &str, alias: Option<&str>) -> Self {
        self.aggregate(AggregateFunc::Sum, Some(column), alias)
    }

    pub fn min(self, column: &str, alias: Option<&str>) -> Self {
        self.aggregate(AggregateFunc::Min, Some(column), alias)
    }

    pub fn max(self, column: &str, alias: Option<&str>) -> Self {
        self.aggregate(AggregateFunc::Max, Some(column), alias)
    }

    pub fn avg(self, column: &str, alias: Option<&str>) -> Self {
        self.aggregate(AggregateFunc::Avg, Some(column), alias)
    }

    /// Select at most one row.
    pub fn first(mut self) -> Self {
        self.statement.method = Method::First;
        self
    }

    /// Insert one row given as a JSON object.
    pub fn insert(mut self, row: Value) -> Self {
        self.statement.method = Method::Insert;
        match row {
            Value::Object(map) => self.statement.values.push(map),
            other => {
                self.deferred.get_or_insert(UsageError::InvalidArgument(format!(
                    "insert expects an object, got {}",
                    other
                )));
            }
        }
        self
    }

    /// Add an assignment; turns the statement into an update.
    pub fn set(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.statement.method = Method::Update;
        self.statement.assignments.push(Assignment {
            column: column.into(),
            value: Expr::value(value),
        });
        self
    }

    pub fn delete(mut self) -> Self {
        self.statement.method = Method::Delete;
        self
    }

    pub fn truncate(mut self) -> Self {
        self.statement.method = Method::Truncate;
        self
    }

    /// Decide the row lock now instead of at resolution.
    pub fn lock(mut self, level: RowLockLevel) -> DatabaseResult<Self> {
        apply_row_lock(&mut self.statement, &self.query_id, level)?;
        Ok(self)
    }

    pub fn for_share(self) -> DatabaseResult<Self> {
        self.lock(RowLockLevel::ForShare)
    }

    pub fn for_update(self) -> DatabaseResult<Self> {
        self.lock(RowLockLevel::ForUpdate)
    }

    /// Join on `table.column` pairs.
    pub fn join(mut self, kind: JoinKind, left: &str, right: &str) -> DatabaseResult<Self> {
        smart_join(&mut self.statement, &mut self.tables_join, kind, left, right)?;
        Ok(self)
    }

    pub fn inner_join(self, left: &str, right: &str) -> DatabaseResult<Self> {
        self.join(JoinKind::Inner, left, right)
    }

    pub fn left_join(self, left: &str, right: &str) -> DatabaseResult<Self> {
        self.join(JoinKind::Left, left, right)
    }

    pub fn right_join(self, left: &str, right: &str) -> DatabaseResult<Self> {
        self.join(JoinKind::Right, left, right)
    }

    /// Attach the query to `handle` explicitly.
    ///
    /// For work that runs outside the ambient scope (spawned tasks, hosts
    /// without a scope). Fails with `UnknownTransaction` when the handle
    /// has completed or belongs to another data source.
    pub fn transacting(mut self, handle: &TransactionHandle) -> DatabaseResult<Self> {
        let registry = self.db.registry();
        if !registry.is_registered(handle.id()) {
            return Err(TransactionError::UnknownTransaction {
                tx_id: handle.id().clone(),
                query_id: Some(self.query_id.clone()),
            }
            .into());
        }
        registry.attach_query(handle.id(), &self.query_id)?;
        self.transaction = Some(handle.clone());
        self.trx_propagated = true;
        Ok(self)
    }

    /// Resolve with `options` instead of the ambient ones. Allowed once.
    pub fn with_propagation(mut self, options: PropagateOptions) -> DatabaseResult<Self> {
        if self.options_overridden {
            return Err(QueryError::PropagationAlreadySet {
                query_id: self.query_id.clone(),
            }
            .into());
        }
        self.options_overridden = true;
        self.propagate_options = Some(Arc::new(options));
        Ok(self)
    }

    pub fn query_id(&self) -> &QueryId {
        &self.query_id
    }

    /// True once the query has been attached to a transaction.
    pub fn trx_propagated(&self) -> bool {
        self.trx_propagated
    }

    pub fn propagate_options(&self) -> Option<&PropagateOptions> {
        self.propagate_options.as_deref()
    }

    pub fn statement(&self) -> &Statement {
        &self.statement
    }

    pub fn transaction_id(&self) -> Option<&TransactionId> {
        self.transaction.as_ref().map(|h| h.id())
    }

    /// Name used in propagation errors raised at resolution.
    pub(crate) fn caller(&self) -> String {
        self.propagate_options
            .as_ref()
            .and_then(|o| o.caller_key())
            .unwrap_or_else(|| format!("query {}", self.query_id))
    }
}

impl fmt::Debug for QueryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryBuilder")
            .field("query_id", &self.query_id)
            .field("sql", &self.statement.to_string())
            .field("trx_propagated", &self.trx_propagated)
            .field("transaction", &self.transaction_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DatabaseError;
    use crate::testing;
    use crate::types::PropagationType;
    use serde_json::json;

    #[test]
    fn test_builder_renders_statement() {
        let db = testing::database();
        let q = db
            .table("tb_user")
            .columns(["uid", "name"])
            .where_cmp("uid", BinaryOperator::GtEq, 1)
            .order_by("name", false)
            .limit(10);

        assert_eq!(
            q.statement().to_string(),
            "select uid, name from tb_user where uid >= 1 order by name desc limit 10"
        );
        assert!(!q.trx_propagated());
        assert!(q.propagate_options().is_none());
    }

    #[test]
    fn test_each_builder_gets_fresh_id() {
        let db = testing::database();
        let a = db.table("tb_user");
        let b = db.table("tb_user");
        assert_ne!(a.query_id(), b.query_id());
    }

    #[test]
    fn test_explicit_share_lock_on_aggregate_is_rejected() {
        let db = testing::database();

        let err = db.table("tb_user").count_all().for_share().unwrap_err();
        assert!(matches!(err, DatabaseError::Query(QueryError::IncompatibleLock { .. })));

        let q = db.table("tb_user").count_all().for_update().unwrap();
        assert_eq!(q.statement().lock, Some(RowLockLevel::ForUpdate));
    }

    #[test]
    fn test_join_requires_scoped_columns() {
        let db = testing::database();
        let err = db.table("tb_user").inner_join("uid", "tb_user_ext.uid").unwrap_err();
        assert!(matches!(err, DatabaseError::Query(QueryError::InvalidScopedColumn(_))));
    }

    #[test]
    fn test_with_propagation_only_once() {
        let db = testing::database();
        let q = db
            .table("tb_user")
            .with_propagation(PropagateOptions::new(PropagationType::Supports))
            .unwrap();
        assert_eq!(q.propagate_options().map(|o| o.propagation), Some(PropagationType::Supports));

        let err = q
            .with_propagation(PropagateOptions::new(PropagationType::Required))
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Query(QueryError::PropagationAlreadySet { .. })));
    }

    #[tokio::test]
    async fn test_transacting_completed_handle_fails() {
        let db = testing::database();
        let tx = testing::begin(&db).await;
        tx.rollback().await.unwrap();

        let err = db.table("tb_user").transacting(&tx).unwrap_err();
        assert!(matches!(
            err,
            DatabaseError::Transaction(TransactionError::UnknownTransaction { query_id: Some(_), .. })
        ));
    }

    #[tokio::test]
    async fn test_insert_requires_object() {
        let db = testing::database();
        let err = db.table("tb_user").insert(json!([1, 2])).execute().await.unwrap_err();
        assert!(matches!(err, DatabaseError::Usage(UsageError::InvalidArgument(_))));
    }
}
