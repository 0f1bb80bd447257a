//! Resolution: the point where a built query meets a transaction.

use serde_json::Value;

use crate::backend::ResultSet;
use crate::db::{DatabaseError, DatabaseResult};
use crate::propagation::PropagationError;
use crate::query::builder::QueryBuilder;
use crate::query::error::QueryError;
use crate::query::paging::{counter_statement, page_window, pager_statement, Page, PagingRole, TOTAL_COLUMN};
use crate::query::rowlock::{apply_row_lock, check_lock, select_lock_level};
use crate::query::smart_join::resolve_column_aliases;
use crate::sql::{Method, Row};
use crate::transaction::TransactionHandle;
use crate::types::{PropagationType, TransactionId};

impl QueryBuilder {
    /// Run the query and return its rows.
    pub async fn fetch(&mut self) -> DatabaseResult<Vec<Row>> {
        Ok(self.resolve().await?.into_rows())
    }

    /// Run the query for at most one row.
    pub async fn fetch_one(&mut self) -> DatabaseResult<Option<Row>> {
        let method = self.statement.method;
        if method == Method::Select {
            self.statement.method = Method::First;
        }
        let result = self.resolve().await;
        self.statement.method = method;
        Ok(result?.into_rows().into_iter().next())
    }

    /// Run the query and return the full result set.
    pub async fn execute(&mut self) -> DatabaseResult<ResultSet> {
        self.resolve().await
    }

    /// Run a counter query and a pager query for the 1-based `page`.
    pub async fn paginate(&mut self, page: usize, page_size: usize) -> DatabaseResult<Page> {
        let (limit, offset) = page_window(page, page_size)?;

        let mut counter = self.derive(counter_statement(&self.statement), PagingRole::Counter);
        let total = counter
            .resolve()
            .await?
            .scalar(TOTAL_COLUMN)
            .and_then(Value::as_u64)
            .unwrap_or(0);

        let mut pager = self.derive(pager_statement(&self.statement, limit, offset), PagingRole::Pager);
        let rows = pager.resolve().await?.into_rows();

        self.trx_propagated |= counter.trx_propagated || pager.trx_propagated;
        if self.transaction.is_none() {
            self.transaction = pager.transaction.take();
        }
        Ok(Page {
            total,
            page,
            page_size,
            rows,
        })
    }

    pub(crate) async fn resolve(&mut self) -> DatabaseResult<ResultSet> {
        if let Some(e) = &self.deferred {
            return Err(e.clone().into());
        }
        if let Some(level) = self.statement.lock {
            check_lock(&self.statement, &self.query_id, level)?;
        }

        let target = self.select_target().await?;
        if let Some(handle) = &target {
            if let Err(e) = self.bind(handle) {
                if handle.is_implicit() {
                    handle.rollback_on_error().await;
                }
                return Err(e);
            }
        }

        resolve_column_aliases(&mut self.statement, self.db.dict(), &self.tables_join, self.paging);

        log::debug!("query {} resolving: {}", self.query_id, self.statement);
        let conn = target.as_ref().map(|h| h.connection());
        let result = self.db.backend().execute(conn, &self.statement).await;

        let Some(handle) = target else {
            return result.map_err(DatabaseError::from);
        };
        let registry = self.db.registry();
        registry.detach_query(&self.query_id);

        match result {
            Ok(rs) => {
                if handle.is_implicit() && registry.pending_queries(handle.id()) == 0 {
                    handle.commit().await?;
                }
                Ok(rs)
            }
            Err(e) => {
                log::warn!(
                    "query {} failed in {}, rolling back: {}",
                    self.query_id,
                    handle.id(),
                    e
                );
                handle.rollback_on_error().await;
                Err(e.into())
            }
        }
    }

    /// Transaction the query runs in, starting an implicit one when the
    /// options require a transaction and none is in scope.
    async fn select_target(&self) -> DatabaseResult<Option<TransactionHandle>> {
        if let Some(handle) = &self.transaction {
            if handle.is_completed() {
                return Err(self.stale(handle.id().clone()));
            }
            return Ok(Some(handle.clone()));
        }

        let registry = self.db.registry();
        if let Some(tx_id) = self.frame.bound_for(self.db.id()) {
            return match registry.handle(tx_id) {
                Some(handle) if !handle.is_completed() => Ok(Some(handle)),
                _ => Err(self.stale(tx_id.clone())),
            };
        }

        let propagation = self
            .propagate_options
            .as_ref()
            .map(|o| o.propagation)
            .unwrap_or(self.db.config().propagation.default_propagation);
        let found = self
            .frame
            .scope
            .as_ref()
            .and_then(|scope| registry.lookup(scope))
            .and_then(|tx_id| registry.handle(&tx_id))
            .filter(|h| !h.is_completed());

        match (propagation, found) {
            (PropagationType::NotSupported, _) => Ok(None),
            (PropagationType::Never, Some(handle)) => Err(PropagationError::UnexpectedTransaction {
                caller: self.caller(),
                tx_id: handle.id().clone(),
            }
            .into()),
            (_, Some(handle)) => Ok(Some(handle)),
            (PropagationType::Required | PropagationType::RequiresNew, None) => {
                let handle = self.db.begin_implicit(self.propagate_options.clone()).await?;
                Ok(Some(handle))
            }
            (PropagationType::Mandatory, None) => Err(PropagationError::NoTransaction {
                caller: self.caller(),
            }
            .into()),
            (PropagationType::Supports | PropagationType::Never, None) => Ok(None),
        }
    }

    /// Attach to `handle` and take its row lock.
    fn bind(&mut self, handle: &TransactionHandle) -> DatabaseResult<()> {
        self.db.registry().attach_query(handle.id(), &self.query_id)?;
        self.trx_propagated = true;
        if !handle.is_implicit() {
            self.transaction = Some(handle.clone());
        }

        let defaults = &self.db.config().propagation;
        let options = self
            .propagate_options
            .as_deref()
            .or_else(|| handle.propagate_options());
        let read = options.map_or(defaults.read_row_lock_level, |o| o.read_row_lock_level);
        let write = options.map_or(defaults.write_row_lock_level, |o| o.write_row_lock_level);

        if let Some(level) = select_lock_level(&self.statement, read, write) {
            if let Err(e) = apply_row_lock(&mut self.statement, &self.query_id, level) {
                self.db.registry().detach_query(&self.query_id);
                return Err(e.into());
            }
        }
        Ok(())
    }

    fn stale(&self, tx_id: TransactionId) -> DatabaseError {
        QueryError::StaleBuilder {
            query_id: self.query_id.clone(),
            tx_id,
        }
        .into()
    }
}

#[cfg(test)]
mod tests {
    use crate::db::{DatabaseError, TransactionOptions};
    use crate::propagation::{with_scope, Propagator, Transactional};
    use crate::query::QueryError;
    use crate::sql::Method;
    use crate::testing;
    use crate::types::{PropagateOptions, PropagationType, RowLockLevel};
    use serde_json::json;

    #[tokio::test]
    async fn test_plain_write_runs_in_implicit_transaction() {
        let (db, backend) = testing::setup();

        let mut q = db.table("tb_user").insert(json!({"uid": 3, "name": "carol"}));
        let rs = q.execute().await.unwrap();

        assert_eq!(rs.rows_affected, 1);
        assert!(q.trx_propagated());
        // implicit transactions are never tied to the builder
        assert!(q.transaction_id().is_none());
        let stats = backend.stats();
        assert_eq!(stats.transactions, 1);
        assert_eq!(stats.commits, 1);
        assert_eq!(backend.rows("tb_user").len(), 3);
        assert_eq!(db.registry().active_count(), 0);
    }

    #[tokio::test]
    async fn test_supports_query_runs_bare() {
        let (db, backend) = testing::setup();
        let mut q = db
            .table("tb_user")
            .with_propagation(PropagateOptions::new(PropagationType::Supports))
            .unwrap();

        assert_eq!(q.fetch().await.unwrap().len(), 2);
        assert!(!q.trx_propagated());
        assert_eq!(q.statement().lock, None);
        assert_eq!(backend.stats().transactions, 0);
    }

    #[tokio::test]
    async fn test_mandatory_query_without_transaction() {
        let db = testing::database();
        let err = db
            .table("tb_user")
            .with_propagation(PropagateOptions::new(PropagationType::Mandatory))
            .unwrap()
            .fetch()
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DatabaseError::Propagation(crate::propagation::PropagationError::NoTransaction { .. })
        ));
    }

    #[tokio::test]
    async fn test_read_takes_configured_lock_in_transaction() {
        let (db, backend) = testing::setup();
        let trx = db.transaction(TransactionOptions::default()).await.unwrap();

        let mut q = db.table("tb_user").where_eq("uid", 1).transacting(&trx).unwrap();
        q.fetch().await.unwrap();
        assert_eq!(q.statement().lock, Some(RowLockLevel::ForShare));

        let mut counted = db.table("tb_user").count_all().transacting(&trx).unwrap();
        let rs = counted.execute().await.unwrap();
        assert_eq!(rs.scalar("count(*)"), Some(&json!(2)));
        // share lock skipped for the aggregate
        assert_eq!(counted.statement().lock, None);

        trx.commit().await.unwrap();
        assert!(backend.executed_sql().iter().any(|s| s.contains("for share")));
    }

    #[tokio::test]
    async fn test_aggregate_with_for_update_policy() {
        let (db, _backend) = testing::setup();
        let p = Propagator::new(db.clone());

        p.propagate(
            Transactional::required().read_lock(RowLockLevel::ForUpdate),
            "Stats",
            "count",
            || async {
                let mut q = db.table("tb_user").count_all();
                q.execute().await?;
                assert_eq!(q.statement().lock, Some(RowLockLevel::ForUpdate));
                Ok::<_, DatabaseError>(())
            },
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_savepoint_visibility() {
        let (db, backend) = testing::setup();
        let trx = db.transaction(TransactionOptions::default()).await.unwrap();

        db.table("tb_user")
            .set("name", "n1")
            .where_eq("uid", 1)
            .transacting(&trx)
            .unwrap()
            .execute()
            .await
            .unwrap();

        let trx2 = trx.savepoint().await.unwrap();
        db.table("tb_user")
            .set("name", "n2")
            .where_eq("uid", 1)
            .transacting(&trx2)
            .unwrap()
            .execute()
            .await
            .unwrap();
        trx2.commit().await.unwrap();

        let inside = db
            .table("tb_user")
            .where_eq("uid", 1)
            .transacting(&trx)
            .unwrap()
            .fetch_one()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inside["name"], json!("n2"));

        let outside = db
            .table("tb_user")
            .where_eq("uid", 1)
            .with_propagation(PropagateOptions::new(PropagationType::Supports))
            .unwrap()
            .fetch_one()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outside["name"], json!("alice"));

        trx.commit().await.unwrap();
        let committed = backend.rows("tb_user");
        assert!(committed.iter().any(|r| r["name"] == json!("n2")));
    }

    #[tokio::test]
    async fn test_failure_rolls_back_tied_transaction() {
        let (db, backend) = testing::setup();
        let trx = db.transaction(TransactionOptions::default()).await.unwrap();

        let err = db
            .table("no_such_table")
            .transacting(&trx)
            .unwrap()
            .fetch()
            .await
            .unwrap_err();

        assert!(matches!(err, DatabaseError::Backend(_)));
        assert!(trx.is_completed());
        assert_eq!(backend.stats().rollbacks, 1);
        // explicit commit after the auto-rollback is a no-op
        trx.commit().await.unwrap();
        assert_eq!(backend.stats().commits, 0);
    }

    #[tokio::test]
    async fn test_user_error_after_resolution_does_not_roll_back() {
        let (db, backend) = testing::setup();
        let trx = db.transaction(TransactionOptions::default()).await.unwrap();

        let outcome: Result<(), String> = async {
            db.table("tb_user")
                .set("name", "kept")
                .where_eq("uid", 1)
                .transacting(&trx)
                .map_err(|e| e.to_string())?
                .execute()
                .await
                .map_err(|e| e.to_string())?;
            Err("validation failed".to_string())
        }
        .await;

        assert!(outcome.is_err());
        assert!(!trx.is_completed());
        trx.commit().await.unwrap();
        assert_eq!(backend.stats().rollbacks, 0);
        assert!(backend.rows("tb_user").iter().any(|r| r["name"] == json!("kept")));
    }

    #[tokio::test]
    async fn test_tied_builder_can_resolve_until_completion() {
        let db = testing::database();
        let trx = db.transaction(TransactionOptions::default()).await.unwrap();

        let mut q = db.table("tb_user").transacting(&trx).unwrap();
        q.fetch().await.unwrap();
        q.fetch().await.unwrap();
        assert_eq!(q.transaction_id(), Some(trx.id()));

        trx.commit().await.unwrap();
        let err = q.fetch().await.unwrap_err();
        assert!(matches!(err, DatabaseError::Query(QueryError::StaleBuilder { .. })));
    }

    #[tokio::test]
    async fn test_fetch_one_leaves_builder_reusable() {
        let db = testing::database();
        let trx = db.transaction(TransactionOptions::default()).await.unwrap();

        let mut q = db.table("tb_user").transacting(&trx).unwrap();
        assert!(q.fetch_one().await.unwrap().is_some());
        assert_eq!(q.statement().method, Method::Select);
        assert_eq!(q.fetch().await.unwrap().len(), 2);

        trx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_scope_lookup_from_explicit_transaction() {
        let db = testing::database();

        with_scope("req-7", async {
            let trx = db
                .transaction(TransactionOptions::default().scope("req-7"))
                .await
                .unwrap();
            let mut q = db.table("tb_user");
            q.fetch().await.unwrap();
            assert_eq!(q.transaction_id(), Some(trx.id()));
            trx.commit().await.unwrap();
        })
        .await;
    }

    #[tokio::test]
    async fn test_joined_read_with_aliases() {
        let db = testing::database();

        let rows = db
            .table("tb_user")
            .inner_join("tb_user.uid", "tb_user_ext.uid")
            .unwrap()
            .where_eq("tb_user_ext_uid", 2)
            .fetch()
            .await
            .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], json!("bob"));
        assert_eq!(rows[0]["age"], json!(25));
        assert_eq!(rows[0]["tb_user_uid"], json!(2));
    }

    #[tokio::test]
    async fn test_paginate() {
        let (db, _backend) = testing::setup();
        let mut q = db.table("tb_user").order_by("uid", true);

        let page = q.paginate(2, 1).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.rows.len(), 1);
        assert_eq!(page.rows[0]["name"], json!("bob"));
        assert!(!page.has_next());

        let err = q.paginate(0, 10).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Usage(_)));
    }

    #[tokio::test]
    async fn test_raw_sql_goes_through_interception() {
        let (db, backend) = testing::setup();
        let mut q = db.raw("update tb_user set name = 'raw' where uid = 2").unwrap();
        q.execute().await.unwrap();

        assert!(q.trx_propagated());
        assert_eq!(backend.stats().commits, 1);
        assert!(backend.rows("tb_user").iter().any(|r| r["name"] == json!("raw")));
    }
}
