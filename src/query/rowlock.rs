//! Row lock decisions.
//!
//! A statement's lock is decided once. Explicit `for_share`/`for_update`
//! calls decide it when the builder is assembled; otherwise the resolving
//! transaction's propagate options decide it when the query is awaited.

use crate::query::error::{QueryError, QueryResult};
use crate::sql::{Method, Statement};
use crate::types::{QueryId, RowLockLevel};

/// Record `level` on `stmt`.
///
/// Returns false when the lock was already decided. Share locks cannot be
/// combined with aggregates.
pub fn apply_row_lock(stmt: &mut Statement, query_id: &QueryId, level: RowLockLevel) -> QueryResult<bool> {
    if stmt.lock.is_some() {
        return Ok(false);
    }
    check_lock(stmt, query_id, level)?;
    stmt.lock = Some(level);
    log::debug!("query {} locks rows with {}", query_id, level);
    Ok(true)
}

/// Reject a decided share lock on a statement that later gained an
/// aggregate.
pub(crate) fn check_lock(stmt: &Statement, query_id: &QueryId, level: RowLockLevel) -> QueryResult<()> {
    if level.is_share() && stmt.has_aggregate() {
        return Err(QueryError::IncompatibleLock {
            query_id: query_id.clone(),
            level,
        });
    }
    Ok(())
}

/// Lock a statement takes from the configured read and write levels.
///
/// Truncate never locks; a share lock is skipped for aggregates.
pub fn select_lock_level(stmt: &Statement, read: RowLockLevel, write: RowLockLevel) -> Option<RowLockLevel> {
    let level = match stmt.method {
        Method::Truncate => return None,
        Method::Select | Method::First => {
            if read.is_share() && stmt.has_aggregate() {
                return None;
            }
            read
        }
        Method::Insert | Method::Update | Method::Delete => write,
    };
    (level != RowLockLevel::None).then_some(level)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::{Aggregate, AggregateFunc, Clause};

    fn counted() -> Statement {
        let mut stmt = Statement::new("tb_user");
        stmt.clauses.push(Clause::Aggregate(Aggregate {
            func: AggregateFunc::Count,
            column: None,
            alias: None,
        }));
        stmt
    }

    #[test]
    fn test_apply_is_idempotent() {
        let qid = QueryId::new("q-1");
        let mut stmt = Statement::new("tb_user");

        assert!(apply_row_lock(&mut stmt, &qid, RowLockLevel::ForUpdate).unwrap());
        assert!(!apply_row_lock(&mut stmt, &qid, RowLockLevel::ForShare).unwrap());
        assert_eq!(stmt.lock, Some(RowLockLevel::ForUpdate));
        assert!(stmt.to_string().ends_with("for update"));
    }

    #[test]
    fn test_share_lock_rejected_on_aggregate() {
        let qid = QueryId::new("q-1");

        let mut stmt = counted();
        let err = apply_row_lock(&mut stmt, &qid, RowLockLevel::ForShare).unwrap_err();
        assert!(matches!(err, QueryError::IncompatibleLock { level: RowLockLevel::ForShare, .. }));
        assert_eq!(stmt.lock, None);

        let mut stmt = counted();
        assert!(apply_row_lock(&mut stmt, &qid, RowLockLevel::ForUpdate).unwrap());
    }

    #[test]
    fn test_select_lock_level_by_method() {
        let read = RowLockLevel::ForShare;
        let write = RowLockLevel::ForUpdate;

        assert_eq!(select_lock_level(&Statement::new("t"), read, write), Some(read));
        assert_eq!(select_lock_level(&counted(), read, write), None);
        assert_eq!(
            select_lock_level(&counted(), RowLockLevel::ForUpdate, write),
            Some(RowLockLevel::ForUpdate)
        );

        let mut update = Statement::new("t");
        update.method = Method::Update;
        assert_eq!(select_lock_level(&update, read, write), Some(write));

        let mut truncate = Statement::new("t");
        truncate.method = Method::Truncate;
        assert_eq!(select_lock_level(&truncate, read, write), None);

        assert_eq!(select_lock_level(&Statement::new("t"), RowLockLevel::None, write), None);
    }
}
