//! identifiers for transactions, queries and ambient scopes.

use std::fmt;
use std::fmt::Formatter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ulid::Ulid;

/// Identifier of a transaction or savepoint.
///
/// Never reused within a data source: the numeric part comes from a
/// monotonic counter owned by the data source's [`IdGenerator`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(Arc<str>);

impl TransactionId {
    pub(crate) fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier stamped on every table-reference invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(Arc<str>);

impl QueryId {
    pub(crate) fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key of an ambient scope (a request, a logical call chain, or any
/// caller-supplied id).
///
/// Uniqueness per concurrent call chain is the caller's responsibility.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeKey(Arc<str>);

impl ScopeKey {
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self(key.into())
    }

    /// Fresh scope key for a call chain that started without one.
    pub fn generate() -> Self {
        Self(format!("scope-{}", Ulid::new().to_string().to_lowercase()).into())
    }

    /// Child key under which the transaction of `self` is invisible.
    pub(crate) fn suspended(&self) -> Self {
        Self(format!("{}/suspended-{}", self.0, Ulid::new().to_string().to_lowercase()).into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ScopeKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ScopeKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Per data source id factory.
///
/// Transaction ids look like `trx-{db}-{n}[-{entry}]`, savepoints
/// `{parent}-sp{n}`, query ids `q-{db}-{n}`.
#[derive(Debug)]
pub struct IdGenerator {
    db_id: Arc<str>,
    next_transaction: AtomicU64,
    next_savepoint: AtomicU64,
    next_query: AtomicU64,
}

impl IdGenerator {
    pub fn new(db_id: impl Into<Arc<str>>) -> Self {
        Self {
            db_id: db_id.into(),
            next_transaction: AtomicU64::new(1),
            next_savepoint: AtomicU64::new(1),
            next_query: AtomicU64::new(1),
        }
    }

    pub fn db_id(&self) -> &str {
        &self.db_id
    }

    /// Id for a new top-level transaction, tagged with the entry key of
    /// the call chain that started it.
    pub fn next_transaction_id(&self, entry_key: Option<&str>) -> TransactionId {
        let n = self.next_transaction.fetch_add(1, Ordering::Relaxed);
        match entry_key {
            Some(entry) if !entry.is_empty() => {
                TransactionId::new(format!("trx-{}-{}-{}", self.db_id, n, entry))
            }
            _ => TransactionId::new(format!("trx-{}-{}", self.db_id, n)),
        }
    }

    pub fn next_savepoint_id(&self, parent: &TransactionId) -> TransactionId {
        let n = self.next_savepoint.fetch_add(1, Ordering::Relaxed);
        TransactionId::new(format!("{}-sp{}", parent, n))
    }

    pub fn next_query_id(&self) -> QueryId {
        let n = self.next_query.fetch_add(1, Ordering::Relaxed);
        QueryId::new(format!("q-{}-{}", self.db_id, n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_transaction_ids_are_unique() {
        let ids = IdGenerator::new("master");
        let a = ids.next_transaction_id(None);
        let b = ids.next_transaction_id(Some("UserService:update"));

        assert_ne!(a, b);
        assert_eq!(a.as_str(), "trx-master-1");
        assert_eq!(b.as_str(), "trx-master-2-UserService:update");
    }

    #[test]
    fn test_savepoint_id_nests_under_parent() {
        let ids = IdGenerator::new("master");
        let parent = ids.next_transaction_id(None);
        let sp = ids.next_savepoint_id(&parent);
        assert!(sp.as_str().starts_with(parent.as_str()));
        assert_ne!(sp, parent);
    }

    #[test]
    fn test_query_ids_never_repeat() {
        let ids = IdGenerator::new("db");
        let seen: HashSet<_> = (0..100).map(|_| ids.next_query_id()).collect();
        assert_eq!(seen.len(), 100);
    }

    #[test]
    fn test_scope_keys() {
        let a = ScopeKey::generate();
        let b = ScopeKey::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("scope-"));

        let suspended = a.suspended();
        assert_ne!(suspended, a);
        assert!(suspended.as_str().starts_with(a.as_str()));
    }
}
