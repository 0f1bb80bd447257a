//! Transaction registry - maps ambient scopes to live transactions and
//! transactions to the queries attached to them.
//!
//! The registry is the single source of truth the dispatcher consults.
//! Each scope keeps a stack: the top is the transaction new work joins,
//! deeper entries exist only while a REQUIRES_NEW savepoint is running.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::handle::TransactionHandle;
use crate::types::{QueryId, ScopeKey, TransactionId};

/// Registry of live transactions for one data source.
///
/// Thread-safe: can be shared across tasks via Clone (uses Arc internally).
#[derive(Clone, Default)]
pub struct TransactionRegistry {
    inner: Arc<RwLock<RegistryState>>,
}

#[derive(Default)]
struct RegistryState {
    scopes: HashMap<ScopeKey, Vec<TransactionId>>,
    transactions: HashMap<TransactionId, Entry>,
    owners: HashMap<QueryId, TransactionId>,
}

struct Entry {
    handle: TransactionHandle,
    queries: HashSet<QueryId>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly begun transaction or savepoint.
    pub(crate) fn register(&self, handle: TransactionHandle) {
        let mut state = self.inner.write();
        state.transactions.insert(
            handle.id().clone(),
            Entry {
                handle,
                queries: HashSet::new(),
            },
        );
    }

    /// Bind `tx_id` to `scope`.
    ///
    /// Fails with `DuplicateScope` when another live transaction is on top
    /// of the scope, unless `nested` (a savepoint pushed over its parent).
    pub fn begin_scope(&self, scope: &ScopeKey, tx_id: &TransactionId, nested: bool) -> TransactionResult<()> {
        let mut state = self.inner.write();
        if !state.transactions.contains_key(tx_id) {
            return Err(TransactionError::unknown(tx_id));
        }

        let stack = state.scopes.entry(scope.clone()).or_default();
        match stack.last() {
            Some(top) if top == tx_id => return Ok(()),
            Some(top) if !nested => {
                return Err(TransactionError::DuplicateScope {
                    scope: scope.clone(),
                    existing: top.clone(),
                })
            }
            _ => {}
        }
        stack.push(tx_id.clone());
        log::debug!("scope {} bound to {}", scope, tx_id);
        Ok(())
    }

    /// Unbind `tx_id` from `scope`. Idempotent.
    pub fn end_scope(&self, scope: &ScopeKey, tx_id: &TransactionId) {
        let mut state = self.inner.write();
        remove_from_scope(&mut state.scopes, scope, tx_id);
    }

    /// Transaction new work in `scope` should join.
    pub fn lookup(&self, scope: &ScopeKey) -> Option<TransactionId> {
        self.inner.read().scopes.get(scope).and_then(|s| s.last().cloned())
    }

    /// Every transaction bound to `scope`, outermost first.
    pub fn scope_transactions(&self, scope: &ScopeKey) -> Vec<TransactionId> {
        self.inner.read().scopes.get(scope).cloned().unwrap_or_default()
    }

    pub fn handle(&self, tx_id: &TransactionId) -> Option<TransactionHandle> {
        self.inner.read().transactions.get(tx_id).map(|e| e.handle.clone())
    }

    pub fn is_registered(&self, tx_id: &TransactionId) -> bool {
        self.inner.read().transactions.contains_key(tx_id)
    }

    /// Attach a query to a live transaction.
    ///
    /// Re-attaching to the same transaction is a no-op. Attaching to a
    /// completed or unknown transaction fails with `UnknownTransaction`.
    pub fn attach_query(&self, tx_id: &TransactionId, query_id: &QueryId) -> TransactionResult<()> {
        let mut state = self.inner.write();

        let live = state
            .transactions
            .get(tx_id)
            .map(|e| !e.handle.is_completed())
            .unwrap_or(false);
        if !live {
            return Err(TransactionError::UnknownTransaction {
                tx_id: tx_id.clone(),
                query_id: Some(query_id.clone()),
            });
        }

        if let Some(attached) = state.owners.get(query_id) {
            if attached == tx_id {
                return Ok(());
            }
            return Err(TransactionError::QueryAlreadyAttached {
                query_id: query_id.clone(),
                attached: attached.clone(),
                requested: tx_id.clone(),
            });
        }

        state.owners.insert(query_id.clone(), tx_id.clone());
        if let Some(entry) = state.transactions.get_mut(tx_id) {
            entry.queries.insert(query_id.clone());
        }
        log::debug!("query {} attached to {}", query_id, tx_id);
        Ok(())
    }

    /// Detach a query. Returns false when it was not attached.
    pub fn detach_query(&self, query_id: &QueryId) -> bool {
        let mut state = self.inner.write();
        match state.owners.remove(query_id) {
            Some(tx_id) => {
                if let Some(entry) = state.transactions.get_mut(&tx_id) {
                    entry.queries.remove(query_id);
                }
                true
            }
            None => false,
        }
    }

    /// Transaction a query is attached to.
    pub fn transaction_of(&self, query_id: &QueryId) -> Option<TransactionId> {
        self.inner.read().owners.get(query_id).cloned()
    }

    /// Queries attached to `tx_id` that have not reported completion.
    pub fn pending_queries(&self, tx_id: &TransactionId) -> usize {
        self.inner
            .read()
            .transactions
            .get(tx_id)
            .map(|e| e.queries.len())
            .unwrap_or(0)
    }

    /// Forget a completed transaction: its handle, its queries and its
    /// scope bindings. Idempotent; returns false when already forgotten.
    pub fn complete_transaction(&self, tx_id: &TransactionId) -> bool {
        let mut state = self.inner.write();
        let Some(entry) = state.transactions.remove(tx_id) else {
            return false;
        };
        for query_id in &entry.queries {
            state.owners.remove(query_id);
        }
        match entry.handle.scope() {
            Some(scope) => remove_from_scope(&mut state.scopes, scope, tx_id),
            // bound by hand through begin_scope
            None => state.scopes.retain(|_, stack| {
                stack.retain(|id| id != tx_id);
                !stack.is_empty()
            }),
        }
        true
    }

    pub fn active_count(&self) -> usize {
        self.inner.read().transactions.len()
    }

    pub fn active_transactions(&self) -> Vec<TransactionId> {
        let mut ids: Vec<_> = self.inner.read().transactions.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Live handles, top-level transactions only.
    pub(crate) fn top_level_handles(&self) -> Vec<TransactionHandle> {
        self.inner
            .read()
            .transactions
            .values()
            .filter(|e| !e.handle.is_savepoint())
            .map(|e| e.handle.clone())
            .collect()
    }

    /// Drop all bookkeeping. Used on shutdown.
    pub fn clear(&self) {
        let mut state = self.inner.write();
        state.scopes.clear();
        state.transactions.clear();
        state.owners.clear();
    }
}

fn remove_from_scope(scopes: &mut HashMap<ScopeKey, Vec<TransactionId>>, scope: &ScopeKey, tx_id: &TransactionId) {
    if let Some(stack) = scopes.get_mut(scope) {
        stack.retain(|id| id != tx_id);
        if stack.is_empty() {
            scopes.remove(scope);
        }
    }
}

impl fmt::Debug for TransactionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.read();
        f.debug_struct("TransactionRegistry")
            .field("scopes", &state.scopes.len())
            .field("transactions", &state.transactions.len())
            .field("attached_queries", &state.owners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[tokio::test]
    async fn test_scope_binding() {
        let db = testing::database();
        let registry = db.registry();
        let tx = testing::begin(&db).await;
        let scope = ScopeKey::new("req-1");

        registry.begin_scope(&scope, tx.id(), false).unwrap();
        assert_eq!(registry.lookup(&scope), Some(tx.id().clone()));

        // same transaction again is fine
        registry.begin_scope(&scope, tx.id(), false).unwrap();
        assert_eq!(registry.scope_transactions(&scope).len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_scope_rejected() {
        let db = testing::database();
        let registry = db.registry();
        let a = testing::begin(&db).await;
        let b = testing::begin(&db).await;
        let scope = ScopeKey::new("req-1");

        registry.begin_scope(&scope, a.id(), false).unwrap();
        let err = registry.begin_scope(&scope, b.id(), false).unwrap_err();
        assert!(matches!(err, TransactionError::DuplicateScope { existing, .. } if &existing == a.id()));

        // nested push is allowed and becomes the lookup target
        registry.begin_scope(&scope, b.id(), true).unwrap();
        assert_eq!(registry.lookup(&scope), Some(b.id().clone()));
        registry.end_scope(&scope, b.id());
        assert_eq!(registry.lookup(&scope), Some(a.id().clone()));
    }

    #[tokio::test]
    async fn test_attach_and_detach() {
        let db = testing::database();
        let registry = db.registry();
        let tx = testing::begin(&db).await;
        let q = QueryId::new("q-test-1");

        registry.attach_query(tx.id(), &q).unwrap();
        registry.attach_query(tx.id(), &q).unwrap();
        assert_eq!(registry.pending_queries(tx.id()), 1);
        assert_eq!(registry.transaction_of(&q), Some(tx.id().clone()));

        assert!(registry.detach_query(&q));
        assert!(!registry.detach_query(&q));
        assert_eq!(registry.pending_queries(tx.id()), 0);
    }

    #[tokio::test]
    async fn test_query_belongs_to_one_transaction() {
        let db = testing::database();
        let registry = db.registry();
        let a = testing::begin(&db).await;
        let b = testing::begin(&db).await;
        let q = QueryId::new("q-test-1");

        registry.attach_query(a.id(), &q).unwrap();
        assert!(matches!(
            registry.attach_query(b.id(), &q),
            Err(TransactionError::QueryAlreadyAttached { .. })
        ));
    }

    #[tokio::test]
    async fn test_attach_after_completion_fails() {
        let db = testing::database();
        let registry = db.registry();
        let tx = testing::begin(&db).await;
        let scope = ScopeKey::new("req-9");
        registry.begin_scope(&scope, tx.id(), false).unwrap();

        tx.commit().await.unwrap();

        assert!(!registry.is_registered(tx.id()));
        assert_eq!(registry.lookup(&scope), None);
        let err = registry.attach_query(tx.id(), &QueryId::new("q-late")).unwrap_err();
        assert!(matches!(err, TransactionError::UnknownTransaction { query_id: Some(_), .. }));

        // completing twice is a no-op
        assert!(!registry.complete_transaction(tx.id()));
    }

    #[tokio::test]
    async fn test_unknown_transaction_cannot_bind_scope() {
        let registry = TransactionRegistry::new();
        let err = registry
            .begin_scope(&ScopeKey::new("s"), &TransactionId::new("trx-nope"), false)
            .unwrap_err();
        assert!(matches!(err, TransactionError::UnknownTransaction { query_id: None, .. }));
    }
}
