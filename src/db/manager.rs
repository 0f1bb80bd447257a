//! Named data sources and their shutdown.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::task::JoinSet;

use crate::backend::Backend;
use crate::db::api::{Database, DatabaseError, DatabaseResult};
use crate::db::config::ManagerConfig;
use crate::db::dict::DbDict;
use crate::types::ScopeKey;

/// How `DbManager::destroy` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyOutcome {
    Completed,
    /// The timeout elapsed first; teardown keeps running detached.
    TimedOut,
}

/// Registry of named data sources.
pub struct DbManager {
    config: ManagerConfig,
    sources: RwLock<BTreeMap<String, Database>>,
}

impl DbManager {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            sources: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Create data source `id` over `backend`, configured from the
    /// manager config's entry for `id` (defaults when absent).
    pub fn add_data_source(
        &self,
        id: &str,
        backend: Arc<dyn Backend>,
        dict: DbDict,
    ) -> DatabaseResult<Database> {
        if id.trim().is_empty() {
            return Err(DatabaseError::InvalidConfig("empty data source id".into()));
        }
        let mut sources = self.sources.write();
        if sources.contains_key(id) {
            return Err(DatabaseError::AlreadyExists(id.to_string()));
        }

        let config = self.config.data_sources.get(id).cloned().unwrap_or_default();
        let db = Database::new(id, backend, dict, config);
        sources.insert(id.to_string(), db.clone());
        log::info!("data source {} added", id);
        Ok(db)
    }

    pub fn get(&self, id: &str) -> DatabaseResult<Database> {
        self.sources
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| DatabaseError::NotFound(id.to_string()))
    }

    pub fn ids(&self) -> Vec<String> {
        self.sources.read().keys().cloned().collect()
    }

    /// Finish `scope` on every data source. Returns the number of
    /// transactions completed.
    pub async fn finish_scope(&self, scope: &ScopeKey) -> DatabaseResult<usize> {
        let sources: Vec<Database> = self.sources.read().values().cloned().collect();
        let mut finished = 0;
        for db in sources {
            finished += db.finish_scope(scope).await?;
        }
        Ok(finished)
    }

    /// Destroy every data source, waiting at most `timeout_when_destroy_ms`.
    pub async fn destroy(&self) -> DestroyOutcome {
        let sources: Vec<Database> = {
            let mut guard = self.sources.write();
            std::mem::take(&mut *guard).into_values().collect()
        };

        let mut set = JoinSet::new();
        for db in sources {
            set.spawn(async move {
                if let Err(e) = db.destroy().await {
                    log::warn!("destroying {} failed: {}", db.id(), e);
                }
            });
        }

        let timeout = self.config.destroy_timeout();
        let waited = tokio::time::timeout(timeout, async {
            while let Some(joined) = set.join_next().await {
                if let Err(e) = joined {
                    log::warn!("destroy task failed: {}", e);
                }
            }
        })
        .await;

        match waited {
            Ok(()) => DestroyOutcome::Completed,
            Err(_) => {
                log::warn!(
                    "data sources not destroyed within {} ms; leaving teardown running",
                    timeout.as_millis()
                );
                set.detach_all();
                DestroyOutcome::TimedOut
            }
        }
    }
}

impl std::fmt::Debug for DbManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbManager")
            .field("sources", &self.ids())
            .field("timeout_when_destroy_ms", &self.config.timeout_when_destroy_ms)
            .finish()
    }
}
