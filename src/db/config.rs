//! Data source and manager configuration.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::db::api::{DatabaseError, DatabaseResult};
use crate::types::{PropagationType, RowLockLevel, TrxActionOnEnd};

/// Defaults applied when a call or query does not say otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropagationConfig {
    /// Propagation of queries built outside any decorated call.
    pub default_propagation: PropagationType,
    pub read_row_lock_level: RowLockLevel,
    pub write_row_lock_level: RowLockLevel,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            default_propagation: PropagationType::Required,
            read_row_lock_level: RowLockLevel::ForShare,
            write_row_lock_level: RowLockLevel::ForUpdate,
        }
    }
}

/// Configuration of one data source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    pub propagation: PropagationConfig,
    /// Applied by `finish_scope` to explicit transactions left open.
    pub trx_action_on_end: TrxActionOnEnd,
}

impl DbConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn default_propagation(mut self, value: PropagationType) -> Self {
        self.propagation.default_propagation = value;
        self
    }

    pub fn read_row_lock_level(mut self, value: RowLockLevel) -> Self {
        self.propagation.read_row_lock_level = value;
        self
    }

    pub fn write_row_lock_level(mut self, value: RowLockLevel) -> Self {
        self.propagation.write_row_lock_level = value;
        self
    }

    pub fn trx_action_on_end(mut self, value: TrxActionOnEnd) -> Self {
        self.trx_action_on_end = value;
        self
    }
}

/// Manager configuration, usually loaded from a JSON file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Upper bound on `DbManager::destroy`.
    pub timeout_when_destroy_ms: u64,
    pub data_sources: BTreeMap<String, DbConfig>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            timeout_when_destroy_ms: 3000,
            data_sources: BTreeMap::new(),
        }
    }
}

impl ManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(json: &str) -> DatabaseResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> DatabaseResult<Self> {
        let path = path.as_ref();
        log::debug!("loading manager config from {}", path.display());
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn timeout_when_destroy(mut self, timeout: Duration) -> Self {
        self.timeout_when_destroy_ms = timeout.as_millis() as u64;
        self
    }

    pub fn data_source(mut self, id: impl Into<String>, config: DbConfig) -> Self {
        self.data_sources.insert(id.into(), config);
        self
    }

    pub fn destroy_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_when_destroy_ms)
    }

    fn validate(&self) -> DatabaseResult<()> {
        if let Some(id) = self.data_sources.keys().find(|id| id.trim().is_empty()) {
            return Err(DatabaseError::InvalidConfig(format!("empty data source id '{}'", id)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.timeout_when_destroy_ms, 3000);

        let db = DbConfig::default();
        assert_eq!(db.propagation.read_row_lock_level, RowLockLevel::ForShare);
        assert_eq!(db.propagation.write_row_lock_level, RowLockLevel::ForUpdate);
        assert_eq!(db.trx_action_on_end, TrxActionOnEnd::Rollback);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = ManagerConfig::from_json_str(
            r#"{
                "data_sources": {
                    "master": {
                        "propagation": { "read_row_lock_level": "FOR_UPDATE" },
                        "trx_action_on_end": "commit"
                    }
                }
            }"#,
        )
        .unwrap();

        assert_eq!(config.timeout_when_destroy_ms, 3000);
        let master = &config.data_sources["master"];
        assert_eq!(master.propagation.read_row_lock_level, RowLockLevel::ForUpdate);
        assert_eq!(master.propagation.write_row_lock_level, RowLockLevel::ForUpdate);
        assert_eq!(master.propagation.default_propagation, PropagationType::Required);
        assert_eq!(master.trx_action_on_end, TrxActionOnEnd::Commit);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"timeout_when_destroy_ms": 50, "data_sources": {{"replica": {{}}}}}}"#).unwrap();

        let config = ManagerConfig::load(file.path()).unwrap();
        assert_eq!(config.destroy_timeout(), Duration::from_millis(50));
        assert!(config.data_sources.contains_key("replica"));
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(
            ManagerConfig::from_json_str(r#"{"timeout_when_destroy_ms": "soon"}"#),
            Err(DatabaseError::Json(_))
        ));
        assert!(matches!(
            ManagerConfig::from_json_str(r#"{"data_sources": {" ": {}}}"#),
            Err(DatabaseError::InvalidConfig(_))
        ));
        assert!(matches!(
            ManagerConfig::load("/definitely/not/here.json"),
            Err(DatabaseError::Io(_))
        ));
    }
}
