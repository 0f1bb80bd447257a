//! Propagation vocabulary shared by dispatch, interception and config.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How a decorated call relates to the transaction already in scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PropagationType {
    /// Join the ambient transaction, or start one.
    #[default]
    Required,
    /// Start a new unit of work. Nested under an ambient transaction it
    /// becomes a savepoint with its own commit/rollback.
    RequiresNew,
    /// Join the ambient transaction if any, else run without one.
    Supports,
    /// Join the ambient transaction, fail when there is none.
    Mandatory,
    /// Run without a transaction, hiding the ambient one.
    NotSupported,
    /// Run without a transaction, fail when one is in scope.
    Never,
}

impl PropagationType {
    /// Whether a query built under this type starts a transaction when
    /// nothing is in scope.
    pub fn starts_transaction(&self) -> bool {
        matches!(self, PropagationType::Required | PropagationType::RequiresNew)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PropagationType::Required => "REQUIRED",
            PropagationType::RequiresNew => "REQUIRES_NEW",
            PropagationType::Supports => "SUPPORTS",
            PropagationType::Mandatory => "MANDATORY",
            PropagationType::NotSupported => "NOT_SUPPORTED",
            PropagationType::Never => "NEVER",
        }
    }
}

impl fmt::Display for PropagationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PropagationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().replace([' ', '-'], "_").as_str() {
            "REQUIRED" => Ok(PropagationType::Required),
            "REQUIRES_NEW" => Ok(PropagationType::RequiresNew),
            "SUPPORTS" => Ok(PropagationType::Supports),
            "MANDATORY" => Ok(PropagationType::Mandatory),
            "NOT_SUPPORTED" => Ok(PropagationType::NotSupported),
            "NEVER" => Ok(PropagationType::Never),
            _ => Err(format!("unknown propagation type: {}", s)),
        }
    }
}

/// Row-lock hint attached to a query when it joins a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RowLockLevel {
    #[default]
    None,
    ForShare,
    ForUpdate,
    ForShareSkipLocked,
    ForUpdateSkipLocked,
}

impl RowLockLevel {
    /// SQL locking clause, `None` when no lock is taken.
    pub fn clause(&self) -> Option<&'static str> {
        match self {
            RowLockLevel::None => None,
            RowLockLevel::ForShare => Some("for share"),
            RowLockLevel::ForUpdate => Some("for update"),
            RowLockLevel::ForShareSkipLocked => Some("for share skip locked"),
            RowLockLevel::ForUpdateSkipLocked => Some("for update skip locked"),
        }
    }

    /// Share locks cannot be combined with aggregate functions.
    pub fn is_share(&self) -> bool {
        matches!(self, RowLockLevel::ForShare | RowLockLevel::ForShareSkipLocked)
    }
}

impl fmt::Display for RowLockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.clause().unwrap_or("none"))
    }
}

/// What to do with a transaction that is still open when its scope ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrxActionOnEnd {
    Commit,
    #[default]
    Rollback,
    None,
}

/// Snapshot of the propagation policy in effect for one decorated call.
///
/// Query builders copy the ambient options at construction time and
/// never change them afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PropagateOptions {
    #[serde(rename = "type")]
    pub propagation: PropagationType,
    /// `Class:method` of the outermost decorated call in the chain.
    pub entry_key: Option<String>,
    pub class_name: Option<String>,
    pub func_name: Option<String>,
    pub path: Option<String>,
    pub read_row_lock_level: RowLockLevel,
    pub write_row_lock_level: RowLockLevel,
}

impl PropagateOptions {
    pub fn new(propagation: PropagationType) -> Self {
        Self {
            propagation,
            read_row_lock_level: RowLockLevel::ForShare,
            write_row_lock_level: RowLockLevel::ForUpdate,
            ..Default::default()
        }
    }

    pub fn entry_key(mut self, key: impl Into<String>) -> Self {
        self.entry_key = Some(key.into());
        self
    }

    pub fn caller(mut self, class_name: impl Into<String>, func_name: impl Into<String>) -> Self {
        self.class_name = Some(class_name.into());
        self.func_name = Some(func_name.into());
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn read_row_lock_level(mut self, level: RowLockLevel) -> Self {
        self.read_row_lock_level = level;
        self
    }

    pub fn write_row_lock_level(mut self, level: RowLockLevel) -> Self {
        self.write_row_lock_level = level;
        self
    }

    /// `Class:method` of the call these options were made for.
    pub fn caller_key(&self) -> Option<String> {
        match (&self.class_name, &self.func_name) {
            (Some(class), Some(func)) => Some(caller_key(class, func)),
            _ => None,
        }
    }
}

/// Key identifying a decorated method.
pub fn caller_key(class_name: &str, func_name: &str) -> String {
    format!("{}:{}", class_name, func_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_propagation_parse_and_display() {
        for p in [
            PropagationType::Required,
            PropagationType::RequiresNew,
            PropagationType::Supports,
            PropagationType::Mandatory,
            PropagationType::NotSupported,
            PropagationType::Never,
        ] {
            assert_eq!(p.to_string().parse::<PropagationType>().unwrap(), p);
        }
        assert_eq!("requires new".parse::<PropagationType>().unwrap(), PropagationType::RequiresNew);
        assert!("sometimes".parse::<PropagationType>().is_err());
    }

    #[test]
    fn test_default_lock_levels() {
        let opts = PropagateOptions::new(PropagationType::Supports);
        assert_eq!(opts.read_row_lock_level, RowLockLevel::ForShare);
        assert_eq!(opts.write_row_lock_level, RowLockLevel::ForUpdate);
        assert!(opts.read_row_lock_level.is_share());
        assert!(!opts.write_row_lock_level.is_share());
    }

    #[test]
    fn test_options_serde_uses_type_key() {
        let opts = PropagateOptions::new(PropagationType::RequiresNew).caller("UserRepo", "save");
        let json = serde_json::to_value(&opts).unwrap();
        assert_eq!(json["type"], "REQUIRES_NEW");
        assert_eq!(json["write_row_lock_level"], "FOR_UPDATE");
        assert_eq!(opts.caller_key().as_deref(), Some("UserRepo:save"));
    }
}
