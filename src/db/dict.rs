//! Table dictionary of a data source.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Table name to column names, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DbDict {
    tables: BTreeMap<String, Vec<String>>,
}

impl DbDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table<I, S>(mut self, table: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tables
            .insert(table.into(), columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn tables(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.tables.iter()
    }

    pub fn columns(&self, table: &str) -> Option<&[String]> {
        self.tables.get(table).map(Vec::as_slice)
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dict_from_json() {
        let dict: DbDict = serde_json::from_str(r#"{"tb_user": ["uid", "name"]}"#).unwrap();
        assert_eq!(dict.table_count(), 1);
        assert_eq!(dict.columns("tb_user"), Some(&["uid".to_string(), "name".to_string()][..]));
        assert!(dict.columns("missing").is_none());
    }
}
