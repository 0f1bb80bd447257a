//! Query result types.

use serde_json::Value;

use crate::sql::Row;

/// Rows returned by a statement, plus the count of rows it changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    /// Column names in order.
    pub columns: Vec<String>,
    /// Rows as maps of column name to value.
    pub rows: Vec<Row>,
    /// Rows inserted, updated or deleted.
    pub rows_affected: usize,
}

impl ResultSet {
    /// Create a new empty result set.
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            ..Default::default()
        }
    }

    /// Result of a write.
    pub fn modified(rows_affected: usize) -> Self {
        Self {
            rows_affected,
            ..Default::default()
        }
    }

    /// Add a row.
    pub fn push(&mut self, row: Row) {
        self.rows.push(row);
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Get the first row.
    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    /// Value of `column` in the first row.
    pub fn scalar(&self, column: &str) -> Option<&Value> {
        self.rows.first().and_then(|r| r.get(column))
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }
}
