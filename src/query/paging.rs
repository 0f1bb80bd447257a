//! Auto paging: one builder becomes a counter query and a pager query.

use serde::Serialize;

use crate::propagation::UsageError;
use crate::sql::{Aggregate, AggregateFunc, Clause, Row, Statement};

/// Role of a statement produced by paging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PagingRole {
    #[default]
    None,
    /// `count(*) as total`, projection and ordering dropped.
    Counter,
    /// The requested page of rows.
    Pager,
}

/// Output column of the counter query.
pub const TOTAL_COLUMN: &str = "total";

/// One page of results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page {
    pub total: u64,
    /// 1-based.
    pub page: usize,
    pub page_size: usize,
    pub rows: Vec<Row>,
}

impl Page {
    pub fn page_count(&self) -> u64 {
        self.total.div_ceil(self.page_size as u64)
    }

    pub fn has_next(&self) -> bool {
        (self.page as u64) < self.page_count()
    }
}

/// `(limit, offset)` of a 1-based page.
pub fn page_window(page: usize, page_size: usize) -> Result<(usize, usize), UsageError> {
    if page == 0 || page_size == 0 {
        return Err(UsageError::InvalidArgument(format!(
            "page and page size start at 1 (got page {}, size {})",
            page, page_size
        )));
    }
    Ok((page_size, (page - 1) * page_size))
}

pub(crate) fn counter_statement(stmt: &Statement) -> Statement {
    let mut counter = stmt.clone();
    counter.clauses.retain(|c| matches!(c, Clause::Where(_) | Clause::Join(_)));
    counter.clauses.push(Clause::Aggregate(Aggregate {
        func: AggregateFunc::Count,
        column: None,
        alias: Some(TOTAL_COLUMN.to_string()),
    }));
    counter.limit = None;
    counter.lock = None;
    counter.offset = None;
    counter
}

pub(crate) fn pager_statement(stmt: &Statement, limit: usize, offset: usize) -> Statement {
    let mut pager = stmt.clone();
    pager.limit = Some(limit);
    pager.offset = Some(offset);
    pager
}
