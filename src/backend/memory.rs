//! In-process backend with per-transaction working sets.
//!
//! A transaction copies a table into its session on first write; reads
//! prefer the session copy and fall back to committed data. Savepoints
//! snapshot the session so rollback-to restores it, and release drops
//! the snapshot. A top-level commit publishes the session's tables.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use super::error::{BackendError, BackendResult};
use super::eval::{evaluate, matches_where, number, sort_order, value_to_f64, values_equal};
use super::result::ResultSet;
use super::{Backend, Connection};
use crate::db::DbDict;
use crate::sql::{AggregateFunc, Expr, JoinKind, Method, Row, SelectColumn, Statement};

type Tables = BTreeMap<String, Vec<Row>>;

/// Counters of connection-level operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendStats {
    pub transactions: usize,
    pub savepoints: usize,
    pub commits: usize,
    pub rollbacks: usize,
    pub savepoint_releases: usize,
    pub savepoint_rollbacks: usize,
    pub statements: usize,
}

#[derive(Debug, Default)]
struct Session {
    tables: Tables,
    savepoints: Vec<Savepoint>,
}

#[derive(Debug)]
struct Savepoint {
    conn: u64,
    name: String,
    snapshot: Tables,
}

#[derive(Debug, Clone, Copy)]
enum Link {
    Root,
    Savepoint { root: u64 },
}

#[derive(Debug, Default)]
struct MemoryState {
    schema: BTreeMap<String, Vec<String>>,
    tables: Tables,
    sessions: HashMap<u64, Session>,
    links: HashMap<u64, Link>,
    next_conn: u64,
    executed: Vec<String>,
    stats: BackendStats,
    destroyed: bool,
}

impl MemoryState {
    fn ensure_open(&self) -> BackendResult<()> {
        if self.destroyed {
            Err(BackendError::Closed)
        } else {
            Ok(())
        }
    }

    fn root_of(&self, id: u64) -> BackendResult<u64> {
        match self.links.get(&id) {
            Some(Link::Root) => Ok(id),
            Some(Link::Savepoint { root }) => Ok(*root),
            None => Err(BackendError::UnknownConnection(id)),
        }
    }

    fn allocate(&mut self) -> u64 {
        self.next_conn += 1;
        self.next_conn
    }

    fn record(&mut self, sql: String) {
        log::debug!("memory backend: {}", sql);
        self.executed.push(sql);
    }
}

/// In-memory [`Backend`].
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    destroy_delay: Option<Duration>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            destroy_delay: None,
        }
    }

    /// Backend with one empty table per dictionary entry.
    pub fn from_dict(dict: &DbDict) -> Self {
        let backend = Self::new();
        for (table, columns) in dict.tables() {
            backend.create_table(table, columns.iter().map(String::as_str));
        }
        backend
    }

    /// Make `destroy` take at least `delay`.
    pub fn with_destroy_delay(mut self, delay: Duration) -> Self {
        self.destroy_delay = Some(delay);
        self
    }

    pub fn create_table<'a>(&self, name: &str, columns: impl IntoIterator<Item = &'a str>) {
        let mut state = self.state.lock();
        state
            .schema
            .insert(name.to_string(), columns.into_iter().map(String::from).collect());
        state.tables.entry(name.to_string()).or_default();
    }

    /// Seed committed rows, bypassing transactions.
    pub fn insert_rows(&self, table: &str, rows: impl IntoIterator<Item = Value>) -> BackendResult<()> {
        let mut state = self.state.lock();
        let columns = state
            .schema
            .get(table)
            .cloned()
            .ok_or_else(|| BackendError::TableNotFound(table.to_string()))?;
        let mut prepared = Vec::new();
        for value in rows {
            let Value::Object(row) = value else {
                return Err(BackendError::Other(format!("row for {} is not an object", table)));
            };
            prepared.push(conform_row(table, &columns, &row)?);
        }
        state.tables.entry(table.to_string()).or_default().extend(prepared);
        Ok(())
    }

    /// Committed rows of `table`.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.state.lock().tables.get(table).cloned().unwrap_or_default()
    }

    /// Every statement and transaction-control command seen so far.
    pub fn executed_sql(&self) -> Vec<String> {
        self.state.lock().executed.clone()
    }

    pub fn stats(&self) -> BackendStats {
        self.state.lock().stats
    }

    /// Live transactions and savepoints.
    pub fn open_connections(&self) -> usize {
        self.state.lock().links.len()
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryBackend")
            .field("tables", &state.schema.keys().collect::<Vec<_>>())
            .field("open_connections", &state.links.len())
            .field("destroyed", &state.destroyed)
            .finish()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn begin_transaction(&self) -> BackendResult<Connection> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        let id = state.allocate();
        state.sessions.insert(id, Session::default());
        state.links.insert(id, Link::Root);
        state.stats.transactions += 1;
        state.record(format!("begin /* conn#{} */", id));
        Ok(Connection::new(id))
    }

    async fn begin_savepoint(&self, parent: &Connection) -> BackendResult<Connection> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        let root = state.root_of(parent.id())?;
        let id = state.allocate();
        let name = format!("sp_{}", id);

        let session = state
            .sessions
            .get_mut(&root)
            .ok_or(BackendError::UnknownConnection(root))?;
        let snapshot = session.tables.clone();
        session.savepoints.push(Savepoint {
            conn: id,
            name: name.clone(),
            snapshot,
        });

        state.links.insert(id, Link::Savepoint { root });
        state.stats.savepoints += 1;
        state.record(format!("savepoint {}", name));
        Ok(Connection::new(id))
    }

    async fn commit(&self, conn: &Connection) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        let id = conn.id();
        let link = state.links.get(&id).copied();
        match link {
            None => Err(BackendError::UnknownConnection(id)),
            Some(Link::Root) => {
                let session = state
                    .sessions
                    .remove(&id)
                    .ok_or(BackendError::UnknownConnection(id))?;
                for savepoint in &session.savepoints {
                    state.links.remove(&savepoint.conn);
                }
                state.links.remove(&id);
                state.tables.extend(session.tables);
                state.stats.commits += 1;
                state.record(format!("commit /* conn#{} */", id));
                Ok(())
            }
            Some(Link::Savepoint { root }) => {
                let released = split_savepoints(&mut state, root, id)?;
                for savepoint in &released {
                    state.links.remove(&savepoint.conn);
                }
                state.stats.savepoint_releases += 1;
                state.record(format!("release savepoint {}", released[0].name));
                Ok(())
            }
        }
    }

    async fn rollback(&self, conn: &Connection) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        let id = conn.id();
        let link = state.links.get(&id).copied();
        match link {
            None => Err(BackendError::UnknownConnection(id)),
            Some(Link::Root) => {
                if let Some(session) = state.sessions.remove(&id) {
                    for savepoint in &session.savepoints {
                        state.links.remove(&savepoint.conn);
                    }
                }
                state.links.remove(&id);
                state.stats.rollbacks += 1;
                state.record(format!("rollback /* conn#{} */", id));
                Ok(())
            }
            Some(Link::Savepoint { root }) => {
                let mut removed = split_savepoints(&mut state, root, id)?;
                for savepoint in &removed {
                    state.links.remove(&savepoint.conn);
                }
                let target = removed.swap_remove(0);
                if let Some(session) = state.sessions.get_mut(&root) {
                    session.tables = target.snapshot;
                }
                state.stats.savepoint_rollbacks += 1;
                state.record(format!("rollback to savepoint {}", target.name));
                Ok(())
            }
        }
    }

    async fn execute(&self, conn: Option<&Connection>, statement: &Statement) -> BackendResult<ResultSet> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        let sql = match conn {
            Some(c) => format!("{} /* {} */", statement, c),
            None => statement.to_string(),
        };
        state.stats.statements += 1;
        state.record(sql);
        execute_statement(&mut state, conn, statement)
    }

    async fn destroy(&self) -> BackendResult<()> {
        if let Some(delay) = self.destroy_delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        let open = state.links.len();
        state.sessions.clear();
        state.links.clear();
        state.destroyed = true;
        log::debug!("memory backend destroyed with {} open connections", open);
        Ok(())
    }
}

/// Remove the savepoint `id` of session `root` and everything opened after it.
fn split_savepoints(state: &mut MemoryState, root: u64, id: u64) -> BackendResult<Vec<Savepoint>> {
    let session = state
        .sessions
        .get_mut(&root)
        .ok_or(BackendError::UnknownConnection(root))?;
    let pos = session
        .savepoints
        .iter()
        .position(|s| s.conn == id)
        .ok_or(BackendError::UnknownConnection(id))?;
    Ok(session.savepoints.split_off(pos))
}

fn execute_statement(
    state: &mut MemoryState,
    conn: Option<&Connection>,
    stmt: &Statement,
) -> BackendResult<ResultSet> {
    let root = conn.map(|c| state.root_of(c.id())).transpose()?;
    let MemoryState {
        schema,
        tables,
        sessions,
        ..
    } = state;

    let session = match root {
        Some(root) => Some(
            sessions
                .get_mut(&root)
                .ok_or(BackendError::UnknownConnection(root))?,
        ),
        None => None,
    };

    if stmt.method.is_read() {
        let local = session.as_deref().map(|s| &s.tables);
        return select(schema, tables, local, stmt);
    }

    let columns = schema
        .get(&stmt.table)
        .ok_or_else(|| BackendError::TableNotFound(stmt.table.clone()))?;
    let target = match session {
        Some(session) => session
            .tables
            .entry(stmt.table.clone())
            .or_insert_with(|| tables.get(&stmt.table).cloned().unwrap_or_default()),
        None => tables.entry(stmt.table.clone()).or_default(),
    };
    write(schema, columns, target, stmt)
}

/// Tables visible to one statement, in join order.
struct Scope<'a> {
    tables: Vec<(&'a str, &'a [String])>,
}

impl<'a> Scope<'a> {
    fn new(schema: &'a BTreeMap<String, Vec<String>>, stmt: &'a Statement) -> BackendResult<Self> {
        let tables = stmt
            .tables()
            .into_iter()
            .map(|t| {
                schema
                    .get(t)
                    .map(|cols| (t, cols.as_slice()))
                    .ok_or_else(|| BackendError::TableNotFound(t.to_string()))
            })
            .collect::<BackendResult<Vec<_>>>()?;
        Ok(Self { tables })
    }

    /// Fully qualified key for a plain or qualified column reference.
    fn resolve(&self, column: &str) -> BackendResult<String> {
        if let Some((table, col)) = column.split_once('.') {
            let known = self
                .tables
                .iter()
                .any(|(t, cols)| *t == table && cols.iter().any(|c| c == col));
            return if known {
                Ok(column.to_string())
            } else {
                Err(BackendError::ColumnNotFound(column.to_string()))
            };
        }

        let owners: Vec<&str> = self
            .tables
            .iter()
            .filter(|(_, cols)| cols.iter().any(|c| c == column))
            .map(|(t, _)| *t)
            .collect();
        match owners.as_slice() {
            [] => Err(BackendError::ColumnNotFound(column.to_string())),
            [table] => Ok(format!("{}.{}", table, column)),
            _ => Err(BackendError::AmbiguousColumn {
                column: column.to_string(),
                tables: owners.join(", "),
            }),
        }
    }

    fn qualify(&self, expr: &Expr) -> BackendResult<Expr> {
        expr.try_map_columns(&mut |c| self.resolve(c))
    }

    fn qualified_columns(&self, table: &str) -> Vec<String> {
        self.tables
            .iter()
            .filter(|(t, _)| *t == table)
            .flat_map(|(t, cols)| cols.iter().map(move |c| format!("{}.{}", t, c)))
            .collect()
    }
}

fn qualify_row(table: &str, columns: &[String], row: &Row) -> Row {
    columns
        .iter()
        .map(|c| (format!("{}.{}", table, c), row.get(c).cloned().unwrap_or(Value::Null)))
        .collect()
}

fn null_row(keys: &[String]) -> Row {
    keys.iter().map(|k| (k.clone(), Value::Null)).collect()
}

fn conform_row(table: &str, columns: &[String], row: &Row) -> BackendResult<Row> {
    let prefix = format!("{}.", table);
    let mut values = Row::new();
    for (key, value) in row {
        let column = key.strip_prefix(&prefix).unwrap_or(key);
        if !columns.iter().any(|c| c == column) {
            return Err(BackendError::ColumnNotFound(key.clone()));
        }
        values.insert(column.to_string(), value.clone());
    }
    Ok(columns
        .iter()
        .map(|c| (c.clone(), values.get(c).cloned().unwrap_or(Value::Null)))
        .collect())
}

fn select(
    schema: &BTreeMap<String, Vec<String>>,
    main: &Tables,
    local: Option<&Tables>,
    stmt: &Statement,
) -> BackendResult<ResultSet> {
    let scope = Scope::new(schema, stmt)?;
    let fetch = |table: &str, columns: &[String]| -> Vec<Row> {
        local
            .and_then(|l| l.get(table))
            .or_else(|| main.get(table))
            .map(|rows| rows.iter().map(|r| qualify_row(table, columns, r)).collect())
            .unwrap_or_default()
    };

    let (base, base_cols) = scope.tables[0];
    let mut rows = fetch(base, base_cols);
    let mut left_keys = scope.qualified_columns(base);

    for join in stmt.joins() {
        let right_cols = schema
            .get(&join.table)
            .ok_or_else(|| BackendError::TableNotFound(join.table.clone()))?;
        let right = fetch(&join.table, right_cols);
        let right_keys = scope.qualified_columns(&join.table);
        rows = join_rows(&scope, rows, right, join.kind, &join.left, &join.right, &left_keys, &right_keys)?;
        left_keys.extend(right_keys);
    }

    if let Some(filter) = stmt.filter() {
        let filter = scope.qualify(&filter)?;
        let mut kept = Vec::with_capacity(rows.len());
        for row in rows {
            if matches_where(&filter, &row)? {
                kept.push(row);
            }
        }
        rows = kept;
    }

    if stmt.has_aggregate() {
        return aggregate(&scope, stmt, &rows);
    }

    let order = stmt
        .order_by()
        .map(|o| Ok((scope.resolve(&o.column)?, o.ascending)))
        .collect::<BackendResult<Vec<_>>>()?;
    if !order.is_empty() {
        rows.sort_by(|a, b| {
            for (key, ascending) in &order {
                let ord = sort_order(
                    a.get(key).unwrap_or(&Value::Null),
                    b.get(key).unwrap_or(&Value::Null),
                );
                if ord.is_ne() {
                    return if *ascending { ord } else { ord.reverse() };
                }
            }
            std::cmp::Ordering::Equal
        });
    }

    let limit = if stmt.method == Method::First { Some(1) } else { stmt.limit };
    let rows = rows
        .into_iter()
        .skip(stmt.offset.unwrap_or(0))
        .take(limit.unwrap_or(usize::MAX));

    let projection = projection(&scope, stmt)?;
    let mut result = ResultSet::new(projection.iter().map(|(out, _)| out.clone()).collect());
    for row in rows {
        result.push(
            projection
                .iter()
                .map(|(out, src)| (out.clone(), row.get(src).cloned().unwrap_or(Value::Null)))
                .collect(),
        );
    }
    Ok(result)
}

#[allow(clippy::too_many_arguments)]
fn join_rows(
    scope: &Scope<'_>,
    left: Vec<Row>,
    right: Vec<Row>,
    kind: JoinKind,
    on_left: &str,
    on_right: &str,
    left_keys: &[String],
    right_keys: &[String],
) -> BackendResult<Vec<Row>> {
    let on = match kind {
        JoinKind::Cross => None,
        _ => Some((scope.resolve(on_left)?, scope.resolve(on_right)?)),
    };
    let matches = |merged: &Row| match &on {
        None => true,
        Some((l, r)) => match (merged.get(l), merged.get(r)) {
            (Some(a), Some(b)) => !a.is_null() && values_equal(a, b),
            _ => false,
        },
    };

    let mut out = Vec::new();
    let mut right_matched = vec![false; right.len()];
    for l in &left {
        let mut matched = false;
        for (i, r) in right.iter().enumerate() {
            let mut merged = l.clone();
            merged.extend(r.clone());
            if matches(&merged) {
                matched = true;
                right_matched[i] = true;
                out.push(merged);
            }
        }
        if !matched && kind == JoinKind::Left {
            let mut merged = l.clone();
            merged.extend(null_row(right_keys));
            out.push(merged);
        }
    }
    if kind == JoinKind::Right {
        for (r, matched) in right.iter().zip(right_matched) {
            if !matched {
                let mut merged = null_row(left_keys);
                merged.extend(r.clone());
                out.push(merged);
            }
        }
    }
    Ok(out)
}

/// Output name and source key of every projected column.
fn projection(scope: &Scope<'_>, stmt: &Statement) -> BackendResult<Vec<(String, String)>> {
    let wildcard = || -> Vec<(String, String)> {
        if scope.tables.len() == 1 {
            let (table, cols) = scope.tables[0];
            cols.iter().map(|c| (c.clone(), format!("{}.{}", table, c))).collect()
        } else {
            scope
                .tables
                .iter()
                .flat_map(|(t, cols)| cols.iter().map(move |c| format!("{}.{}", t, c)))
                .map(|k| (k.clone(), k))
                .collect()
        }
    };

    let columns = stmt.columns();
    if columns.is_empty() {
        return Ok(wildcard());
    }

    let mut out = Vec::new();
    for column in columns {
        match column {
            SelectColumn::Wildcard => out.extend(wildcard()),
            SelectColumn::Column(c) => out.push((c.clone(), scope.resolve(c)?)),
            SelectColumn::Aliased { column, alias } => out.push((alias.clone(), scope.resolve(column)?)),
        }
    }
    Ok(out)
}

fn aggregate(scope: &Scope<'_>, stmt: &Statement, rows: &[Row]) -> BackendResult<ResultSet> {
    let mut columns = Vec::new();
    let mut out = Row::new();

    for agg in stmt.aggregates() {
        let source = agg.column.as_deref().map(|c| scope.resolve(c)).transpose()?;
        let values: Vec<&Value> = match &source {
            Some(key) => rows
                .iter()
                .filter_map(|r| r.get(key))
                .filter(|v| !v.is_null())
                .collect(),
            None => Vec::new(),
        };

        let value = match agg.func {
            AggregateFunc::Count => match source {
                None => Value::from(rows.len()),
                Some(_) => Value::from(values.len()),
            },
            AggregateFunc::Sum if values.is_empty() => Value::Null,
            AggregateFunc::Sum => number(
                values.iter().map(|v| value_to_f64(v)).sum(),
                values.iter().all(|v| v.is_i64()),
            ),
            AggregateFunc::Avg if values.is_empty() => Value::Null,
            AggregateFunc::Avg => number(
                values.iter().map(|v| value_to_f64(v)).sum::<f64>() / values.len() as f64,
                false,
            ),
            AggregateFunc::Min => values
                .iter()
                .min_by(|a, b| sort_order(a, b))
                .map(|v| (*v).clone())
                .unwrap_or(Value::Null),
            AggregateFunc::Max => values
                .iter()
                .max_by(|a, b| sort_order(a, b))
                .map(|v| (*v).clone())
                .unwrap_or(Value::Null),
        };

        let name = agg.output_name();
        columns.push(name.clone());
        out.insert(name, value);
    }

    let mut result = ResultSet::new(columns);
    result.push(out);
    Ok(result)
}

fn write(
    schema: &BTreeMap<String, Vec<String>>,
    columns: &[String],
    target: &mut Vec<Row>,
    stmt: &Statement,
) -> BackendResult<ResultSet> {
    let table = stmt.table.as_str();
    let scope = Scope::new(schema, stmt)?;
    let filter = stmt.filter().map(|f| scope.qualify(&f)).transpose()?;
    let matches = |row: &Row| -> BackendResult<bool> {
        match &filter {
            Some(f) => matches_where(f, &qualify_row(table, columns, row)),
            None => Ok(true),
        }
    };

    match stmt.method {
        Method::Insert => {
            let rows = stmt
                .values
                .iter()
                .map(|row| conform_row(table, columns, row))
                .collect::<BackendResult<Vec<_>>>()?;
            let n = rows.len();
            target.extend(rows);
            Ok(ResultSet::modified(n))
        }
        Method::Update => {
            let prefix = format!("{}.", table);
            let assignments = stmt
                .assignments
                .iter()
                .map(|a| {
                    let key = scope.resolve(&a.column)?;
                    let column = key.strip_prefix(&prefix).unwrap_or(&key).to_string();
                    Ok((column, scope.qualify(&a.value)?))
                })
                .collect::<BackendResult<Vec<_>>>()?;

            let mut changes = Vec::new();
            for (i, row) in target.iter().enumerate() {
                if matches(row)? {
                    let qualified = qualify_row(table, columns, row);
                    let values = assignments
                        .iter()
                        .map(|(c, e)| Ok((c.clone(), evaluate(e, &qualified)?)))
                        .collect::<BackendResult<Vec<_>>>()?;
                    changes.push((i, values));
                }
            }
            let n = changes.len();
            for (i, values) in changes {
                target[i].extend(values);
            }
            Ok(ResultSet::modified(n))
        }
        Method::Delete => {
            let mut keep = Vec::with_capacity(target.len());
            for row in target.iter() {
                keep.push(!matches(row)?);
            }
            let before = target.len();
            let mut flags = keep.into_iter();
            target.retain(|_| flags.next().unwrap_or(true));
            Ok(ResultSet::modified(before - target.len()))
        }
        Method::Truncate => {
            let n = target.len();
            target.clear();
            Ok(ResultSet::modified(n))
        }
        Method::Select | Method::First => Err(BackendError::Other("read routed to write path".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::{BinaryOperator, Clause, Join, Parser};
    use serde_json::json;

    fn setup() -> MemoryBackend {
        let backend = MemoryBackend::new();
        backend.create_table("tb_user", ["uid", "name"]);
        backend.create_table("tb_user_ext", ["uid", "age", "address"]);
        backend
            .insert_rows("tb_user", vec![json!({"uid": 1, "name": "alice"}), json!({"uid": 2, "name": "bob"})])
            .unwrap();
        backend
            .insert_rows("tb_user_ext", vec![json!({"uid": 1, "age": 30, "address": "a"})])
            .unwrap();
        backend
    }

    fn name_of(backend: &MemoryBackend, uid: i64) -> Value {
        backend
            .rows("tb_user")
            .into_iter()
            .find(|r| r["uid"] == json!(uid))
            .map(|r| r["name"].clone())
            .unwrap()
    }

    #[tokio::test]
    async fn test_autocommit_write_is_visible() {
        let backend = setup();
        let stmt = Parser::parse("UPDATE tb_user SET name = 'zed' WHERE uid = 2").unwrap();
        let rs = backend.execute(None, &stmt).await.unwrap();
        assert_eq!(rs.rows_affected, 1);
        assert_eq!(name_of(&backend, 2), json!("zed"));
    }

    #[tokio::test]
    async fn test_transaction_isolated_until_commit() {
        let backend = setup();
        let conn = backend.begin_transaction().await.unwrap();
        let stmt = Parser::parse("UPDATE tb_user SET name = 'zed' WHERE uid = 1").unwrap();
        backend.execute(Some(&conn), &stmt).await.unwrap();

        let read = Parser::parse("SELECT name FROM tb_user WHERE uid = 1").unwrap();
        let inside = backend.execute(Some(&conn), &read).await.unwrap();
        let outside = backend.execute(None, &read).await.unwrap();
        assert_eq!(inside.scalar("name"), Some(&json!("zed")));
        assert_eq!(outside.scalar("name"), Some(&json!("alice")));

        backend.commit(&conn).await.unwrap();
        assert_eq!(name_of(&backend, 1), json!("zed"));
        assert_eq!(backend.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_savepoint_rollback_restores_snapshot() {
        let backend = setup();
        let conn = backend.begin_transaction().await.unwrap();
        let first = Parser::parse("UPDATE tb_user SET name = 'one' WHERE uid = 1").unwrap();
        backend.execute(Some(&conn), &first).await.unwrap();

        let sp = backend.begin_savepoint(&conn).await.unwrap();
        let second = Parser::parse("UPDATE tb_user SET name = 'two' WHERE uid = 1").unwrap();
        backend.execute(Some(&sp), &second).await.unwrap();
        backend.rollback(&sp).await.unwrap();

        let read = Parser::parse("SELECT name FROM tb_user WHERE uid = 1").unwrap();
        let rs = backend.execute(Some(&conn), &read).await.unwrap();
        assert_eq!(rs.scalar("name"), Some(&json!("one")));

        // savepoint connection is gone
        assert_eq!(backend.execute(Some(&sp), &read).await, Err(BackendError::UnknownConnection(sp.id())));

        backend.commit(&conn).await.unwrap();
        assert_eq!(name_of(&backend, 1), json!("one"));
        assert_eq!(backend.stats().savepoint_rollbacks, 1);
    }

    #[tokio::test]
    async fn test_release_keeps_writes_in_parent() {
        let backend = setup();
        let conn = backend.begin_transaction().await.unwrap();
        let sp = backend.begin_savepoint(&conn).await.unwrap();
        let stmt = Parser::parse("DELETE FROM tb_user WHERE uid = 2").unwrap();
        backend.execute(Some(&sp), &stmt).await.unwrap();
        backend.commit(&sp).await.unwrap();

        assert_eq!(backend.rows("tb_user").len(), 2);
        backend.commit(&conn).await.unwrap();
        assert_eq!(backend.rows("tb_user").len(), 1);

        let sql = backend.executed_sql();
        assert!(sql.iter().any(|s| s.starts_with("release savepoint")));
    }

    #[tokio::test]
    async fn test_rollback_discards_session() {
        let backend = setup();
        let conn = backend.begin_transaction().await.unwrap();
        let stmt = Parser::parse("INSERT INTO tb_user (uid, name) VALUES (3, 'carol')").unwrap();
        backend.execute(Some(&conn), &stmt).await.unwrap();
        backend.rollback(&conn).await.unwrap();

        assert_eq!(backend.rows("tb_user").len(), 2);
        assert_eq!(backend.commit(&conn).await, Err(BackendError::UnknownConnection(conn.id())));
    }

    #[tokio::test]
    async fn test_unknown_column_fails() {
        let backend = setup();
        let stmt = Parser::parse("SELECT * FROM tb_user WHERE nope = 1").unwrap();
        assert_eq!(
            backend.execute(None, &stmt).await,
            Err(BackendError::ColumnNotFound("nope".into()))
        );
    }

    #[tokio::test]
    async fn test_join_and_ambiguity() {
        let backend = setup();
        let mut stmt = Statement::new("tb_user");
        stmt.clauses.push(Clause::Join(Join {
            kind: JoinKind::Left,
            table: "tb_user_ext".into(),
            left: "tb_user.uid".into(),
            right: "tb_user_ext.uid".into(),
        }));
        let rs = backend.execute(None, &stmt).await.unwrap();
        assert_eq!(rs.len(), 2);
        assert_eq!(rs.rows[1]["tb_user_ext.age"], Value::Null);

        stmt.clauses.push(Clause::Where(Expr::binary(Expr::column("uid"), BinaryOperator::Eq, Expr::value(1))));
        assert!(matches!(
            backend.execute(None, &stmt).await,
            Err(BackendError::AmbiguousColumn { .. })
        ));
    }

    #[tokio::test]
    async fn test_aggregates() {
        let backend = setup();
        let stmt = Parser::parse("SELECT count(*) AS total, max(uid) AS top, sum(uid) FROM tb_user").unwrap();
        let rs = backend.execute(None, &stmt).await.unwrap();
        assert_eq!(rs.scalar("total"), Some(&json!(2)));
        assert_eq!(rs.scalar("top"), Some(&json!(2)));
        assert_eq!(rs.scalar("sum(uid)"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn test_destroy_closes_backend() {
        let backend = setup();
        let _conn = backend.begin_transaction().await.unwrap();
        backend.destroy().await.unwrap();

        assert!(backend.is_destroyed());
        assert_eq!(backend.open_connections(), 0);
        assert_eq!(backend.begin_transaction().await, Err(BackendError::Closed));
    }
}
