//! Statement model shared by the query builder, the raw SQL parser and
//! backends.
//!
//! A [`Statement`] keeps its clauses as an ordered list so interceptors
//! can inspect and rewrite them before execution.

use std::fmt;

use serde_json::Value;

use crate::types::RowLockLevel;

/// Row shape used for inserted values and results.
pub type Row = serde_json::Map<String, Value>;

/// Builder operation a statement was created by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Method {
    #[default]
    Select,
    /// Select at most one row.
    First,
    Insert,
    Update,
    Delete,
    Truncate,
}

impl Method {
    /// Reads take the read row lock, everything but truncate the write one.
    pub fn is_read(&self) -> bool {
        matches!(self, Method::Select | Method::First)
    }
}

/// A query against a single base table.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Statement {
    pub table: String,
    pub method: Method,
    pub clauses: Vec<Clause>,
    /// Rows for INSERT.
    pub values: Vec<Row>,
    /// Assignments for UPDATE.
    pub assignments: Vec<Assignment>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    /// Lock decision. `Some(RowLockLevel::None)` means decided: no lock.
    pub lock: Option<RowLockLevel>,
}

/// Statement clause.
#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    Columns(Vec<SelectColumn>),
    Aggregate(Aggregate),
    Where(Expr),
    Join(Join),
    OrderBy(OrderBy),
}

/// Projected column.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectColumn {
    Wildcard,
    /// Plain or `table.column` reference.
    Column(String),
    Aliased { column: String, alias: String },
}

/// Aggregate function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunc {
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

impl AggregateFunc {
    pub fn name(&self) -> &'static str {
        match self {
            AggregateFunc::Count => "count",
            AggregateFunc::Sum => "sum",
            AggregateFunc::Min => "min",
            AggregateFunc::Max => "max",
            AggregateFunc::Avg => "avg",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "count" => Some(AggregateFunc::Count),
            "sum" => Some(AggregateFunc::Sum),
            "min" => Some(AggregateFunc::Min),
            "max" => Some(AggregateFunc::Max),
            "avg" => Some(AggregateFunc::Avg),
            _ => None,
        }
    }
}

/// Aggregate projection such as `count(*) as total`.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub func: AggregateFunc,
    /// `None` means `*`.
    pub column: Option<String>,
    pub alias: Option<String>,
}

impl Aggregate {
    /// Key of the aggregate in a result row.
    pub fn output_name(&self) -> String {
        match &self.alias {
            Some(alias) => alias.clone(),
            None => format!("{}({})", self.func.name(), self.column.as_deref().unwrap_or("*")),
        }
    }
}

/// Join flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinKind {
    Plain,
    Inner,
    Left,
    Right,
    Cross,
}

impl JoinKind {
    fn keyword(&self) -> &'static str {
        match self {
            JoinKind::Plain => "join",
            JoinKind::Inner => "inner join",
            JoinKind::Left => "left join",
            JoinKind::Right => "right join",
            JoinKind::Cross => "cross join",
        }
    }
}

/// `join table on left = right`, both sides fully qualified.
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub kind: JoinKind,
    pub table: String,
    pub left: String,
    pub right: String,
}

/// ORDER BY entry.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub column: String,
    pub ascending: bool,
}

/// `column = value` for UPDATE.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub column: String,
    pub value: Expr,
}

impl Statement {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Default::default()
        }
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    pub fn has_aggregate(&self) -> bool {
        self.clauses.iter().any(|c| matches!(c, Clause::Aggregate(_)))
    }

    pub fn joins(&self) -> impl Iterator<Item = &Join> {
        self.clauses.iter().filter_map(|c| match c {
            Clause::Join(j) => Some(j),
            _ => None,
        })
    }

    pub fn aggregates(&self) -> impl Iterator<Item = &Aggregate> {
        self.clauses.iter().filter_map(|c| match c {
            Clause::Aggregate(a) => Some(a),
            _ => None,
        })
    }

    pub fn order_by(&self) -> impl Iterator<Item = &OrderBy> {
        self.clauses.iter().filter_map(|c| match c {
            Clause::OrderBy(o) => Some(o),
            _ => None,
        })
    }

    /// Projected columns, empty meaning `*`.
    pub fn columns(&self) -> Vec<&SelectColumn> {
        self.clauses
            .iter()
            .filter_map(|c| match c {
                Clause::Columns(cols) => Some(cols.iter()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// All WHERE clauses combined with AND.
    pub fn filter(&self) -> Option<Expr> {
        self.clauses
            .iter()
            .filter_map(|c| match c {
                Clause::Where(e) => Some(e.clone()),
                _ => None,
            })
            .reduce(|acc, e| Expr::BinaryOp {
                left: Box::new(acc),
                op: BinaryOperator::And,
                right: Box::new(e),
            })
    }

    /// Tables this statement reads: the base table followed by joined ones.
    pub fn tables(&self) -> Vec<&str> {
        let mut tables = vec![self.table.as_str()];
        for join in self.joins() {
            if !tables.contains(&join.table.as_str()) {
                tables.push(join.table.as_str());
            }
        }
        tables
    }
}

/// SQL expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Column reference, plain or `table.column`.
    Column(String),
    /// Literal value.
    Literal(LiteralValue),
    /// Binary operation (e.g., a = b, a AND b).
    BinaryOp {
        left: Box<Expr>,
        op: BinaryOperator,
        right: Box<Expr>,
    },
    /// Unary operation (e.g., NOT a, -x).
    UnaryOp {
        op: UnaryOperator,
        expr: Box<Expr>,
    },
    /// IS NULL / IS NOT NULL.
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    /// IN list.
    InList {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    /// BETWEEN a AND b.
    Between {
        expr: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
        negated: bool,
    },
    /// LIKE pattern.
    Like {
        expr: Box<Expr>,
        pattern: String,
        negated: bool,
    },
    /// Nested expression in parentheses.
    Nested(Box<Expr>),
}

impl Expr {
    pub fn column(name: impl Into<String>) -> Self {
        Expr::Column(name.into())
    }

    pub fn value(value: impl Into<Value>) -> Self {
        Expr::Literal(LiteralValue::from_json(value.into()))
    }

    pub fn binary(left: Expr, op: BinaryOperator, right: Expr) -> Self {
        Expr::BinaryOp {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    /// Apply `f` to every column reference, innermost first.
    pub fn map_columns<F>(&self, f: &mut F) -> Expr
    where
        F: FnMut(&str) -> String,
    {
        match self {
            Expr::Column(name) => Expr::Column(f(name)),
            Expr::Literal(_) => self.clone(),
            Expr::BinaryOp { left, op, right } => Expr::BinaryOp {
                left: Box::new(left.map_columns(f)),
                op: *op,
                right: Box::new(right.map_columns(f)),
            },
            Expr::UnaryOp { op, expr } => Expr::UnaryOp {
                op: *op,
                expr: Box::new(expr.map_columns(f)),
            },
            Expr::IsNull { expr, negated } => Expr::IsNull {
                expr: Box::new(expr.map_columns(f)),
                negated: *negated,
            },
            Expr::InList { expr, list, negated } => Expr::InList {
                expr: Box::new(expr.map_columns(f)),
                list: list.iter().map(|e| e.map_columns(f)).collect(),
                negated: *negated,
            },
            Expr::Between { expr, low, high, negated } => Expr::Between {
                expr: Box::new(expr.map_columns(f)),
                low: Box::new(low.map_columns(f)),
                high: Box::new(high.map_columns(f)),
                negated: *negated,
            },
            Expr::Like { expr, pattern, negated } => Expr::Like {
                expr: Box::new(expr.map_columns(f)),
                pattern: pattern.clone(),
                negated: *negated,
            },
            Expr::Nested(inner) => Expr::Nested(Box::new(inner.map_columns(f))),
        }
    }

    /// Fallible variant of [`Expr::map_columns`].
    pub fn try_map_columns<F, E>(&self, f: &mut F) -> Result<Expr, E>
    where
        F: FnMut(&str) -> Result<String, E>,
    {
        let mut failure = None;
        let mapped = self.map_columns(&mut |name| match f(name) {
            Ok(resolved) => resolved,
            Err(e) => {
                failure.get_or_insert(e);
                name.to_string()
            }
        });
        match failure {
            Some(e) => Err(e),
            None => Ok(mapped),
        }
    }
}

/// Literal value.
#[derive(Debug, Clone, PartialEq)]
pub enum LiteralValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Json(Value),
}

impl LiteralValue {
    /// Convert to JSON value for storage.
    pub fn to_json(&self) -> Value {
        match self {
            LiteralValue::Null => Value::Null,
            LiteralValue::Boolean(b) => Value::Bool(*b),
            LiteralValue::Integer(n) => Value::Number((*n).into()),
            LiteralValue::Float(f) => {
                serde_json::Number::from_f64(*f)
                    .map(Value::Number)
                    .unwrap_or(Value::Null)
            }
            LiteralValue::String(s) => Value::String(s.clone()),
            LiteralValue::Json(v) => v.clone(),
        }
    }

    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Null => LiteralValue::Null,
            Value::Bool(b) => LiteralValue::Boolean(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => LiteralValue::Integer(i),
                None => LiteralValue::Float(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => LiteralValue::String(s),
            other => LiteralValue::Json(other),
        }
    }
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    // Comparison
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    // Logical
    And,
    Or,
    // Arithmetic
    Plus,
    Minus,
    Multiply,
    Divide,
    Modulo,
    // String
    Concat,
}

impl BinaryOperator {
    fn symbol(&self) -> &'static str {
        match self {
            BinaryOperator::Eq => "=",
            BinaryOperator::NotEq => "<>",
            BinaryOperator::Lt => "<",
            BinaryOperator::LtEq => "<=",
            BinaryOperator::Gt => ">",
            BinaryOperator::GtEq => ">=",
            BinaryOperator::And => "and",
            BinaryOperator::Or => "or",
            BinaryOperator::Plus => "+",
            BinaryOperator::Minus => "-",
            BinaryOperator::Multiply => "*",
            BinaryOperator::Divide => "/",
            BinaryOperator::Modulo => "%",
            BinaryOperator::Concat => "||",
        }
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    Not,
    Minus,
    Plus,
}

impl fmt::Display for LiteralValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LiteralValue::Null => f.write_str("null"),
            LiteralValue::Boolean(b) => write!(f, "{}", b),
            LiteralValue::Integer(n) => write!(f, "{}", n),
            LiteralValue::Float(n) => write!(f, "{}", n),
            LiteralValue::String(s) => write!(f, "'{}'", s.replace('\'', "''")),
            LiteralValue::Json(v) => write!(f, "'{}'", v.to_string().replace('\'', "''")),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Column(name) => f.write_str(name),
            Expr::Literal(lit) => write!(f, "{}", lit),
            Expr::BinaryOp { left, op, right } => write!(f, "{} {} {}", left, op.symbol(), right),
            Expr::UnaryOp { op, expr } => match op {
                UnaryOperator::Not => write!(f, "not {}", expr),
                UnaryOperator::Minus => write!(f, "-{}", expr),
                UnaryOperator::Plus => write!(f, "+{}", expr),
            },
            Expr::IsNull { expr, negated } => {
                write!(f, "{} is {}null", expr, if *negated { "not " } else { "" })
            }
            Expr::InList { expr, list, negated } => {
                let items = list.iter().map(|e| e.to_string()).collect::<Vec<_>>().join(", ");
                write!(f, "{} {}in ({})", expr, if *negated { "not " } else { "" }, items)
            }
            Expr::Between { expr, low, high, negated } => write!(
                f,
                "{} {}between {} and {}",
                expr,
                if *negated { "not " } else { "" },
                low,
                high
            ),
            Expr::Like { expr, pattern, negated } => write!(
                f,
                "{} {}like '{}'",
                expr,
                if *negated { "not " } else { "" },
                pattern.replace('\'', "''")
            ),
            Expr::Nested(inner) => write!(f, "({})", inner),
        }
    }
}

impl fmt::Display for SelectColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectColumn::Wildcard => f.write_str("*"),
            SelectColumn::Column(c) => f.write_str(c),
            SelectColumn::Aliased { column, alias } => write!(f, "{} as {}", column, alias),
        }
    }
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.func.name(), self.column.as_deref().unwrap_or("*"))?;
        if let Some(alias) = &self.alias {
            write!(f, " as {}", alias)?;
        }
        Ok(())
    }
}

fn render_value(v: &Value) -> String {
    LiteralValue::from_json(v.clone()).to_string()
}

/// Renders lowercase SQL in the shape a query builder emits. Used for
/// logging and by backends that record executed statements.
impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.method {
            Method::Select | Method::First => {
                let mut projection: Vec<String> =
                    self.columns().iter().map(|c| c.to_string()).collect();
                projection.extend(self.aggregates().map(|a| a.to_string()));
                if projection.is_empty() {
                    projection.push("*".into());
                }
                write!(f, "select {} from {}", projection.join(", "), self.table)?;
                for join in self.joins() {
                    match join.kind {
                        JoinKind::Cross => write!(f, " {} {}", join.kind.keyword(), join.table)?,
                        _ => write!(
                            f,
                            " {} {} on {} = {}",
                            join.kind.keyword(),
                            join.table,
                            join.left,
                            join.right
                        )?,
                    }
                }
                if let Some(filter) = self.filter() {
                    write!(f, " where {}", filter)?;
                }
                let order: Vec<String> = self
                    .order_by()
                    .map(|o| format!("{} {}", o.column, if o.ascending { "asc" } else { "desc" }))
                    .collect();
                if !order.is_empty() {
                    write!(f, " order by {}", order.join(", "))?;
                }
                let limit = if self.method == Method::First { Some(1) } else { self.limit };
                if let Some(limit) = limit {
                    write!(f, " limit {}", limit)?;
                }
                if let Some(offset) = self.offset {
                    write!(f, " offset {}", offset)?;
                }
                if let Some(clause) = self.lock.and_then(|l| l.clause()) {
                    write!(f, " {}", clause)?;
                }
                Ok(())
            }
            Method::Insert => {
                let mut columns: Vec<&String> = Vec::new();
                for row in &self.values {
                    for key in row.keys() {
                        if !columns.contains(&key) {
                            columns.push(key);
                        }
                    }
                }
                let names: Vec<&str> = columns.iter().map(|c| c.as_str()).collect();
                let rows: Vec<String> = self
                    .values
                    .iter()
                    .map(|row| {
                        let vals: Vec<String> = columns
                            .iter()
                            .map(|c| row.get(*c).map(render_value).unwrap_or_else(|| "default".into()))
                            .collect();
                        format!("({})", vals.join(", "))
                    })
                    .collect();
                write!(f, "insert into {} ({}) values {}", self.table, names.join(", "), rows.join(", "))
            }
            Method::Update => {
                let sets: Vec<String> = self
                    .assignments
                    .iter()
                    .map(|a| format!("{} = {}", a.column, a.value))
                    .collect();
                write!(f, "update {} set {}", self.table, sets.join(", "))?;
                if let Some(filter) = self.filter() {
                    write!(f, " where {}", filter)?;
                }
                Ok(())
            }
            Method::Delete => {
                write!(f, "delete from {}", self.table)?;
                if let Some(filter) = self.filter() {
                    write!(f, " where {}", filter)?;
                }
                Ok(())
            }
            Method::Truncate => write!(f, "truncate {}", self.table),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_select_with_lock() {
        let mut stmt = Statement::new("tb_user");
        stmt.clauses.push(Clause::Columns(vec![SelectColumn::Column("name".into())]));
        stmt.clauses.push(Clause::Where(Expr::binary(
            Expr::column("uid"),
            BinaryOperator::Eq,
            Expr::value(1),
        )));
        stmt.lock = Some(RowLockLevel::ForShare);

        assert_eq!(stmt.to_string(), "select name from tb_user where uid = 1 for share");
    }

    #[test]
    fn test_decided_no_lock_renders_nothing() {
        let mut stmt = Statement::new("tb_user");
        stmt.lock = Some(RowLockLevel::None);
        assert_eq!(stmt.to_string(), "select * from tb_user");
    }

    #[test]
    fn test_render_update_and_insert() {
        let mut update = Statement::new("tb_user");
        update.method = Method::Update;
        update.assignments.push(Assignment {
            column: "name".into(),
            value: Expr::value("O'Brien"),
        });
        assert_eq!(update.to_string(), "update tb_user set name = 'O''Brien'");

        let mut insert = Statement::new("tb_user");
        insert.method = Method::Insert;
        insert.values.push(json!({"uid": 3, "name": "carol"}).as_object().unwrap().clone());
        assert_eq!(insert.to_string(), "insert into tb_user (name, uid) values ('carol', 3)");
    }

    #[test]
    fn test_filter_combines_where_clauses() {
        let mut stmt = Statement::new("t");
        stmt.clauses.push(Clause::Where(Expr::binary(Expr::column("a"), BinaryOperator::Eq, Expr::value(1))));
        stmt.clauses.push(Clause::Where(Expr::binary(Expr::column("b"), BinaryOperator::Gt, Expr::value(2))));
        assert_eq!(stmt.filter().unwrap().to_string(), "a = 1 and b > 2");
    }

    #[test]
    fn test_try_map_columns_reports_first_failure() {
        let expr = Expr::binary(Expr::column("a"), BinaryOperator::And, Expr::column("b"));
        let res: Result<Expr, String> = expr.try_map_columns(&mut |c| {
            if c == "b" { Err(format!("bad {}", c)) } else { Ok(format!("t.{}", c)) }
        });
        assert_eq!(res.unwrap_err(), "bad b");
    }
}
