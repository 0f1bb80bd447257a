//! Raw SQL parser.
//!
//! Converts SQL strings to the statement model using sqlparser, so raw
//! statements flow through the same interception as built ones.

use serde_json::Value;
use sqlparser::ast as sp;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser as SqlParser;

use super::ast::*;
use super::error::{ParseError, ParseResult};
use crate::types::RowLockLevel;

/// SQL parser for raw statements.
pub struct Parser;

impl Parser {
    /// Parse a SQL string into a statement.
    pub fn parse(sql: &str) -> ParseResult<Statement> {
        let sql = sql.trim().trim_end_matches(';').trim();
        if sql.is_empty() {
            return Err(ParseError::EmptyQuery);
        }

        // TRUNCATE dialect variations are not worth routing through sqlparser
        if let Some(rest) = strip_keyword(sql, "truncate") {
            let table = strip_keyword(rest, "table").unwrap_or(rest);
            if table.is_empty() || table.contains(char::is_whitespace) {
                return Err(ParseError::InvalidIdentifier(table.to_string()));
            }
            let mut stmt = Statement::new(table);
            stmt.method = Method::Truncate;
            return Ok(stmt);
        }

        let dialect = GenericDialect {};
        let statements = SqlParser::parse_sql(&dialect, sql)?;

        if statements.is_empty() {
            return Err(ParseError::EmptyQuery);
        }
        if statements.len() > 1 {
            return Err(ParseError::MultipleStatements);
        }

        Self::convert_statement(&statements[0])
    }

    fn convert_statement(stmt: &sp::Statement) -> ParseResult<Statement> {
        match stmt {
            sp::Statement::Query(query) => Self::convert_query(query),
            sp::Statement::Insert(insert) => Self::convert_insert(insert),
            sp::Statement::Update { table, assignments, selection, .. } => {
                Self::convert_update(table, assignments, selection)
            }
            sp::Statement::Delete(delete) => Self::convert_delete(delete),
            other => Err(ParseError::UnsupportedStatement(format!("{:?}", other))),
        }
    }

    fn convert_query(query: &sp::Query) -> ParseResult<Statement> {
        let select = match query.body.as_ref() {
            sp::SetExpr::Select(s) => s,
            other => {
                return Err(ParseError::UnsupportedStatement(format!(
                    "Unsupported query type: {:?}",
                    other
                )))
            }
        };

        if select.from.len() != 1 {
            return Err(ParseError::UnsupportedStatement(
                "Exactly one table in FROM required".into(),
            ));
        }
        let mut stmt = Statement::new(Self::extract_from_table(&select.from[0])?);

        let (columns, aggregates) = Self::convert_projection(&select.projection)?;
        let wildcard_only = matches!(columns.as_slice(), [SelectColumn::Wildcard]);
        if !columns.is_empty() && !wildcard_only {
            stmt.clauses.push(Clause::Columns(columns));
        }
        stmt.clauses.extend(aggregates.into_iter().map(Clause::Aggregate));

        if let Some(selection) = &select.selection {
            stmt.clauses.push(Clause::Where(Self::convert_expr(selection)?));
        }

        if let Some(ob) = &query.order_by {
            if let sp::OrderByKind::Expressions(exprs) = &ob.kind {
                for expr in exprs {
                    stmt.clauses.push(Clause::OrderBy(Self::convert_order_by_expr(expr)?));
                }
            }
        }

        stmt.limit = query.limit.as_ref().and_then(Self::expr_to_usize);
        stmt.offset = query.offset.as_ref().and_then(|o| Self::expr_to_usize(&o.value));

        if let Some(lock) = query.locks.first() {
            let skip_locked = matches!(lock.nonblock, Some(sp::NonBlock::SkipLocked));
            stmt.lock = Some(match (&lock.lock_type, skip_locked) {
                (sp::LockType::Share, false) => RowLockLevel::ForShare,
                (sp::LockType::Share, true) => RowLockLevel::ForShareSkipLocked,
                (sp::LockType::Update, false) => RowLockLevel::ForUpdate,
                (sp::LockType::Update, true) => RowLockLevel::ForUpdateSkipLocked,
            });
        }

        Ok(stmt)
    }

    fn convert_projection(
        items: &[sp::SelectItem],
    ) -> ParseResult<(Vec<SelectColumn>, Vec<Aggregate>)> {
        let mut columns = Vec::new();
        let mut aggregates = Vec::new();

        for item in items {
            match item {
                sp::SelectItem::Wildcard(_) => columns.push(SelectColumn::Wildcard),
                sp::SelectItem::UnnamedExpr(sp::Expr::Function(func)) => {
                    aggregates.push(Self::convert_aggregate(func, None)?);
                }
                sp::SelectItem::UnnamedExpr(expr) => {
                    columns.push(SelectColumn::Column(Self::column_name(expr)?));
                }
                sp::SelectItem::ExprWithAlias { expr: sp::Expr::Function(func), alias } => {
                    aggregates.push(Self::convert_aggregate(func, Some(alias.value.clone()))?);
                }
                sp::SelectItem::ExprWithAlias { expr, alias } => {
                    columns.push(SelectColumn::Aliased {
                        column: Self::column_name(expr)?,
                        alias: alias.value.clone(),
                    });
                }
                sp::SelectItem::QualifiedWildcard(name, _) => {
                    return Err(ParseError::UnsupportedExpression(format!(
                        "Qualified wildcard: {:?}",
                        name
                    )))
                }
            }
        }

        Ok((columns, aggregates))
    }

    fn convert_aggregate(func: &sp::Function, alias: Option<String>) -> ParseResult<Aggregate> {
        let name = func.name.to_string();
        let agg = AggregateFunc::from_name(&name)
            .ok_or_else(|| ParseError::UnsupportedExpression(format!("function {}", name)))?;

        let column = match &func.args {
            sp::FunctionArguments::List(list) => match list.args.as_slice() {
                [sp::FunctionArg::Unnamed(sp::FunctionArgExpr::Wildcard)] => None,
                [sp::FunctionArg::Unnamed(sp::FunctionArgExpr::Expr(e))] => {
                    Some(Self::column_name(e)?)
                }
                _ => {
                    return Err(ParseError::UnsupportedExpression(format!(
                        "arguments of {}",
                        name
                    )))
                }
            },
            _ => None,
        };

        Ok(Aggregate { func: agg, column, alias })
    }

    fn column_name(expr: &sp::Expr) -> ParseResult<String> {
        match Self::convert_expr(expr)? {
            Expr::Column(name) => Ok(name),
            other => Err(ParseError::UnsupportedExpression(format!(
                "expected column, got {}",
                other
            ))),
        }
    }

    fn convert_order_by_expr(expr: &sp::OrderByExpr) -> ParseResult<OrderBy> {
        let column = Self::column_name(&expr.expr)?;
        let ascending = expr.options.asc.unwrap_or(true);
        Ok(OrderBy { column, ascending })
    }

    fn convert_insert(insert: &sp::Insert) -> ParseResult<Statement> {
        let mut stmt = Statement::new(Self::extract_table_from_object(&insert.table)?);
        stmt.method = Method::Insert;

        if insert.columns.is_empty() {
            return Err(ParseError::MissingClause("INSERT column list".into()));
        }
        let columns: Vec<String> = insert.columns.iter().map(|c| c.value.clone()).collect();

        let rows = match insert.source.as_ref().map(|s| s.body.as_ref()) {
            Some(sp::SetExpr::Values(sp::Values { rows, .. })) => rows,
            _ => {
                return Err(ParseError::UnsupportedStatement(
                    "INSERT ... SELECT not supported".into(),
                ))
            }
        };

        for row in rows {
            if row.len() != columns.len() {
                return Err(ParseError::Syntax(format!(
                    "expected {} values, got {}",
                    columns.len(),
                    row.len()
                )));
            }
            let mut values = Row::new();
            for (column, expr) in columns.iter().zip(row) {
                values.insert(column.clone(), Self::constant(&Self::convert_expr(expr)?)?);
            }
            stmt.values.push(values);
        }

        Ok(stmt)
    }

    fn constant(expr: &Expr) -> ParseResult<Value> {
        match expr {
            Expr::Literal(lit) => Ok(lit.to_json()),
            Expr::UnaryOp { op: UnaryOperator::Minus, expr } => match expr.as_ref() {
                Expr::Literal(LiteralValue::Integer(n)) => Ok(Value::from(-n)),
                Expr::Literal(LiteralValue::Float(n)) => Ok(LiteralValue::Float(-n).to_json()),
                other => Err(ParseError::UnsupportedExpression(format!("-{}", other))),
            },
            other => Err(ParseError::UnsupportedExpression(format!(
                "non-constant value: {}",
                other
            ))),
        }
    }

    fn convert_update(
        table: &sp::TableWithJoins,
        assignments: &[sp::Assignment],
        selection: &Option<sp::Expr>,
    ) -> ParseResult<Statement> {
        let mut stmt = Statement::new(Self::extract_from_table(table)?);
        stmt.method = Method::Update;

        stmt.assignments = assignments
            .iter()
            .map(|a| {
                let column = Self::extract_assignment_target(&a.target)?;
                let value = Self::convert_expr(&a.value)?;
                Ok(Assignment { column, value })
            })
            .collect::<ParseResult<Vec<_>>>()?;

        if let Some(selection) = selection {
            stmt.clauses.push(Clause::Where(Self::convert_expr(selection)?));
        }
        Ok(stmt)
    }

    fn extract_assignment_target(target: &sp::AssignmentTarget) -> ParseResult<String> {
        match target {
            sp::AssignmentTarget::ColumnName(parts) => Ok(parts
                .0
                .iter()
                .map(|p| p.as_ident().map(|id| id.value.clone()).unwrap_or_else(|| p.to_string()))
                .collect::<Vec<_>>()
                .join(".")),
            sp::AssignmentTarget::Tuple(_) => Err(ParseError::UnsupportedExpression(
                "tuple assignment".into(),
            )),
        }
    }

    fn convert_delete(delete: &sp::Delete) -> ParseResult<Statement> {
        let tables = match &delete.from {
            sp::FromTable::WithFromKeyword(tables) => tables,
            sp::FromTable::WithoutKeyword(tables) => tables,
        };

        if tables.len() != 1 {
            return Err(ParseError::UnsupportedStatement(
                "DELETE from multiple tables not supported".into(),
            ));
        }

        let mut stmt = Statement::new(Self::extract_from_table(&tables[0])?);
        stmt.method = Method::Delete;
        if let Some(selection) = &delete.selection {
            stmt.clauses.push(Clause::Where(Self::convert_expr(selection)?));
        }
        Ok(stmt)
    }

    fn convert_expr(expr: &sp::Expr) -> ParseResult<Expr> {
        match expr {
            sp::Expr::Identifier(id) => Ok(Expr::Column(id.value.clone())),

            sp::Expr::CompoundIdentifier(parts) => {
                if parts.is_empty() {
                    return Err(ParseError::InvalidIdentifier("empty compound identifier".into()));
                }
                Ok(Expr::Column(
                    parts.iter().map(|p| p.value.as_str()).collect::<Vec<_>>().join("."),
                ))
            }

            sp::Expr::Value(v) => Ok(Expr::Literal(Self::convert_value(v)?)),

            sp::Expr::BinaryOp { left, op, right } => Ok(Expr::BinaryOp {
                left: Box::new(Self::convert_expr(left)?),
                op: Self::convert_binary_op(op)?,
                right: Box::new(Self::convert_expr(right)?),
            }),

            sp::Expr::UnaryOp { op, expr } => Ok(Expr::UnaryOp {
                op: Self::convert_unary_op(op)?,
                expr: Box::new(Self::convert_expr(expr)?),
            }),

            sp::Expr::IsNull(e) => Ok(Expr::IsNull {
                expr: Box::new(Self::convert_expr(e)?),
                negated: false,
            }),

            sp::Expr::IsNotNull(e) => Ok(Expr::IsNull {
                expr: Box::new(Self::convert_expr(e)?),
                negated: true,
            }),

            sp::Expr::InList { expr, list, negated } => Ok(Expr::InList {
                expr: Box::new(Self::convert_expr(expr)?),
                list: list.iter().map(Self::convert_expr).collect::<ParseResult<Vec<_>>>()?,
                negated: *negated,
            }),

            sp::Expr::Between { expr, low, high, negated } => Ok(Expr::Between {
                expr: Box::new(Self::convert_expr(expr)?),
                low: Box::new(Self::convert_expr(low)?),
                high: Box::new(Self::convert_expr(high)?),
                negated: *negated,
            }),

            sp::Expr::Like { expr, pattern, negated, .. } => Ok(Expr::Like {
                expr: Box::new(Self::convert_expr(expr)?),
                pattern: Self::extract_string_from_expr(pattern)?,
                negated: *negated,
            }),

            sp::Expr::Nested(inner) => Ok(Expr::Nested(Box::new(Self::convert_expr(inner)?))),

            other => Err(ParseError::UnsupportedExpression(format!("{:?}", other))),
        }
    }

    fn convert_value(v: &sp::ValueWithSpan) -> ParseResult<LiteralValue> {
        match &v.value {
            sp::Value::Null => Ok(LiteralValue::Null),
            sp::Value::Boolean(b) => Ok(LiteralValue::Boolean(*b)),
            sp::Value::Number(s, _) => {
                if let Ok(i) = s.parse::<i64>() {
                    Ok(LiteralValue::Integer(i))
                } else if let Ok(f) = s.parse::<f64>() {
                    Ok(LiteralValue::Float(f))
                } else {
                    Err(ParseError::UnsupportedExpression(format!("Invalid number: {}", s)))
                }
            }
            sp::Value::SingleQuotedString(s) => Ok(LiteralValue::String(s.clone())),
            sp::Value::DoubleQuotedString(s) => Ok(LiteralValue::String(s.clone())),
            other => Err(ParseError::UnsupportedExpression(format!("Unsupported value: {:?}", other))),
        }
    }

    fn extract_string_from_expr(expr: &sp::Expr) -> ParseResult<String> {
        match expr {
            sp::Expr::Value(v) => match &v.value {
                sp::Value::SingleQuotedString(s) => Ok(s.clone()),
                sp::Value::DoubleQuotedString(s) => Ok(s.clone()),
                _ => Err(ParseError::UnsupportedExpression("expected string".into())),
            },
            _ => Err(ParseError::UnsupportedExpression("expected string literal".into())),
        }
    }

    fn convert_binary_op(op: &sp::BinaryOperator) -> ParseResult<BinaryOperator> {
        match op {
            sp::BinaryOperator::Eq => Ok(BinaryOperator::Eq),
            sp::BinaryOperator::NotEq => Ok(BinaryOperator::NotEq),
            sp::BinaryOperator::Lt => Ok(BinaryOperator::Lt),
            sp::BinaryOperator::LtEq => Ok(BinaryOperator::LtEq),
            sp::BinaryOperator::Gt => Ok(BinaryOperator::Gt),
            sp::BinaryOperator::GtEq => Ok(BinaryOperator::GtEq),
            sp::BinaryOperator::And => Ok(BinaryOperator::And),
            sp::BinaryOperator::Or => Ok(BinaryOperator::Or),
            sp::BinaryOperator::Plus => Ok(BinaryOperator::Plus),
            sp::BinaryOperator::Minus => Ok(BinaryOperator::Minus),
            sp::BinaryOperator::Multiply => Ok(BinaryOperator::Multiply),
            sp::BinaryOperator::Divide => Ok(BinaryOperator::Divide),
            sp::BinaryOperator::Modulo => Ok(BinaryOperator::Modulo),
            sp::BinaryOperator::StringConcat => Ok(BinaryOperator::Concat),
            other => Err(ParseError::UnsupportedExpression(format!(
                "Unsupported operator: {:?}",
                other
            ))),
        }
    }

    fn convert_unary_op(op: &sp::UnaryOperator) -> ParseResult<UnaryOperator> {
        match op {
            sp::UnaryOperator::Not => Ok(UnaryOperator::Not),
            sp::UnaryOperator::Minus => Ok(UnaryOperator::Minus),
            sp::UnaryOperator::Plus => Ok(UnaryOperator::Plus),
            other => Err(ParseError::UnsupportedExpression(format!(
                "Unsupported unary operator: {:?}",
                other
            ))),
        }
    }

    fn extract_table_name(name: &sp::ObjectName) -> ParseResult<String> {
        // Use just the table name, ignoring schema
        name.0
            .last()
            .map(|i| i.as_ident().map(|id| id.value.clone()).unwrap_or_else(|| i.to_string()))
            .ok_or_else(|| ParseError::InvalidIdentifier("empty table name".into()))
    }

    fn extract_table_from_object(table: &sp::TableObject) -> ParseResult<String> {
        match table {
            sp::TableObject::TableName(name) => Self::extract_table_name(name),
            sp::TableObject::TableFunction(_) => {
                Err(ParseError::UnsupportedStatement("table function not supported".into()))
            }
        }
    }

    fn extract_from_table(from: &sp::TableWithJoins) -> ParseResult<String> {
        if !from.joins.is_empty() {
            return Err(ParseError::UnsupportedStatement(
                "joins in raw SQL; use the builder join methods".into(),
            ));
        }
        match &from.relation {
            sp::TableFactor::Table { name, .. } => Self::extract_table_name(name),
            other => Err(ParseError::UnsupportedStatement(format!(
                "Unsupported FROM clause: {:?}",
                other
            ))),
        }
    }

    fn expr_to_usize(expr: &sp::Expr) -> Option<usize> {
        match expr {
            sp::Expr::Value(v) => match &v.value {
                sp::Value::Number(s, _) => s.parse().ok(),
                _ => None,
            },
            _ => None,
        }
    }
}

/// `s` without a leading ASCII keyword and the whitespace after it.
fn strip_keyword<'a>(s: &'a str, keyword: &str) -> Option<&'a str> {
    let head = s.get(..keyword.len())?;
    let rest = &s[keyword.len()..];
    if head.eq_ignore_ascii_case(keyword) && rest.starts_with(char::is_whitespace) {
        Some(rest.trim())
    } else {
        None
    }
}
