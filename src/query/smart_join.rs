//! Joins written as `table.column` pairs, and the alias rewrite that lets
//! callers keep using bare column names across joined tables.

use std::collections::HashMap;

use crate::db::DbDict;
use crate::query::error::{QueryError, QueryResult};
use crate::query::paging::PagingRole;
use crate::sql::{Clause, Join, JoinKind, SelectColumn, Statement};

/// Split `table.column`.
pub fn split_scoped_column(token: &str) -> QueryResult<(&str, &str)> {
    match token.trim().split_once('.') {
        Some((table, column))
            if !table.is_empty() && !column.is_empty() && !column.contains('.') =>
        {
            Ok((table, column))
        }
        _ => Err(QueryError::InvalidScopedColumn(token.to_string())),
    }
}

/// Append a join between `left` and `right`, both `table.column`.
///
/// The joined table is whichever side is not the statement's base table.
/// Both tables are recorded in `tables_join`, base table first.
pub fn smart_join(
    stmt: &mut Statement,
    tables_join: &mut Vec<String>,
    kind: JoinKind,
    left: &str,
    right: &str,
) -> QueryResult<()> {
    let (left_table, _) = split_scoped_column(left)?;
    let (right_table, _) = split_scoped_column(right)?;

    let joined = if right_table == stmt.table { left_table } else { right_table };

    for table in [stmt.table.as_str(), left_table, right_table] {
        if !tables_join.iter().any(|t| t == table) {
            tables_join.push(table.to_string());
        }
    }

    stmt.clauses.push(Clause::Join(Join {
        kind,
        table: joined.to_string(),
        left: left.trim().to_string(),
        right: right.trim().to_string(),
    }));
    Ok(())
}

/// `(alias, table.column)` for every column of the joined tables, in
/// table order. The alias is the bare column when no other joined table
/// has it, `{table}_{column}` otherwise.
pub fn column_mapping(dict: &DbDict, tables_join: &[String]) -> Vec<(String, String)> {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    for table in tables_join {
        for column in dict.columns(table).unwrap_or_default() {
            *seen.entry(column.as_str()).or_default() += 1;
        }
    }

    let mut mapping = Vec::new();
    for table in tables_join {
        for column in dict.columns(table).unwrap_or_default() {
            let alias = if seen.get(column.as_str()).copied().unwrap_or(0) > 1 {
                format!("{}_{}", table, column)
            } else {
                column.clone()
            };
            mapping.push((alias, format!("{}.{}", table, column)));
        }
    }
    mapping
}

/// Rewrite projection and filters of a joined read against the dictionary.
///
/// Returns false when nothing applied: not a read, fewer than two tables
/// in the dictionary, or no join.
pub fn resolve_column_aliases(
    stmt: &mut Statement,
    dict: &DbDict,
    tables_join: &[String],
    role: PagingRole,
) -> bool {
    if !stmt.method.is_read() || dict.table_count() < 2 || tables_join.is_empty() {
        return false;
    }

    let mapping = column_mapping(dict, tables_join);
    let by_alias: HashMap<&str, &str> = mapping.iter().map(|(a, q)| (a.as_str(), q.as_str())).collect();
    let by_qualified: HashMap<&str, &str> = mapping.iter().map(|(a, q)| (q.as_str(), a.as_str())).collect();

    // first joined table holding a bare column
    let owner = |column: &str| -> Option<String> {
        tables_join
            .iter()
            .find(|t| dict.columns(t).is_some_and(|cols| cols.iter().any(|c| c == column)))
            .map(|t| format!("{}.{}", t, column))
    };
    let qualify = |name: &str| -> String {
        if name.contains('.') {
            return name.to_string();
        }
        by_alias
            .get(name)
            .map(|q| q.to_string())
            .or_else(|| owner(name))
            .unwrap_or_else(|| name.to_string())
    };

    if role != PagingRole::Counter {
        let wildcard = || -> Vec<SelectColumn> {
            mapping
                .iter()
                .map(|(alias, qualified)| SelectColumn::Aliased {
                    column: qualified.clone(),
                    alias: alias.clone(),
                })
                .collect()
        };

        let has_columns = stmt.clauses.iter().any(|c| matches!(c, Clause::Columns(_)));
        if !has_columns && !stmt.has_aggregate() {
            stmt.clauses.insert(0, Clause::Columns(wildcard()));
        } else {
            for clause in stmt.clauses.iter_mut() {
                let Clause::Columns(columns) = clause else { continue };
                let mut rewritten = Vec::with_capacity(columns.len());
                for column in columns.drain(..) {
                    match column {
                        SelectColumn::Wildcard => rewritten.extend(wildcard()),
                        SelectColumn::Column(name) => {
                            let alias = if name.contains('.') {
                                by_qualified
                                    .get(name.as_str())
                                    .map(|a| a.to_string())
                                    .unwrap_or_else(|| name.clone())
                            } else {
                                name.clone()
                            };
                            rewritten.push(SelectColumn::Aliased {
                                column: qualify(&name),
                                alias,
                            });
                        }
                        aliased => rewritten.push(aliased),
                    }
                }
                *columns = rewritten;
            }
        }
    }

    for clause in stmt.clauses.iter_mut() {
        match clause {
            Clause::Where(expr) => *expr = expr.map_columns(&mut |name| qualify(name)),
            Clause::OrderBy(order) => order.column = qualify(&order.column),
            _ => {}
        }
    }
    log::debug!("resolved column aliases over {}", tables_join.join(", "));
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::{BinaryOperator, Expr, Method};
    use crate::testing;

    fn joined() -> (Statement, Vec<String>) {
        let mut stmt = Statement::new("tb_user");
        let mut tables = Vec::new();
        smart_join(&mut stmt, &mut tables, JoinKind::Inner, "tb_user.uid", "tb_user_ext.uid").unwrap();
        (stmt, tables)
    }

    #[test]
    fn test_split_scoped_column() {
        assert_eq!(split_scoped_column("tb_user.uid").unwrap(), ("tb_user", "uid"));
        for bad in ["uid", ".uid", "tb_user.", "a.b.c"] {
            assert!(matches!(split_scoped_column(bad), Err(QueryError::InvalidScopedColumn(_))), "{}", bad);
        }
    }

    #[test]
    fn test_smart_join_records_participants() {
        let (stmt, tables) = joined();
        assert_eq!(tables, vec!["tb_user".to_string(), "tb_user_ext".to_string()]);
        let join = stmt.joins().next().unwrap();
        assert_eq!(join.table, "tb_user_ext");
        assert_eq!(join.kind, JoinKind::Inner);
    }

    #[test]
    fn test_column_mapping_prefixes_shared_columns() {
        let dict = testing::dict();
        let (_, tables) = joined();
        let mapping = column_mapping(&dict, &tables);

        assert!(mapping.contains(&("tb_user_uid".into(), "tb_user.uid".into())));
        assert!(mapping.contains(&("tb_user_ext_uid".into(), "tb_user_ext.uid".into())));
        assert!(mapping.contains(&("name".into(), "tb_user.name".into())));
        assert!(mapping.contains(&("age".into(), "tb_user_ext.age".into())));
    }

    #[test]
    fn test_wildcard_becomes_aliased_projection() {
        let dict = testing::dict();
        let (mut stmt, tables) = joined();
        stmt.clauses.push(Clause::Where(Expr::binary(
            Expr::column("uid"),
            BinaryOperator::Eq,
            Expr::value(1),
        )));

        assert!(resolve_column_aliases(&mut stmt, &dict, &tables, PagingRole::None));

        let sql = stmt.to_string();
        assert!(sql.contains("tb_user.name as name"), "{}", sql);
        assert!(sql.contains("tb_user_ext.uid as tb_user_ext_uid"), "{}", sql);
        // ambiguous bare column qualified with the base table
        assert!(sql.contains("where tb_user.uid = 1"), "{}", sql);
    }

    #[test]
    fn test_alias_in_filter_is_qualified() {
        let dict = testing::dict();
        let (mut stmt, tables) = joined();
        stmt.clauses.push(Clause::Columns(vec![SelectColumn::Column("name".into())]));
        stmt.clauses.push(Clause::Where(Expr::binary(
            Expr::column("tb_user_ext_uid"),
            BinaryOperator::Gt,
            Expr::value(1),
        )));

        resolve_column_aliases(&mut stmt, &dict, &tables, PagingRole::None);

        assert_eq!(
            stmt.columns(),
            vec![&SelectColumn::Aliased {
                column: "tb_user.name".into(),
                alias: "name".into()
            }]
        );
        assert!(stmt.to_string().contains("where tb_user_ext.uid > 1"));
    }

    #[test]
    fn test_counter_keeps_projection() {
        let dict = testing::dict();
        let (mut stmt, tables) = joined();

        assert!(resolve_column_aliases(&mut stmt, &dict, &tables, PagingRole::Counter));
        assert!(stmt.columns().is_empty());
    }

    #[test]
    fn test_skipped_without_join_or_for_writes() {
        let dict = testing::dict();
        let mut stmt = Statement::new("tb_user");
        assert!(!resolve_column_aliases(&mut stmt, &dict, &[], PagingRole::None));

        let (mut update, tables) = joined();
        update.method = Method::Update;
        assert!(!resolve_column_aliases(&mut update, &dict, &tables, PagingRole::None));

        let single = DbDict::new().with_table("tb_user", ["uid", "name"]);
        let (mut stmt, tables) = joined();
        assert!(!resolve_column_aliases(&mut stmt, &single, &tables, PagingRole::None));
    }
}
