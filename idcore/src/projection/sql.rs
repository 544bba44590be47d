//! SQL rendering of statements and searches.
//!
//! Produces PostgreSQL text with `$n` placeholders and the typed arguments to
//! bind. Table and column names come from code and are validated as plain
//! identifiers before they are interpolated.

use super::statement::{Column, ColumnValue, Condition, Statement, StatementKind, CREATION_DATE, SEQUENCE};
use crate::errors::{QueryError, QueryResult};
use crate::query::{SearchQuery, SearchRequest, TextComparison};
use crate::types::Sequence;

/// One SQL command and its arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlStatement {
    /// SQL text with `$1`, `$2`, ... placeholders.
    pub sql: String,
    /// Arguments in placeholder order.
    pub args: Vec<ColumnValue>,
}

#[derive(Default)]
struct Args(Vec<ColumnValue>);

impl Args {
    // NULL is inlined: a bound NULL would carry a parameter type that may not
    // match the target column.
    fn push(&mut self, value: ColumnValue) -> String {
        if value == ColumnValue::Null {
            return "NULL".to_string();
        }
        self.0.push(value);
        format!("${}", self.0.len())
    }
}

/// Whether `name` is a plain, optionally schema-qualified identifier.
pub fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').all(|part| {
            let mut chars = part.chars();
            chars
                .next()
                .is_some_and(|first| first.is_ascii_lowercase() || first == '_')
                && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        })
}

/// Renders a statement into the commands to execute, in order.
///
/// `NoOp` renders to nothing.
pub fn render_statement(statement: &Statement) -> Vec<SqlStatement> {
    let mut rendered = Vec::new();
    render_kind(&statement.kind, statement.sequence, &mut rendered);
    rendered
}

fn render_kind(kind: &StatementKind, sequence: Sequence, out: &mut Vec<SqlStatement>) {
    match kind {
        StatementKind::Create {
            table,
            key_columns,
            columns,
        } => out.push(render_insert(table, key_columns, columns, None)),
        StatementKind::Upsert {
            table,
            key_columns,
            columns,
        } => {
            let updated: Vec<&str> = columns
                .iter()
                .map(|column| column.name.as_str())
                .filter(|name| *name != CREATION_DATE && !key_columns.iter().any(|key| key == name))
                .collect();
            out.push(render_insert(table, key_columns, columns, Some(&updated)));
        }
        StatementKind::Update {
            table,
            values,
            conditions,
        } => {
            let mut args = Args::default();
            let names: Vec<&str> = values.iter().map(|column| column.name.as_str()).collect();
            let placeholders: Vec<String> = values
                .iter()
                .map(|column| args.push(column.value.clone()))
                .collect();
            let mut filters = render_conditions(conditions, &mut args);
            filters.push(format!("({SEQUENCE} < {})", args.push(sequence.into())));
            out.push(SqlStatement {
                sql: format!(
                    "UPDATE {table} SET {} WHERE {}",
                    render_assignment(&names, &placeholders),
                    filters.join(" AND ")
                ),
                args: args.0,
            });
        }
        StatementKind::Delete { table, conditions } => {
            let mut args = Args::default();
            let filters = render_conditions(conditions, &mut args);
            let sql = if filters.is_empty() {
                format!("DELETE FROM {table}")
            } else {
                format!("DELETE FROM {table} WHERE {}", filters.join(" AND "))
            };
            out.push(SqlStatement { sql, args: args.0 });
        }
        StatementKind::NoOp => {}
        StatementKind::Multi(kinds) => {
            for kind in kinds {
                render_kind(kind, sequence, out);
            }
        }
    }
}

fn render_insert(
    table: &str,
    key_columns: &[String],
    columns: &[Column],
    update_columns: Option<&[&str]>,
) -> SqlStatement {
    let mut args = Args::default();
    let names: Vec<&str> = columns.iter().map(|column| column.name.as_str()).collect();
    let placeholders: Vec<String> = columns
        .iter()
        .map(|column| args.push(column.value.clone()))
        .collect();
    let conflict = match update_columns {
        Some(updated) if !updated.is_empty() => {
            let excluded: Vec<String> = updated.iter().map(|name| format!("EXCLUDED.{name}")).collect();
            format!(
                "DO UPDATE SET {} WHERE p.{SEQUENCE} < EXCLUDED.{SEQUENCE}",
                render_assignment(updated, &excluded)
            )
        }
        _ => "DO NOTHING".to_string(),
    };

    SqlStatement {
        sql: format!(
            "INSERT INTO {table} AS p ({}) VALUES ({}) ON CONFLICT ({}) {conflict}",
            names.join(", "),
            placeholders.join(", "),
            key_columns.join(", ")
        ),
        args: args.0,
    }
}

fn render_assignment<N: AsRef<str>, V: AsRef<str>>(names: &[N], values: &[V]) -> String {
    if names.len() == 1 {
        return format!("{} = {}", names[0].as_ref(), values[0].as_ref());
    }
    let names: Vec<&str> = names.iter().map(AsRef::as_ref).collect();
    let values: Vec<&str> = values.iter().map(AsRef::as_ref).collect();
    format!("({}) = ({})", names.join(", "), values.join(", "))
}

fn render_conditions(conditions: &[Condition], args: &mut Args) -> Vec<String> {
    conditions
        .iter()
        .map(|condition| match &condition.value {
            ColumnValue::Null => format!("({} IS NULL)", condition.column),
            value => format!("({} = {})", condition.column, args.push(value.clone())),
        })
        .collect()
}

/// The two commands of a search.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchSql {
    /// Returns one `row_to_json` document per row of the requested page.
    pub select: SqlStatement,
    /// Counts every matching row.
    pub count: SqlStatement,
}

/// Renders a search over `table`.
///
/// # Errors
///
/// [`QueryError::InvalidQuery`] if the table, the sort column or a filtered
/// column is not a plain identifier.
pub fn render_search(
    table: &str,
    request: &SearchRequest,
    queries: &[SearchQuery],
) -> QueryResult<SearchSql> {
    let invalid = std::iter::once(table)
        .chain(request.sort_column.as_deref())
        .chain(queries.iter().flat_map(SearchQuery::columns))
        .find(|name| !is_identifier(name));
    if let Some(name) = invalid {
        return Err(QueryError::InvalidQuery(format!("invalid identifier {name:?}")));
    }

    let mut args = Args::default();
    let filters: Vec<String> = queries
        .iter()
        .map(|query| render_query(query, &mut args))
        .collect();
    let where_clause = if filters.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", filters.join(" AND "))
    };
    let count = SqlStatement {
        sql: format!("SELECT COUNT(*) FROM {table} AS p{where_clause}"),
        args: args.0.clone(),
    };

    let mut select = format!("SELECT row_to_json(p) FROM {table} AS p{where_clause}");
    if let Some(column) = &request.sort_column {
        let direction = if request.asc { "ASC" } else { "DESC" };
        select.push_str(&format!(" ORDER BY p.{column} {direction}"));
    }
    if request.limit > 0 {
        let placeholder = args.push(ColumnValue::Int(i64::try_from(request.limit).unwrap_or(i64::MAX)));
        select.push_str(&format!(" LIMIT {placeholder}"));
    }
    if request.offset > 0 {
        let placeholder = args.push(ColumnValue::Int(i64::try_from(request.offset).unwrap_or(i64::MAX)));
        select.push_str(&format!(" OFFSET {placeholder}"));
    }

    Ok(SearchSql {
        select: SqlStatement {
            sql: select,
            args: args.0,
        },
        count,
    })
}

fn render_query(query: &SearchQuery, args: &mut Args) -> String {
    match query {
        SearchQuery::Text {
            column,
            value,
            comparison,
        } => render_text(column, value, *comparison, args),
        SearchQuery::Number {
            column,
            value,
            comparison,
        } => format!(
            "(p.{column} {} {})",
            comparison.operator(),
            args.push(ColumnValue::Int(*value))
        ),
        SearchQuery::Bool { column, value } => {
            format!("(p.{column} = {})", args.push(ColumnValue::Bool(*value)))
        }
        SearchQuery::List { column, values } => {
            if values.is_empty() {
                return "FALSE".to_string();
            }
            let placeholders: Vec<String> = values.iter().map(|value| args.push(value.clone())).collect();
            format!("(p.{column} IN ({}))", placeholders.join(", "))
        }
        SearchQuery::Or(queries) => render_group(queries, " OR ", "FALSE", args),
        SearchQuery::And(queries) => render_group(queries, " AND ", "TRUE", args),
    }
}

fn render_group(queries: &[SearchQuery], separator: &str, empty: &str, args: &mut Args) -> String {
    if queries.is_empty() {
        return empty.to_string();
    }
    let parts: Vec<String> = queries.iter().map(|query| render_query(query, args)).collect();
    format!("({})", parts.join(separator))
}

fn render_text(column: &str, value: &str, comparison: TextComparison, args: &mut Args) -> String {
    let escaped = escape_like(value);
    let (operator, pattern) = match comparison {
        TextComparison::Equals => ("=", value.to_string()),
        TextComparison::NotEquals => ("<>", value.to_string()),
        TextComparison::EqualsIgnoreCase => ("ILIKE", escaped),
        TextComparison::StartsWith => ("LIKE", format!("{escaped}%")),
        TextComparison::StartsWithIgnoreCase => ("ILIKE", format!("{escaped}%")),
        TextComparison::EndsWith => ("LIKE", format!("%{escaped}")),
        TextComparison::EndsWithIgnoreCase => ("ILIKE", format!("%{escaped}")),
        TextComparison::Contains => ("LIKE", format!("%{escaped}%")),
        TextComparison::ContainsIgnoreCase => ("ILIKE", format!("%{escaped}%")),
    };
    format!("(p.{column} {operator} {})", args.push(ColumnValue::Text(pattern)))
}

fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}
