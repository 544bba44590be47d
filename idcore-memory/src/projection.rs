use async_trait::async_trait;
use idcore::projection::sql::is_identifier;
use idcore::projection::{Column, Condition, CREATION_DATE, SEQUENCE};
use idcore::query::{Row, SearchResult};
use idcore::{
    EventStoreResult, ProjectionReader, QueryError, QueryResult, SearchQuery, SearchRequest,
    Statement, StatementExecutor, StatementKind,
};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

type Tables = HashMap<String, Vec<Row>>;

/// Projection tables held in memory.
///
/// Rows are JSON objects shaped like the `row_to_json` output of the
/// Postgres backend, so queries and row mapping behave the same on both.
#[derive(Debug, Clone, Default)]
pub struct InMemoryProjectionDb {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryProjectionDb {
    /// Creates an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every row of `table`, in insertion order.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables.read().get(table).cloned().unwrap_or_default()
    }
}

fn to_row(columns: &[Column]) -> Row {
    columns
        .iter()
        .map(|column| (column.name.clone(), column.value.to_json()))
        .collect()
}

fn row_sequence(row: &Row) -> u64 {
    row.get(SEQUENCE).and_then(Value::as_u64).unwrap_or(0)
}

fn matches_conditions(row: &Row, conditions: &[Condition]) -> bool {
    conditions.iter().all(|condition| {
        let expected = condition.value.to_json();
        match row.get(&condition.column) {
            None => expected.is_null(),
            Some(actual) => *actual == expected,
        }
    })
}

fn key_of<'a>(row: &'a Row, key_columns: &[String]) -> Vec<Option<&'a Value>> {
    key_columns.iter().map(|column| row.get(column)).collect()
}

fn apply(tables: &mut Tables, kind: &StatementKind, sequence: u64) {
    match kind {
        StatementKind::Create {
            table,
            key_columns,
            columns,
        } => {
            let row = to_row(columns);
            let rows = tables.entry(table.clone()).or_default();
            let key = key_of(&row, key_columns);
            if rows.iter().any(|existing| key_of(existing, key_columns) == key) {
                trace!(table = %table, "row exists, create skipped");
                return;
            }
            rows.push(row);
        }
        StatementKind::Upsert {
            table,
            key_columns,
            columns,
        } => {
            let row = to_row(columns);
            let rows = tables.entry(table.clone()).or_default();
            let key = key_of(&row, key_columns);
            let Some(index) = rows
                .iter()
                .position(|existing| key_of(existing, key_columns) == key)
            else {
                rows.push(row);
                return;
            };
            let existing = &mut rows[index];
            if row_sequence(existing) >= sequence {
                trace!(table = %table, "row is newer, upsert skipped");
                return;
            }
            for (name, value) in row {
                if name != CREATION_DATE && !key_columns.contains(&name) {
                    let _ = existing.insert(name, value);
                }
            }
        }
        StatementKind::Update {
            table,
            values,
            conditions,
        } => {
            let Some(rows) = tables.get_mut(table) else {
                return;
            };
            for row in rows
                .iter_mut()
                .filter(|row| matches_conditions(row, conditions) && row_sequence(row) < sequence)
            {
                for column in values {
                    let _ = row.insert(column.name.clone(), column.value.to_json());
                }
            }
        }
        StatementKind::Delete { table, conditions } => {
            if let Some(rows) = tables.get_mut(table) {
                rows.retain(|row| !matches_conditions(row, conditions));
            }
        }
        StatementKind::NoOp => {}
        StatementKind::Multi(kinds) => {
            for kind in kinds {
                apply(tables, kind, sequence);
            }
        }
    }
}

#[async_trait]
impl StatementExecutor for InMemoryProjectionDb {
    async fn execute(&self, statement: &Statement) -> EventStoreResult<()> {
        let sequence = statement.sequence.into_inner();
        let mut tables = self.tables.write();
        apply(&mut tables, &statement.kind, sequence);
        Ok(())
    }
}

#[async_trait]
impl ProjectionReader for InMemoryProjectionDb {
    async fn search(
        &self,
        table: &str,
        request: &SearchRequest,
        queries: &[SearchQuery],
    ) -> QueryResult<SearchResult> {
        let columns = queries
            .iter()
            .flat_map(SearchQuery::columns)
            .chain(request.sort_column.as_deref());
        if let Some(invalid) = std::iter::once(table)
            .chain(columns)
            .find(|name| !is_identifier(name))
        {
            return Err(QueryError::InvalidQuery(format!("invalid identifier `{invalid}`")));
        }

        let mut rows: Vec<Row> = self
            .tables
            .read()
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| queries.iter().all(|query| query.matches(row)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        let count = u64::try_from(rows.len()).unwrap_or(u64::MAX);
        request.apply(&mut rows);

        Ok(SearchResult { count, rows })
    }
}
