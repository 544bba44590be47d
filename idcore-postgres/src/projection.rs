use crate::error::{map_query_error, map_sqlx_error};
use crate::PostgresError;
use async_trait::async_trait;
use idcore::projection::sql::{render_search, render_statement, SqlStatement};
use idcore::projection::ColumnValue;
use idcore::query::{Row, SearchResult};
use idcore::{
    EventStoreResult, Operation, ProjectionReader, QueryError, QueryResult, SearchQuery,
    SearchRequest, Statement, StatementExecutor,
};
use serde_json::Value;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row as _};
use tracing::{instrument, trace};

/// Projection tables in PostgreSQL.
///
/// Statements render to SQL with `ON CONFLICT` and `sequence` guards, so a
/// replayed statement leaves the tables unchanged. All commands of one
/// statement run in one transaction.
#[derive(Debug, Clone)]
pub struct PostgresProjectionDb {
    pool: PgPool,
}

impl PostgresProjectionDb {
    /// Uses an existing pool.
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs a projection's DDL script.
    pub async fn create_tables(&self, ddl: &str) -> Result<(), PostgresError> {
        let _ = sqlx::raw_sql(ddl)
            .execute(&self.pool)
            .await
            .map_err(PostgresError::MigrationFailed)?;
        Ok(())
    }
}

fn bind(query: Query<'_, Postgres, PgArguments>, value: ColumnValue) -> Query<'_, Postgres, PgArguments> {
    match value {
        // Rendering inlines NULL; an argument can only be NULL inside a list.
        ColumnValue::Null => query.bind(None::<String>),
        ColumnValue::Bool(value) => query.bind(value),
        ColumnValue::Int(value) => query.bind(value),
        ColumnValue::Float(value) => query.bind(value),
        ColumnValue::Text(value) => query.bind(value),
        ColumnValue::Timestamp(value) => query.bind(value),
        ColumnValue::Json(value) => query.bind(Json(value)),
        ColumnValue::TextArray(values) => query.bind(values),
    }
}

fn prepare(statement: &SqlStatement) -> Query<'_, Postgres, PgArguments> {
    statement
        .args
        .iter()
        .cloned()
        .fold(sqlx::query(&statement.sql), bind)
}

#[async_trait]
impl StatementExecutor for PostgresProjectionDb {
    #[instrument(
        name = "postgres.execute",
        skip(self, statement),
        fields(sequence = %statement.sequence, aggregate_id = %statement.aggregate_id)
    )]
    async fn execute(&self, statement: &Statement) -> EventStoreResult<()> {
        let commands = render_statement(statement);
        if commands.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::BeginTransaction))?;
        for command in &commands {
            let result = prepare(command)
                .execute(&mut *tx)
                .await
                .map_err(|error| map_sqlx_error(error, Operation::Execute))?;
            trace!(sql = %command.sql, rows = result.rows_affected(), "statement applied");
        }
        tx.commit()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::CommitTransaction))
    }
}

#[async_trait]
impl ProjectionReader for PostgresProjectionDb {
    #[instrument(name = "postgres.search", skip(self, request, queries))]
    async fn search(
        &self,
        table: &str,
        request: &SearchRequest,
        queries: &[SearchQuery],
    ) -> QueryResult<SearchResult> {
        let sql = render_search(table, request, queries)?;

        let count: i64 = prepare(&sql.count)
            .fetch_one(&self.pool)
            .await
            .and_then(|row| row.try_get(0))
            .map_err(map_query_error)?;

        let documents = prepare(&sql.select)
            .fetch_all(&self.pool)
            .await
            .map_err(map_query_error)?;
        let rows = documents
            .iter()
            .map(|document| {
                let Json(value): Json<Value> = document.try_get(0).map_err(map_query_error)?;
                match value {
                    Value::Object(row) => Ok::<Row, QueryError>(row),
                    other => Err(QueryError::Internal(format!("row is not an object: {other}"))),
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(SearchResult {
            count: u64::try_from(count).unwrap_or(0),
            rows,
        })
    }
}
