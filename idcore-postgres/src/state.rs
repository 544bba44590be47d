use crate::error::map_sqlx_error;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use idcore::{
    lease_deadline, EventStoreError, EventStoreResult, FailedEvent, HandlerStateStore, Operation, Sequence,
};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::time::Duration;

const FAILED_EVENT_COLUMNS: &str =
    "handler, failed_sequence, failure_count, last_error, skipped, last_failed_at";

/// Handler bookkeeping in the `projections` schema.
#[derive(Debug, Clone)]
pub struct PostgresHandlerStateStore {
    pool: PgPool,
}

impl PostgresHandlerStateStore {
    /// Uses an existing pool.
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn state_error(error: sqlx::Error) -> EventStoreError {
    map_sqlx_error(error, Operation::HandlerState)
}

fn decode_failed_event(row: &PgRow) -> Result<FailedEvent, sqlx::Error> {
    let failure_count: i32 = row.try_get("failure_count")?;
    Ok(FailedEvent {
        handler: row.try_get("handler")?,
        sequence: Sequence::from_i64(row.try_get("failed_sequence")?),
        failure_count: u32::try_from(failure_count).unwrap_or(0),
        last_error: row.try_get("last_error")?,
        skipped: row.try_get("skipped")?,
        last_failed_at: row.try_get("last_failed_at")?,
    })
}

#[async_trait]
impl HandlerStateStore for PostgresHandlerStateStore {
    async fn current_sequence(&self, handler: &str) -> EventStoreResult<Sequence> {
        let current: Option<i64> = sqlx::query_scalar(
            "SELECT current_sequence FROM projections.current_sequences WHERE handler = $1",
        )
        .bind(handler)
        .fetch_optional(&self.pool)
        .await
        .map_err(state_error)?;
        Ok(current.map_or_else(Sequence::zero, Sequence::from_i64))
    }

    async fn set_current_sequence(&self, handler: &str, sequence: Sequence) -> EventStoreResult<()> {
        let _ = sqlx::query(
            "INSERT INTO projections.current_sequences (handler, current_sequence) VALUES ($1, $2) \
             ON CONFLICT (handler) DO UPDATE SET current_sequence = \
             GREATEST(current_sequences.current_sequence, EXCLUDED.current_sequence)",
        )
        .bind(handler)
        .bind(sequence.as_i64())
        .execute(&self.pool)
        .await
        .map_err(state_error)?;
        Ok(())
    }

    async fn failed_event(&self, handler: &str, sequence: Sequence) -> EventStoreResult<Option<FailedEvent>> {
        let row = sqlx::query(&format!(
            "SELECT {FAILED_EVENT_COLUMNS} FROM projections.failed_events \
             WHERE handler = $1 AND failed_sequence = $2"
        ))
        .bind(handler)
        .bind(sequence.as_i64())
        .fetch_optional(&self.pool)
        .await
        .map_err(state_error)?;
        row.as_ref()
            .map(decode_failed_event)
            .transpose()
            .map_err(state_error)
    }

    async fn record_failure(
        &self,
        handler: &str,
        sequence: Sequence,
        error: &str,
        at: DateTime<Utc>,
    ) -> EventStoreResult<FailedEvent> {
        let row = sqlx::query(&format!(
            "INSERT INTO projections.failed_events \
             (handler, failed_sequence, failure_count, last_error, last_failed_at) \
             VALUES ($1, $2, 1, $3, $4) \
             ON CONFLICT (handler, failed_sequence) DO UPDATE SET \
             failure_count = failed_events.failure_count + 1, \
             last_error = EXCLUDED.last_error, \
             last_failed_at = EXCLUDED.last_failed_at \
             RETURNING {FAILED_EVENT_COLUMNS}"
        ))
        .bind(handler)
        .bind(sequence.as_i64())
        .bind(error)
        .bind(at)
        .fetch_one(&self.pool)
        .await
        .map_err(state_error)?;
        decode_failed_event(&row).map_err(state_error)
    }

    async fn mark_skipped(&self, handler: &str, sequence: Sequence) -> EventStoreResult<()> {
        let updated = sqlx::query(
            "UPDATE projections.failed_events SET skipped = TRUE \
             WHERE handler = $1 AND failed_sequence = $2",
        )
        .bind(handler)
        .bind(sequence.as_i64())
        .execute(&self.pool)
        .await
        .map_err(state_error)?;
        if updated.rows_affected() == 0 {
            return Err(EventStoreError::internal(
                Operation::HandlerState,
                format!("no failure recorded for {handler} at {sequence}"),
            ));
        }
        Ok(())
    }

    async fn failed_events(&self, handler: &str) -> EventStoreResult<Vec<FailedEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {FAILED_EVENT_COLUMNS} FROM projections.failed_events \
             WHERE handler = $1 ORDER BY failed_sequence"
        ))
        .bind(handler)
        .fetch_all(&self.pool)
        .await
        .map_err(state_error)?;
        rows.iter()
            .map(|row| decode_failed_event(row).map_err(state_error))
            .collect()
    }

    async fn record_run(&self, handler: &str, at: DateTime<Utc>) -> EventStoreResult<()> {
        let _ = sqlx::query(
            "INSERT INTO projections.current_sequences (handler, last_run) VALUES ($1, $2) \
             ON CONFLICT (handler) DO UPDATE SET last_run = EXCLUDED.last_run",
        )
        .bind(handler)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(state_error)?;
        Ok(())
    }

    async fn last_run(&self, handler: &str) -> EventStoreResult<Option<DateTime<Utc>>> {
        let last_run: Option<Option<DateTime<Utc>>> = sqlx::query_scalar(
            "SELECT last_run FROM projections.current_sequences WHERE handler = $1",
        )
        .bind(handler)
        .fetch_optional(&self.pool)
        .await
        .map_err(state_error)?;
        Ok(last_run.flatten())
    }

    async fn try_lock(
        &self,
        handler: &str,
        owner: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> EventStoreResult<bool> {
        let until = lease_deadline(now, lease)?;
        // The conditional upsert only touches a free, expired or own lock.
        let acquired = sqlx::query(
            "INSERT INTO projections.locks (handler, locker_id, locked_until) VALUES ($1, $2, $3) \
             ON CONFLICT (handler) DO UPDATE SET \
             locker_id = EXCLUDED.locker_id, locked_until = EXCLUDED.locked_until \
             WHERE locks.locker_id = EXCLUDED.locker_id OR locks.locked_until <= $4",
        )
        .bind(handler)
        .bind(owner)
        .bind(until)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(state_error)?;
        Ok(acquired.rows_affected() == 1)
    }

    async fn unlock(&self, handler: &str, owner: &str) -> EventStoreResult<()> {
        let _ = sqlx::query("DELETE FROM projections.locks WHERE handler = $1 AND locker_id = $2")
            .bind(handler)
            .bind(owner)
            .execute(&self.pool)
            .await
            .map_err(state_error)?;
        Ok(())
    }
}
