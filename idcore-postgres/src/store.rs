use crate::error::map_sqlx_error;
use crate::{connect, migrate, PostgresConfig, PostgresError};
use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use idcore::{
    AggregateId, AggregateType, AggregateVersion, Clock, EditorUser, Event, EventQuery, EventStore,
    EventStoreError, EventStoreResult, EventType, EventWrites, Operation, ResourceOwner, Sequence,
    SharedClock, SubscriptionRegistry, UniqueConstraintAction,
};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Key of the transaction-scoped advisory lock serializing all pushes.
///
/// Sequences are `MAX + 1`; the lock keeps them gap free and lets the
/// version check and the constraint table see a stable state.
const PUSH_LOCK: i64 = 0x6964_636f_7265;

const EVENT_COLUMNS: &str = "sequence, previous_aggregate_sequence, aggregate_type, aggregate_id, \
     aggregate_version, resource_owner, event_type, creation_date, editor_user, payload";

#[derive(Debug, Clone, Copy, Default)]
struct Head {
    version: AggregateVersion,
    last_sequence: Sequence,
}

/// Event log stored in `eventstore.events`.
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
    registry: Arc<SubscriptionRegistry>,
    clock: SharedClock,
}

impl std::fmt::Debug for PostgresEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresEventStore")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl PostgresEventStore {
    /// Connects with the default pool configuration.
    pub async fn new(connection_string: &str) -> Result<Self, PostgresError> {
        Self::with_config(connection_string, &PostgresConfig::default()).await
    }

    /// Connects with a custom pool configuration.
    pub async fn with_config(
        connection_string: &str,
        config: &PostgresConfig,
    ) -> Result<Self, PostgresError> {
        Ok(Self::from_pool(connect(connection_string, config).await?))
    }

    /// Uses an existing pool, typically shared with the projection database
    /// and the handler state store.
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            registry: Arc::new(SubscriptionRegistry::new()),
            clock: idcore::clock::system_clock(),
        }
    }

    /// Publishes committed events to `registry`.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<SubscriptionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Replaces the clock that stamps `creation_date`.
    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Registry receiving committed events.
    pub fn registry(&self) -> Arc<SubscriptionRegistry> {
        Arc::clone(&self.registry)
    }

    /// The underlying pool.
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the engine's tables if missing.
    pub async fn migrate(&self) -> Result<(), PostgresError> {
        migrate(&self.pool).await
    }

    async fn commit(&self, writes: EventWrites) -> EventStoreResult<Vec<Event>> {
        let (expected_versions, pending) = writes.into_parts();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::BeginTransaction))?;

        let _ = sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(PUSH_LOCK)
            .execute(&mut *tx)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::Push))?;

        let mut heads = HashMap::with_capacity(expected_versions.len());
        for ((aggregate_type, aggregate_id), expected) in &expected_versions {
            let head = load_head(&mut tx, aggregate_type, aggregate_id).await?;
            if !expected.matches(head.version) {
                warn!(
                    aggregate_type = %aggregate_type,
                    aggregate_id = %aggregate_id,
                    expected = %expected,
                    actual = %head.version,
                    "[postgres.version_conflict] optimistic concurrency check failed"
                );
                return Err(EventStoreError::ConcurrencyConflict {
                    aggregate_type: aggregate_type.clone(),
                    aggregate_id: aggregate_id.clone(),
                    expected: expected.to_string(),
                    actual: head.version,
                });
            }
            let _ = heads.insert((aggregate_type.clone(), aggregate_id.clone()), head);
        }

        for constraint in pending.iter().flat_map(|event| &event.unique_constraints) {
            match constraint.action() {
                UniqueConstraintAction::Add => {
                    let inserted = sqlx::query(
                        "INSERT INTO eventstore.unique_constraints (unique_type, unique_field) \
                         VALUES ($1, $2) ON CONFLICT DO NOTHING",
                    )
                    .bind(constraint.unique_type())
                    .bind(constraint.unique_field())
                    .execute(&mut *tx)
                    .await
                    .map_err(|error| map_sqlx_error(error, Operation::Push))?;
                    if inserted.rows_affected() == 0 {
                        debug!(
                            unique_type = constraint.unique_type(),
                            unique_field = constraint.unique_field(),
                            "unique constraint violated"
                        );
                        return Err(EventStoreError::AlreadyExists {
                            unique_type: constraint.unique_type().to_string(),
                            message: constraint.error_message().to_string(),
                        });
                    }
                }
                UniqueConstraintAction::Remove => {
                    let _ = sqlx::query(
                        "DELETE FROM eventstore.unique_constraints \
                         WHERE unique_type = $1 AND unique_field = $2",
                    )
                    .bind(constraint.unique_type())
                    .bind(constraint.unique_field())
                    .execute(&mut *tx)
                    .await
                    .map_err(|error| map_sqlx_error(error, Operation::Push))?;
                }
            }
        }

        let last: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(sequence), 0) FROM eventstore.events")
            .fetch_one(&mut *tx)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::Push))?;
        let mut last_sequence = Sequence::from_i64(last);
        // Postgres keeps microseconds; returned events must equal what filter reads back.
        let creation_date = self.clock.now().trunc_subsecs(6);

        let mut committed = Vec::with_capacity(pending.len());
        for event in pending {
            let key = event.aggregate.key();
            let head = heads.entry(key).or_default();
            let sequence = last_sequence.next();
            let stored = Event {
                sequence,
                previous_aggregate_sequence: head.last_sequence,
                aggregate_type: event.aggregate.aggregate_type,
                aggregate_id: event.aggregate.aggregate_id,
                aggregate_version: head.version.next(),
                resource_owner: event.aggregate.resource_owner,
                event_type: event.event_type,
                creation_date,
                editor_user: event.editor_user,
                payload: event.payload,
            };
            insert_event(&mut tx, &stored).await?;
            *head = Head {
                version: stored.aggregate_version,
                last_sequence: sequence,
            };
            last_sequence = sequence;
            committed.push(stored);
        }

        tx.commit()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::CommitTransaction))?;
        Ok(committed)
    }
}

async fn load_head(
    tx: &mut Transaction<'_, Postgres>,
    aggregate_type: &AggregateType,
    aggregate_id: &AggregateId,
) -> EventStoreResult<Head> {
    let row = sqlx::query(
        "SELECT aggregate_version, sequence FROM eventstore.events \
         WHERE aggregate_type = $1 AND aggregate_id = $2 \
         ORDER BY sequence DESC LIMIT 1",
    )
    .bind(aggregate_type.as_ref())
    .bind(aggregate_id.as_ref())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|error| map_sqlx_error(error, Operation::Push))?;

    let Some(row) = row else {
        return Ok(Head::default());
    };
    let version: i64 = row
        .try_get("aggregate_version")
        .map_err(|error| map_sqlx_error(error, Operation::Push))?;
    let sequence: i64 = row
        .try_get("sequence")
        .map_err(|error| map_sqlx_error(error, Operation::Push))?;
    Ok(Head {
        version: AggregateVersion::new(u64::try_from(version).unwrap_or(0)),
        last_sequence: Sequence::from_i64(sequence),
    })
}

async fn insert_event(tx: &mut Transaction<'_, Postgres>, event: &Event) -> EventStoreResult<()> {
    let version = i64::try_from(event.aggregate_version.into_inner()).unwrap_or(i64::MAX);
    let _ = sqlx::query(
        "INSERT INTO eventstore.events (sequence, previous_aggregate_sequence, aggregate_type, \
         aggregate_id, aggregate_version, resource_owner, event_type, creation_date, editor_user, payload) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
    )
    .bind(event.sequence.as_i64())
    .bind(event.previous_aggregate_sequence.as_i64())
    .bind(event.aggregate_type.as_ref())
    .bind(event.aggregate_id.as_ref())
    .bind(version)
    .bind(event.resource_owner.as_ref())
    .bind(event.event_type.as_ref())
    .bind(event.creation_date)
    .bind(event.editor_user.as_ref())
    .bind(event.payload.clone().map(Json))
    .execute(&mut **tx)
    .await
    .map_err(|error| map_sqlx_error(error, Operation::Push))?;
    Ok(())
}

fn push_filters(builder: &mut QueryBuilder<'_, Postgres>, query: &EventQuery) {
    let _ = builder.push(" WHERE TRUE");
    if !query.aggregate_type_filter().is_empty() {
        let types: Vec<String> = query
            .aggregate_type_filter()
            .iter()
            .map(ToString::to_string)
            .collect();
        let _ = builder.push(" AND aggregate_type = ANY(").push_bind(types).push(")");
    }
    if !query.aggregate_id_filter().is_empty() {
        let ids: Vec<String> = query
            .aggregate_id_filter()
            .iter()
            .map(ToString::to_string)
            .collect();
        let _ = builder.push(" AND aggregate_id = ANY(").push_bind(ids).push(")");
    }
    if let Some(owner) = query.resource_owner_filter() {
        let _ = builder.push(" AND resource_owner = ").push_bind(owner.to_string());
    }
    if !query.event_type_filter().is_empty() {
        let types: Vec<String> = query
            .event_type_filter()
            .iter()
            .map(ToString::to_string)
            .collect();
        let _ = builder.push(" AND event_type = ANY(").push_bind(types).push(")");
    }
    if let Some(sequence) = query.sequence_greater_filter() {
        let _ = builder.push(" AND sequence > ").push_bind(sequence.as_i64());
    }
}

fn decode_event(row: &PgRow) -> Result<Event, sqlx::Error> {
    let corrupt = |column: &str, error: String| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: error.into(),
    };
    let version: i64 = row.try_get("aggregate_version")?;
    let payload: Option<Json<Value>> = row.try_get("payload")?;
    let creation_date: DateTime<Utc> = row.try_get("creation_date")?;

    Ok(Event {
        sequence: Sequence::from_i64(row.try_get("sequence")?),
        previous_aggregate_sequence: Sequence::from_i64(row.try_get("previous_aggregate_sequence")?),
        aggregate_type: AggregateType::new(row.try_get::<String, _>("aggregate_type")?),
        aggregate_id: AggregateId::try_new(row.try_get::<String, _>("aggregate_id")?)
            .map_err(|error| corrupt("aggregate_id", error.to_string()))?,
        aggregate_version: AggregateVersion::new(u64::try_from(version).unwrap_or(0)),
        resource_owner: ResourceOwner::try_new(row.try_get::<String, _>("resource_owner")?)
            .map_err(|error| corrupt("resource_owner", error.to_string()))?,
        event_type: EventType::new(row.try_get::<String, _>("event_type")?),
        creation_date,
        editor_user: EditorUser::new(row.try_get::<String, _>("editor_user")?),
        payload: payload.map(|json| json.0),
    })
}

#[async_trait]
impl EventStore for PostgresEventStore {
    #[instrument(name = "postgres.push", skip(self, writes), fields(events = writes.events().len()))]
    async fn push(&self, writes: EventWrites) -> EventStoreResult<Vec<Event>> {
        if writes.is_empty() {
            return Ok(Vec::new());
        }

        let committed = self.commit(writes).await?;
        debug!(
            first_sequence = %committed[0].sequence,
            count = committed.len(),
            "[postgres.push] events appended"
        );
        self.registry.publish(&committed);
        Ok(committed)
    }

    #[instrument(name = "postgres.filter", skip(self, query))]
    async fn filter(&self, query: &EventQuery) -> EventStoreResult<Vec<Event>> {
        let mut builder = QueryBuilder::new(format!("SELECT {EVENT_COLUMNS} FROM eventstore.events"));
        push_filters(&mut builder, query);
        let _ = builder.push(if query.is_descending() {
            " ORDER BY sequence DESC"
        } else {
            " ORDER BY sequence ASC"
        });
        if let Some(limit) = query.limit_filter() {
            let _ = builder
                .push(" LIMIT ")
                .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::Filter))?;
        rows.iter()
            .map(|row| decode_event(row).map_err(|error| map_sqlx_error(error, Operation::Filter)))
            .collect()
    }

    async fn latest_sequence(&self, query: &EventQuery) -> EventStoreResult<Sequence> {
        let mut builder =
            QueryBuilder::new("SELECT COALESCE(MAX(sequence), 0) FROM eventstore.events");
        push_filters(&mut builder, query);

        let latest: i64 = builder
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::LatestSequence))?;
        Ok(Sequence::from_i64(latest))
    }
}
