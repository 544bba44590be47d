//! Projection statements, searches and an end-to-end spooler run against
//! PostgreSQL.
//!
//! Run with `cargo test -p idcore-postgres --features container-tests`.

#![cfg(feature = "container-tests")]

mod common;

use chrono::{SubsecRound, Utc};
use idcore::projection::{AggregateReducer, Column};
use idcore::query::TextComparison;
use idcore::{
    AggregateId, AggregateRef, AggregateType, AggregateVersion, EditorUser, Event, EventStore,
    EventStoreError, EventType, EventWrites, ExpectedVersion, HandlerStateStore, PendingEvent, Projection,
    ProjectionHandler, ProjectionReader, ResourceOwner, SearchQuery, SearchRequest, Sequence,
    Spooler, SpoolerConfig, Statement, StatementExecutor, SubscriptionRegistry,
};
use idcore_postgres::{PostgresHandlerStateStore, PostgresProjectionDb};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

fn unique_table() -> String {
    format!("projections.notes_{}", Uuid::now_v7().simple())
}

async fn notes_table(db: &PostgresProjectionDb) -> String {
    let table = unique_table();
    db.create_tables(&format!(
        "CREATE TABLE {table} (
            aggregate_id TEXT PRIMARY KEY,
            creation_date TIMESTAMPTZ NOT NULL,
            change_date TIMESTAMPTZ NOT NULL,
            sequence BIGINT NOT NULL,
            resource_owner TEXT NOT NULL,
            text TEXT,
            tags TEXT[]
        )"
    ))
    .await
    .expect("should create notes table");
    table
}

fn event(sequence: u64, id: &str) -> Event {
    Event {
        sequence: Sequence::new(sequence),
        previous_aggregate_sequence: Sequence::zero(),
        aggregate_type: AggregateType::new("note"),
        aggregate_id: AggregateId::try_new(id).unwrap(),
        aggregate_version: AggregateVersion::new(1),
        resource_owner: ResourceOwner::try_new("org1").unwrap(),
        event_type: EventType::new("note.written"),
        creation_date: Utc::now().trunc_subsecs(6),
        editor_user: EditorUser::new("editor"),
        payload: None,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn replayed_statements_leave_rows_unchanged() {
    let db = common::projection_db().await;
    let table = notes_table(&db).await;
    let written = Statement::create(&event(1, "n1"), table.as_str(), vec![Column::new("text", "draft")]);
    let changed = Statement::update(&event(3, "n1"), table.as_str(), vec![Column::new("text", "final")]);
    let stale = Statement::update(&event(2, "n1"), table.as_str(), vec![Column::new("text", "stale")]);

    for statement in [&written, &changed, &written, &stale, &changed] {
        db.execute(statement).await.unwrap();
    }

    let result = db
        .search(&table, &SearchRequest::default(), &[])
        .await
        .unwrap();
    assert_eq!(result.count, 1);
    assert_eq!(result.rows[0]["text"], json!("final"));
    assert_eq!(result.rows[0]["sequence"], json!(3));
}

#[tokio::test(flavor = "multi_thread")]
async fn nulls_and_arrays_are_written() {
    let db = common::projection_db().await;
    let table = notes_table(&db).await;

    db.execute(&Statement::create(
        &event(1, "n1"),
        table.as_str(),
        vec![
            Column::new("text", None::<String>),
            Column::new("tags", vec!["a".to_string(), "b".to_string()]),
        ],
    ))
    .await
    .unwrap();

    let result = db.search(&table, &SearchRequest::default(), &[]).await.unwrap();
    assert_eq!(result.rows[0]["text"], json!(null));
    assert_eq!(result.rows[0]["tags"], json!(["a", "b"]));
}

#[tokio::test(flavor = "multi_thread")]
async fn searches_filter_sort_and_page() {
    let db = common::projection_db().await;
    let table = notes_table(&db).await;
    for (sequence, id, text) in [(1, "n1", "alpha"), (2, "n2", "alps"), (3, "n3", "beta")] {
        db.execute(&Statement::create(
            &event(sequence, id),
            table.as_str(),
            vec![Column::new("text", text)],
        ))
        .await
        .unwrap();
    }

    let request = SearchRequest {
        offset: 1,
        limit: 1,
        sort_column: Some("text".to_string()),
        asc: true,
    };
    let queries = [SearchQuery::text("text", "ALP", TextComparison::StartsWithIgnoreCase)];
    let result = db.search(&table, &request, &queries).await.unwrap();

    assert_eq!(result.count, 2);
    assert_eq!(result.rows.len(), 1);
    assert_eq!(result.rows[0]["aggregate_id"], json!("n2"));
}

#[tokio::test(flavor = "multi_thread")]
async fn deletes_are_idempotent() {
    let db = common::projection_db().await;
    let table = notes_table(&db).await;
    db.execute(&Statement::create(&event(1, "n1"), table.as_str(), vec![]))
        .await
        .unwrap();
    let removed = Statement::delete(&event(2, "n1"), table.as_str());

    db.execute(&removed).await.unwrap();
    db.execute(&removed).await.unwrap();

    let result = db.search(&table, &SearchRequest::default(), &[]).await.unwrap();
    assert_eq!(result.count, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn unique_violations_surface_as_already_exists() {
    let db = common::projection_db().await;
    let table = unique_table();
    db.create_tables(&format!(
        "CREATE TABLE {table} (
            aggregate_id TEXT PRIMARY KEY,
            creation_date TIMESTAMPTZ NOT NULL,
            change_date TIMESTAMPTZ NOT NULL,
            sequence BIGINT NOT NULL,
            resource_owner TEXT NOT NULL,
            text TEXT UNIQUE
        )"
    ))
    .await
    .expect("should create table with unique column");
    db.execute(&Statement::create(&event(1, "n1"), table.as_str(), vec![Column::new("text", "taken")]))
        .await
        .unwrap();

    let error = db
        .execute(&Statement::create(&event(2, "n2"), table.as_str(), vec![Column::new("text", "taken")]))
        .await
        .unwrap_err();

    assert!(
        matches!(error, EventStoreError::AlreadyExists { ref unique_type, .. } if unique_type.ends_with("_text_key")),
        "{error:?}"
    );
}

struct Notes {
    table: String,
    aggregate_type: String,
}

impl Projection for Notes {
    fn name(&self) -> &str {
        &self.table
    }

    fn table(&self) -> &str {
        &self.table
    }

    fn reducers(&self) -> Vec<AggregateReducer> {
        let table = self.table.clone();
        vec![AggregateReducer::new(self.aggregate_type.as_str()).on("note.written", move |event| {
            let text = event
                .payload
                .as_ref()
                .and_then(|payload| payload["text"].as_str())
                .unwrap_or_default()
                .to_string();
            Ok(Statement::create(event, table.as_str(), vec![Column::new("text", text)]))
        })]
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn the_spooler_projects_stored_events() {
    // Given: two events of an aggregate type no other test uses
    let pool = common::pool().await;
    let store = idcore_postgres::PostgresEventStore::from_pool(pool.clone());
    let state = PostgresHandlerStateStore::from_pool(pool.clone());
    let db = PostgresProjectionDb::from_pool(pool);
    let table = notes_table(&db).await;
    let aggregate_type = format!("note_{}", Uuid::now_v7().simple());

    for (id, text) in [("n1", "one"), ("n2", "two")] {
        let aggregate = AggregateRef::new(
            AggregateType::new(aggregate_type.as_str()),
            AggregateId::try_new(id).unwrap(),
            ResourceOwner::try_new("org1").unwrap(),
        );
        let writes = EventWrites::new()
            .with_aggregate(aggregate.clone(), ExpectedVersion::New)
            .with_event(
                PendingEvent::new(aggregate, EventType::new("note.written"), EditorUser::new("editor"))
                    .with_payload(json!({ "text": text })),
            )
            .build()
            .unwrap();
        let _ = store.push(writes).await.unwrap();
    }

    // When: one tick runs
    let handler = ProjectionHandler::new(
        Notes {
            table: table.clone(),
            aggregate_type,
        },
        db.clone(),
    );
    let spooler = Spooler::new(
        Arc::new(store),
        Arc::new(state.clone()),
        Arc::new(SubscriptionRegistry::new()),
        SpoolerConfig::default(),
    );
    let report = spooler.run_once(&handler).await.unwrap();

    // Then: both rows exist and the watermark is persisted
    assert_eq!(report.processed, 2);
    let request = SearchRequest::sorted_by("aggregate_id", 10);
    let result = db.search(&table, &request, &[]).await.unwrap();
    let texts: Vec<_> = result.rows.iter().map(|row| row["text"].clone()).collect();
    assert_eq!(texts, vec![json!("one"), json!("two")]);
    assert_eq!(state.current_sequence(&table).await.unwrap(), report.watermark);
}
