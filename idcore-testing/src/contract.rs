//! Behavioral contracts shared by every storage backend.
//!
//! Each `test_*` function takes a store factory and returns a
//! [`ContractTestResult`] describing the first violated expectation. Backends
//! run the whole suite through [`event_store_contract_tests!`] and
//! [`handler_state_contract_tests!`]. Aggregate ids, unique values and
//! handler names carry a UUID so the suites can run in parallel against one
//! shared database.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use idcore::{
    AggregateId, AggregateRef, AggregateType, AggregateVersion, EditorUser, Event, EventQuery,
    EventStore, EventStoreError, EventType, EventWrites, ExpectedVersion, HandlerStateStore,
    PendingEvent, ResourceOwner, Sequence, UniqueConstraint,
};
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// A violated contract expectation.
#[derive(Debug)]
pub struct ContractTestFailure {
    scenario: &'static str,
    detail: String,
}

impl ContractTestFailure {
    fn new(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self {
            scenario,
            detail: detail.into(),
        }
    }

    fn builder_error(scenario: &'static str, phase: &'static str, error: EventStoreError) -> Self {
        Self::new(scenario, format!("builder failure during {phase}: {error}"))
    }

    fn store_error(scenario: &'static str, operation: &'static str, error: EventStoreError) -> Self {
        Self::new(
            scenario,
            format!("{operation} operation returned unexpected error: {error}"),
        )
    }

    fn assertion(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self::new(scenario, detail)
    }
}

impl fmt::Display for ContractTestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.scenario, self.detail)
    }
}

impl std::error::Error for ContractTestFailure {}

/// Outcome of one contract scenario.
pub type ContractTestResult = Result<(), ContractTestFailure>;

const CONTRACT_AGGREGATE_TYPE: &str = "contract";
const RECORDED: &str = "contract.recorded";
const RENAMED: &str = "contract.renamed";
const UNIQUE_TYPE: &str = "contract_names";
const TAKEN: &str = "Errors.Contract.NameTaken";
const CONCURRENT_WRITERS: usize = 8;

fn contract_aggregate(
    scenario: &'static str,
    label: &str,
) -> Result<AggregateRef, ContractTestFailure> {
    let raw = format!("{scenario}-{label}-{}", Uuid::now_v7());
    let aggregate_id = AggregateId::try_new(raw.clone()).map_err(|error| {
        ContractTestFailure::assertion(
            scenario,
            format!("unable to construct aggregate id `{raw}`: {error}"),
        )
    })?;
    let resource_owner = ResourceOwner::try_new("contract-org").map_err(|error| {
        ContractTestFailure::assertion(scenario, format!("unable to construct resource owner: {error}"))
    })?;

    Ok(AggregateRef::new(
        AggregateType::new(CONTRACT_AGGREGATE_TYPE),
        aggregate_id,
        resource_owner,
    ))
}

fn contract_unique_value(label: &str) -> String {
    format!("{label}-{}", Uuid::now_v7())
}

fn contract_handler(scenario: &'static str) -> String {
    format!("contract.{scenario}.{}", Uuid::now_v7())
}

fn contract_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn aggregate_query(aggregate: &AggregateRef) -> EventQuery {
    EventQuery::new().aggregate(aggregate.aggregate_type.clone(), aggregate.aggregate_id.clone())
}

fn contract_event(aggregate: &AggregateRef, event_type: &str, label: &str) -> PendingEvent {
    PendingEvent::new(
        aggregate.clone(),
        EventType::new(event_type),
        EditorUser::new("contract-editor"),
    )
    .with_payload(json!({ "label": label }))
}

fn recorded(aggregate: &AggregateRef, label: &str) -> PendingEvent {
    contract_event(aggregate, RECORDED, label)
}

fn claim(aggregate: &AggregateRef, value: &str) -> PendingEvent {
    recorded(aggregate, "claim").with_constraint(UniqueConstraint::add(UNIQUE_TYPE, value, TAKEN))
}

fn build_writes(
    scenario: &'static str,
    writes: EventWrites,
) -> Result<EventWrites, ContractTestFailure> {
    writes
        .build()
        .map_err(|error| ContractTestFailure::builder_error(scenario, "build", error))
}

fn single_write(
    scenario: &'static str,
    aggregate: &AggregateRef,
    expected: ExpectedVersion,
    event: PendingEvent,
) -> Result<EventWrites, ContractTestFailure> {
    build_writes(
        scenario,
        EventWrites::new()
            .with_aggregate(aggregate.clone(), expected)
            .with_event(event),
    )
}

async fn push_ok<S: EventStore + ?Sized>(
    scenario: &'static str,
    store: &S,
    writes: EventWrites,
) -> Result<Vec<Event>, ContractTestFailure> {
    store
        .push(writes)
        .await
        .map_err(|error| ContractTestFailure::store_error(scenario, "push", error))
}

async fn filter_ok<S: EventStore + ?Sized>(
    scenario: &'static str,
    store: &S,
    query: &EventQuery,
) -> Result<Vec<Event>, ContractTestFailure> {
    store
        .filter(query)
        .await
        .map_err(|error| ContractTestFailure::store_error(scenario, "filter", error))
}

fn expect_already_exists(
    scenario: &'static str,
    result: Result<Vec<Event>, EventStoreError>,
) -> ContractTestResult {
    match result {
        Err(EventStoreError::AlreadyExists { message, .. }) if message == TAKEN => Ok(()),
        Err(EventStoreError::AlreadyExists { message, .. }) => Err(ContractTestFailure::assertion(
            scenario,
            format!("expected constraint message `{TAKEN}`, observed `{message}`"),
        )),
        Err(error) => Err(ContractTestFailure::store_error(scenario, "push", error)),
        Ok(_) => Err(ContractTestFailure::assertion(
            scenario,
            "expected unique constraint violation but push succeeded",
        )),
    }
}

fn expect_conflict(
    scenario: &'static str,
    result: Result<Vec<Event>, EventStoreError>,
) -> ContractTestResult {
    match result {
        Err(EventStoreError::ConcurrencyConflict { .. }) => Ok(()),
        Err(error) => Err(ContractTestFailure::store_error(scenario, "push", error)),
        Ok(_) => Err(ContractTestFailure::assertion(
            scenario,
            "expected concurrency conflict but push succeeded",
        )),
    }
}

/// Appended events come back in sequence order with versions, aggregate
/// chain and payloads intact.
pub async fn test_append_and_filter<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore + 'static,
{
    const SCENARIO: &str = "append_and_filter";

    let store = make_store();
    let aggregate = contract_aggregate(SCENARIO, "single")?;

    let first = build_writes(
        SCENARIO,
        EventWrites::new()
            .with_aggregate(aggregate.clone(), ExpectedVersion::New)
            .with_event(recorded(&aggregate, "first"))
            .with_event(recorded(&aggregate, "second")),
    )?;
    let appended = push_ok(SCENARIO, &store, first).await?;
    if appended.len() != 2 {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("push returned {} events, expected 2", appended.len()),
        ));
    }
    if appended[0].creation_date != appended[1].creation_date {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "events of one push must share their creation date",
        ));
    }

    let second = single_write(
        SCENARIO,
        &aggregate,
        ExpectedVersion::Exact(AggregateVersion::new(2)),
        recorded(&aggregate, "third"),
    )?;
    let _ = push_ok(SCENARIO, &store, second).await?;

    let events = filter_ok(SCENARIO, &store, &aggregate_query(&aggregate)).await?;
    let versions: Vec<u64> = events
        .iter()
        .map(|event| event.aggregate_version.into_inner())
        .collect();
    if versions != [1, 2, 3] {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected versions [1, 2, 3], observed {versions:?}"),
        ));
    }

    if !events.windows(2).all(|pair| pair[0].sequence < pair[1].sequence) {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "sequences are not strictly increasing",
        ));
    }

    let chained = events[0].previous_aggregate_sequence == Sequence::zero()
        && events
            .windows(2)
            .all(|pair| pair[1].previous_aggregate_sequence == pair[0].sequence);
    if !chained {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "previous_aggregate_sequence does not chain the aggregate's events",
        ));
    }

    if events[2].payload != Some(json!({ "label": "third" })) {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("payload not preserved: {:?}", events[2].payload),
        ));
    }

    let latest = store
        .latest_sequence(&aggregate_query(&aggregate))
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "latest_sequence", error))?;
    if latest != events[2].sequence {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("latest sequence {latest} differs from last event {}", events[2].sequence),
        ));
    }

    Ok(())
}

/// Stale expectations are rejected with a concurrency conflict.
pub async fn test_version_conflict<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore + 'static,
{
    const SCENARIO: &str = "version_conflict";

    let store = make_store();
    let aggregate = contract_aggregate(SCENARIO, "shared")?;

    let created = single_write(SCENARIO, &aggregate, ExpectedVersion::New, recorded(&aggregate, "created"))?;
    let _ = push_ok(SCENARIO, &store, created).await?;

    let recreated = single_write(SCENARIO, &aggregate, ExpectedVersion::New, recorded(&aggregate, "again"))?;
    expect_conflict(SCENARIO, store.push(recreated).await)?;

    let stale = single_write(
        SCENARIO,
        &aggregate,
        ExpectedVersion::Exact(AggregateVersion::new(5)),
        recorded(&aggregate, "stale"),
    )?;
    expect_conflict(SCENARIO, store.push(stale).await)?;

    let current = single_write(
        SCENARIO,
        &aggregate,
        ExpectedVersion::Exact(AggregateVersion::new(1)),
        recorded(&aggregate, "current"),
    )?;
    let _ = push_ok(SCENARIO, &store, current).await?;

    let unchecked = single_write(SCENARIO, &aggregate, ExpectedVersion::Any, recorded(&aggregate, "any"))?;
    let appended = push_ok(SCENARIO, &store, unchecked).await?;
    if appended.first().map(|event| event.aggregate_version) != Some(AggregateVersion::new(3)) {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "unchecked append did not continue the aggregate's versions",
        ));
    }

    Ok(())
}

/// A held unique value cannot be claimed by another aggregate, and the
/// rejected push leaves no trace.
pub async fn test_unique_constraint_collision<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore + 'static,
{
    const SCENARIO: &str = "unique_constraint_collision";

    let store = make_store();
    let value = contract_unique_value("gigi");
    let owner = contract_aggregate(SCENARIO, "owner")?;
    let intruder = contract_aggregate(SCENARIO, "intruder")?;

    let first = single_write(SCENARIO, &owner, ExpectedVersion::New, claim(&owner, &value))?;
    let _ = push_ok(SCENARIO, &store, first).await?;

    let second = single_write(SCENARIO, &intruder, ExpectedVersion::New, claim(&intruder, &value))?;
    expect_already_exists(SCENARIO, store.push(second).await)?;

    let intruder_events = filter_ok(SCENARIO, &store, &aggregate_query(&intruder)).await?;
    if !intruder_events.is_empty() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("rejected push stored {} events", intruder_events.len()),
        ));
    }

    Ok(())
}

/// Removing and adding on the same event renames a value: the old value is
/// free afterwards, the new one is held.
pub async fn test_constraint_release<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore + 'static,
{
    const SCENARIO: &str = "constraint_release";

    let store = make_store();
    let old_value = contract_unique_value("old");
    let new_value = contract_unique_value("new");
    let renamer = contract_aggregate(SCENARIO, "renamer")?;

    let claimed = single_write(SCENARIO, &renamer, ExpectedVersion::New, claim(&renamer, &old_value))?;
    let _ = push_ok(SCENARIO, &store, claimed).await?;

    let rename = contract_event(&renamer, RENAMED, "rename")
        .with_constraint(UniqueConstraint::remove(UNIQUE_TYPE, old_value.as_str()))
        .with_constraint(UniqueConstraint::add(UNIQUE_TYPE, new_value.as_str(), TAKEN));
    let renamed = single_write(
        SCENARIO,
        &renamer,
        ExpectedVersion::Exact(AggregateVersion::new(1)),
        rename,
    )?;
    let _ = push_ok(SCENARIO, &store, renamed).await?;

    let successor = contract_aggregate(SCENARIO, "successor")?;
    let reclaim = single_write(SCENARIO, &successor, ExpectedVersion::New, claim(&successor, &old_value))?;
    let _ = push_ok(SCENARIO, &store, reclaim).await?;

    let rival = contract_aggregate(SCENARIO, "rival")?;
    let collide = single_write(SCENARIO, &rival, ExpectedVersion::New, claim(&rival, &new_value))?;
    expect_already_exists(SCENARIO, store.push(collide).await)
}

/// A push failing on one aggregate appends nothing and claims nothing for
/// the others.
pub async fn test_failed_push_is_atomic<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore + 'static,
{
    const SCENARIO: &str = "failed_push_is_atomic";

    let store = make_store();
    let existing = contract_aggregate(SCENARIO, "existing")?;
    let fresh = contract_aggregate(SCENARIO, "fresh")?;
    let value = contract_unique_value("atomic");

    let created = single_write(SCENARIO, &existing, ExpectedVersion::New, recorded(&existing, "created"))?;
    let _ = push_ok(SCENARIO, &store, created).await?;

    let mixed = build_writes(
        SCENARIO,
        EventWrites::new()
            .with_aggregate(fresh.clone(), ExpectedVersion::New)
            .with_event(claim(&fresh, &value))
            .with_aggregate(existing.clone(), ExpectedVersion::Exact(AggregateVersion::new(7)))
            .with_event(recorded(&existing, "stale")),
    )?;
    expect_conflict(SCENARIO, store.push(mixed).await)?;

    let fresh_events = filter_ok(SCENARIO, &store, &aggregate_query(&fresh)).await?;
    if !fresh_events.is_empty() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "failed push stored events of an aggregate that passed its version check",
        ));
    }

    let later = contract_aggregate(SCENARIO, "later")?;
    let reclaim = single_write(SCENARIO, &later, ExpectedVersion::New, claim(&later, &value))?;
    let _ = push_ok(SCENARIO, &store, reclaim)
        .await
        .map_err(|_| ContractTestFailure::assertion(SCENARIO, "failed push left its constraint claimed"))?;

    Ok(())
}

/// Every query restriction narrows the result as documented.
pub async fn test_filter_restrictions<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore + 'static,
{
    const SCENARIO: &str = "filter_restrictions";

    let store = make_store();
    let aggregate = contract_aggregate(SCENARIO, "filtered")?;

    let writes = build_writes(
        SCENARIO,
        EventWrites::new()
            .with_aggregate(aggregate.clone(), ExpectedVersion::New)
            .with_event(recorded(&aggregate, "one"))
            .with_event(contract_event(&aggregate, RENAMED, "two"))
            .with_event(recorded(&aggregate, "three")),
    )?;
    let appended = push_ok(SCENARIO, &store, writes).await?;
    let sequences: Vec<Sequence> = appended.iter().map(|event| event.sequence).collect();
    let base = aggregate_query(&aggregate);

    let renamed = filter_ok(SCENARIO, &store, &base.clone().event_types([EventType::new(RENAMED)])).await?;
    if renamed.len() != 1 || !renamed[0].is(RENAMED) {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("event type filter returned {} events", renamed.len()),
        ));
    }

    let after_first = filter_ok(SCENARIO, &store, &base.clone().sequence_greater(sequences[0])).await?;
    let after: Vec<Sequence> = after_first.iter().map(|event| event.sequence).collect();
    if after != sequences[1..] {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("sequence_greater returned {after:?}, expected {:?}", &sequences[1..]),
        ));
    }

    let oldest = filter_ok(SCENARIO, &store, &base.clone().limit(1)).await?;
    let newest = filter_ok(SCENARIO, &store, &base.clone().descending().limit(1)).await?;
    if oldest.first().map(|event| event.sequence) != Some(sequences[0])
        || newest.first().map(|event| event.sequence) != Some(sequences[2])
    {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "limit or descending order returned the wrong event",
        ));
    }

    let other_owner = ResourceOwner::try_new("contract-other-org")
        .map_err(|error| ContractTestFailure::assertion(SCENARIO, error.to_string()))?;
    let foreign = filter_ok(SCENARIO, &store, &base.clone().resource_owner(other_owner)).await?;
    if !foreign.is_empty() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "resource owner filter returned events of another owner",
        ));
    }

    let latest_recorded = store
        .latest_sequence(&base.event_types([EventType::new(RECORDED)]))
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "latest_sequence", error))?;
    if latest_recorded != sequences[2] {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("latest recorded sequence {latest_recorded}, expected {}", sequences[2]),
        ));
    }

    Ok(())
}

/// Of many writers claiming one value at the same time exactly one wins.
pub async fn test_concurrent_unique_claims<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore + 'static,
{
    const SCENARIO: &str = "concurrent_unique_claims";

    let store = Arc::new(make_store());
    let value = contract_unique_value("race");

    let mut tasks = Vec::with_capacity(CONCURRENT_WRITERS);
    for index in 0..CONCURRENT_WRITERS {
        let aggregate = contract_aggregate(SCENARIO, &format!("claimant-{index}"))?;
        let writes = single_write(SCENARIO, &aggregate, ExpectedVersion::New, claim(&aggregate, &value))?;
        let store = Arc::clone(&store);
        tasks.push(tokio::spawn(async move { store.push(writes).await }));
    }

    let mut winners = 0;
    for task in tasks {
        match task.await {
            Ok(Ok(_)) => winners += 1,
            Ok(Err(EventStoreError::AlreadyExists { .. })) => {}
            Ok(Err(error)) => return Err(ContractTestFailure::store_error(SCENARIO, "push", error)),
            Err(error) => {
                return Err(ContractTestFailure::assertion(
                    SCENARIO,
                    format!("claim task failed: {error}"),
                ))
            }
        }
    }

    if winners != 1 {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected exactly one successful claim, observed {winners}"),
        ));
    }

    Ok(())
}

/// Of many writers creating one aggregate at the same time exactly one wins.
pub async fn test_concurrent_version_race<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: EventStore + 'static,
{
    const SCENARIO: &str = "concurrent_version_race";

    let store = Arc::new(make_store());
    let aggregate = contract_aggregate(SCENARIO, "contested")?;

    let mut tasks = Vec::with_capacity(CONCURRENT_WRITERS);
    for index in 0..CONCURRENT_WRITERS {
        let writes = single_write(
            SCENARIO,
            &aggregate,
            ExpectedVersion::New,
            recorded(&aggregate, &format!("writer-{index}")),
        )?;
        let store = Arc::clone(&store);
        tasks.push(tokio::spawn(async move { store.push(writes).await }));
    }

    let mut winners = 0;
    for task in tasks {
        match task.await {
            Ok(Ok(_)) => winners += 1,
            Ok(Err(EventStoreError::ConcurrencyConflict { .. })) => {}
            Ok(Err(error)) => return Err(ContractTestFailure::store_error(SCENARIO, "push", error)),
            Err(error) => {
                return Err(ContractTestFailure::assertion(
                    SCENARIO,
                    format!("writer task failed: {error}"),
                ))
            }
        }
    }

    let events = filter_ok(SCENARIO, &store, &aggregate_query(&aggregate)).await?;
    if winners != 1 || events.len() != 1 {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected one winner and one event, observed {winners} winners and {} events", events.len()),
        ));
    }

    Ok(())
}

/// Watermarks start at zero and never move backward.
pub async fn test_watermark_is_monotonic<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: HandlerStateStore + 'static,
{
    const SCENARIO: &str = "watermark_is_monotonic";

    let store = make_store();
    let handler = contract_handler(SCENARIO);
    let state_error = |error| ContractTestFailure::store_error(SCENARIO, "handler_state", error);

    let initial = store.current_sequence(&handler).await.map_err(state_error)?;
    if initial != Sequence::zero() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("unknown handler starts at {initial}, expected 0"),
        ));
    }

    store
        .set_current_sequence(&handler, Sequence::new(5))
        .await
        .map_err(state_error)?;
    store
        .set_current_sequence(&handler, Sequence::new(3))
        .await
        .map_err(state_error)?;

    let current = store.current_sequence(&handler).await.map_err(state_error)?;
    if current != Sequence::new(5) {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("watermark moved backward to {current}"),
        ));
    }

    Ok(())
}

/// Failure records count attempts per event and remember skips.
pub async fn test_failure_bookkeeping<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: HandlerStateStore + 'static,
{
    const SCENARIO: &str = "failure_bookkeeping";

    let store = make_store();
    let handler = contract_handler(SCENARIO);
    let poison = Sequence::new(42);
    let at = contract_now();
    let state_error = |error| ContractTestFailure::store_error(SCENARIO, "handler_state", error);

    let first = store
        .record_failure(&handler, poison, "first failure", at)
        .await
        .map_err(state_error)?;
    let second = store
        .record_failure(&handler, poison, "second failure", at)
        .await
        .map_err(state_error)?;
    if first.failure_count != 1 || second.failure_count != 2 || second.last_error != "second failure" {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!(
                "failure counts {} and {} with last error `{}`",
                first.failure_count, second.failure_count, second.last_error
            ),
        ));
    }

    store.mark_skipped(&handler, poison).await.map_err(state_error)?;
    let skipped = store.failed_event(&handler, poison).await.map_err(state_error)?;
    if !skipped.as_ref().is_some_and(|failed| failed.skipped && failed.failure_count == 2) {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("skip was not recorded: {skipped:?}"),
        ));
    }

    let unrelated = store
        .failed_event(&handler, Sequence::new(41))
        .await
        .map_err(state_error)?;
    let all = store.failed_events(&handler).await.map_err(state_error)?;
    if unrelated.is_some() || all.len() != 1 {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected one failure record, observed {}", all.len()),
        ));
    }

    Ok(())
}

/// Run timestamps are stored per handler.
pub async fn test_run_timestamps<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: HandlerStateStore + 'static,
{
    const SCENARIO: &str = "run_timestamps";

    let store = make_store();
    let handler = contract_handler(SCENARIO);
    let state_error = |error| ContractTestFailure::store_error(SCENARIO, "handler_state", error);

    if store.last_run(&handler).await.map_err(state_error)?.is_some() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "handler that never ran has a last run",
        ));
    }

    let at = contract_now();
    store.record_run(&handler, at).await.map_err(state_error)?;
    let last_run = store.last_run(&handler).await.map_err(state_error)?;
    if last_run != Some(at) {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected last run {at}, observed {last_run:?}"),
        ));
    }

    Ok(())
}

/// A handler lock excludes other owners until released or expired.
pub async fn test_handler_lock<F, S>(make_store: F) -> ContractTestResult
where
    F: Fn() -> S + Send + Sync + Clone + 'static,
    S: HandlerStateStore + 'static,
{
    const SCENARIO: &str = "handler_lock";

    let store = make_store();
    let handler = contract_handler(SCENARIO);
    let lease = std::time::Duration::from_secs(30);
    let now = contract_now();
    let state_error = |error| ContractTestFailure::store_error(SCENARIO, "handler_state", error);

    let steps = [
        ("worker-a takes the free lock", "worker-a", now, true),
        ("worker-b is locked out", "worker-b", now, false),
        ("worker-a renews its lock", "worker-a", now, true),
        ("worker-b takes an expired lock", "worker-b", now + Duration::seconds(31), true),
        ("worker-a is locked out again", "worker-a", now + Duration::seconds(32), false),
    ];
    for (step, owner, at, expected) in steps {
        let acquired = store
            .try_lock(&handler, owner, lease, at)
            .await
            .map_err(state_error)?;
        if acquired != expected {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                format!("{step}: try_lock returned {acquired}"),
            ));
        }
    }

    store.unlock(&handler, "worker-a").await.map_err(state_error)?;
    let still_held = store
        .try_lock(&handler, "worker-a", lease, now + Duration::seconds(33))
        .await
        .map_err(state_error)?;
    if still_held {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "unlock by a non-owner released the lock",
        ));
    }

    store.unlock(&handler, "worker-b").await.map_err(state_error)?;
    let released = store
        .try_lock(&handler, "worker-a", lease, now + Duration::seconds(34))
        .await
        .map_err(state_error)?;
    if !released {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "lock was not released by its owner",
        ));
    }

    Ok(())
}

/// Generates one test per event store scenario.
///
/// ```ignore
/// event_store_contract_tests! {
///     suite = in_memory,
///     make_store = idcore_memory::InMemoryEventStore::new,
/// }
/// ```
#[macro_export]
macro_rules! event_store_contract_tests {
    (suite = $suite:ident, make_store = $make_store:expr $(,)?) => {
        mod $suite {
            use $crate::contract::{
                test_append_and_filter, test_concurrent_unique_claims,
                test_concurrent_version_race, test_constraint_release,
                test_failed_push_is_atomic, test_filter_restrictions,
                test_unique_constraint_collision, test_version_conflict,
            };

            #[tokio::test(flavor = "multi_thread")]
            async fn append_and_filter_contract() {
                test_append_and_filter($make_store)
                    .await
                    .expect("event store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn version_conflict_contract() {
                test_version_conflict($make_store)
                    .await
                    .expect("event store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn unique_constraint_collision_contract() {
                test_unique_constraint_collision($make_store)
                    .await
                    .expect("event store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn constraint_release_contract() {
                test_constraint_release($make_store)
                    .await
                    .expect("event store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn failed_push_is_atomic_contract() {
                test_failed_push_is_atomic($make_store)
                    .await
                    .expect("event store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn filter_restrictions_contract() {
                test_filter_restrictions($make_store)
                    .await
                    .expect("event store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn concurrent_unique_claims_contract() {
                test_concurrent_unique_claims($make_store)
                    .await
                    .expect("event store contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn concurrent_version_race_contract() {
                test_concurrent_version_race($make_store)
                    .await
                    .expect("event store contract failed");
            }
        }
    };
}

pub use event_store_contract_tests;

/// Generates one test per handler state scenario.
#[macro_export]
macro_rules! handler_state_contract_tests {
    (suite = $suite:ident, make_store = $make_store:expr $(,)?) => {
        mod $suite {
            use $crate::contract::{
                test_failure_bookkeeping, test_handler_lock, test_run_timestamps,
                test_watermark_is_monotonic,
            };

            #[tokio::test(flavor = "multi_thread")]
            async fn watermark_is_monotonic_contract() {
                test_watermark_is_monotonic($make_store)
                    .await
                    .expect("handler state contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn failure_bookkeeping_contract() {
                test_failure_bookkeeping($make_store)
                    .await
                    .expect("handler state contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn run_timestamps_contract() {
                test_run_timestamps($make_store)
                    .await
                    .expect("handler state contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn handler_lock_contract() {
                test_handler_lock($make_store)
                    .await
                    .expect("handler state contract failed");
            }
        }
    };
}

pub use handler_state_contract_tests;
