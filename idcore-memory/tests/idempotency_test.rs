//! Marker scans and code expiry used by side-effect handlers.

use chrono::Duration as ChronoDuration;
use idcore::idempotency::{
    already_handled, already_handled_matching, code_already_handled_or_expired, code_expired,
    expires_at,
};
use idcore::{
    AggregateId, AggregateRef, AggregateType, EditorUser, Event, EventStore, EventType,
    EventWrites, ExpectedVersion, PendingEvent, ResourceOwner,
};
use idcore_memory::InMemoryEventStore;
use idcore_testing::ManualClock;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const CODE_ADDED: &str = "user.human.email.code.added";
const CODE_SENT: &str = "user.human.email.code.sent";
const LINK_SENT: &str = "user.human.passwordless.initialization.code.sent";

fn user(id: &str) -> AggregateRef {
    AggregateRef::new(
        AggregateType::new("user"),
        AggregateId::try_new(id).unwrap(),
        ResourceOwner::try_new("org1").unwrap(),
    )
}

async fn append(store: &InMemoryEventStore, id: &str, event_type: &str) -> Event {
    let event = PendingEvent::new(user(id), EventType::new(event_type), EditorUser::new("editor"));
    append_with(store, id, event).await
}

async fn append_with(store: &InMemoryEventStore, id: &str, event: PendingEvent) -> Event {
    let writes = EventWrites::new()
        .with_aggregate(user(id), ExpectedVersion::Any)
        .with_event(event)
        .build()
        .unwrap();
    store.push(writes).await.unwrap().remove(0)
}

async fn link_sent(store: &InMemoryEventStore, id: &str, link: &str) -> Event {
    let event = PendingEvent::new(user(id), EventType::new(LINK_SENT), EditorUser::new("editor"))
        .with_payload(json!({ "id": link }));
    append_with(store, id, event).await
}

#[tokio::test]
async fn a_later_marker_means_handled() {
    let store = InMemoryEventStore::new();
    let added = append(&store, "u1", CODE_ADDED).await;
    assert!(!already_handled(&store, &added, &[CODE_SENT]).await.unwrap());

    let _ = append(&store, "u1", CODE_SENT).await;

    assert!(already_handled(&store, &added, &[CODE_SENT]).await.unwrap());
}

#[tokio::test]
async fn markers_before_the_event_or_on_other_aggregates_do_not_count() {
    let store = InMemoryEventStore::new();
    let _ = append(&store, "u1", CODE_SENT).await;
    let added = append(&store, "u1", CODE_ADDED).await;
    let _ = append(&store, "u2", CODE_SENT).await;

    assert!(!already_handled(&store, &added, &[CODE_SENT]).await.unwrap());
}

#[tokio::test]
async fn a_newer_code_supersedes_an_older_one() {
    let store = InMemoryEventStore::new();
    let first = append(&store, "u1", CODE_ADDED).await;
    let second = append(&store, "u1", CODE_ADDED).await;

    let handled_by = [CODE_ADDED, CODE_SENT];
    assert!(already_handled(&store, &first, &handled_by).await.unwrap());
    assert!(!already_handled(&store, &second, &handled_by).await.unwrap());
}

#[tokio::test]
async fn correlated_markers_only_match_their_own_id() {
    let store = InMemoryEventStore::new();
    let requested = append(
        &store,
        "u1",
        "user.human.passwordless.initialization.code.requested",
    )
    .await;
    let _ = link_sent(&store, "u1", "other").await;

    let same_link = |event: &Event| {
        event
            .payload
            .as_ref()
            .and_then(|payload| payload.get("id"))
            .is_some_and(|id| *id == "p1")
    };
    assert!(!already_handled_matching(&store, &requested, &[LINK_SENT], same_link)
        .await
        .unwrap());

    let _ = link_sent(&store, "u1", "p1").await;
    assert!(already_handled_matching(&store, &requested, &[LINK_SENT], same_link)
        .await
        .unwrap());
}

#[tokio::test]
async fn codes_expire_after_their_lifetime() {
    let clock = Arc::new(ManualClock::starting_now());
    let store = InMemoryEventStore::new().with_clock(clock.clone());
    let added = append(&store, "u1", CODE_ADDED).await;
    let expiry = Duration::from_secs(3600);

    clock.advance(ChronoDuration::minutes(60));
    assert!(!code_expired(&*clock, &added, expiry));
    assert!(!code_already_handled_or_expired(&store, &*clock, &added, expiry, &[CODE_SENT])
        .await
        .unwrap());

    clock.advance(ChronoDuration::seconds(1));
    assert!(code_expired(&*clock, &added, expiry));
    assert!(code_already_handled_or_expired(&store, &*clock, &added, expiry, &[CODE_SENT])
        .await
        .unwrap());
}

#[tokio::test]
async fn lifetimes_past_the_calendar_never_expire() {
    let clock = Arc::new(ManualClock::starting_now());
    let store = InMemoryEventStore::new().with_clock(clock.clone());
    let added = append(&store, "u1", CODE_ADDED).await;

    for expiry in [Duration::from_secs(10_000_000_000_000), Duration::MAX] {
        assert!(expires_at(added.creation_date, expiry).is_none());
        clock.advance(ChronoDuration::days(365));
        assert!(!code_expired(&*clock, &added, expiry));
    }
}
