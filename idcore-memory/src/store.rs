use async_trait::async_trait;
use idcore::{
    AggregateId, AggregateType, AggregateVersion, Clock, Event, EventQuery, EventStore,
    EventStoreError, EventStoreResult, EventWrites, Sequence, SharedClock, SubscriptionRegistry,
    UniqueConstraintAction,
};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, instrument};

#[derive(Debug, Clone, Copy, Default)]
struct Head {
    version: AggregateVersion,
    last_sequence: Sequence,
}

#[derive(Debug, Default)]
struct Log {
    events: Vec<Event>,
    heads: HashMap<(AggregateType, AggregateId), Head>,
    constraints: HashSet<(String, String)>,
    last_sequence: Sequence,
}

/// Thread-safe in-memory event log.
///
/// One write lock covers the version checks, the constraint table and the
/// append, which makes every push atomic with respect to every other.
#[derive(Clone)]
pub struct InMemoryEventStore {
    log: Arc<RwLock<Log>>,
    registry: Arc<SubscriptionRegistry>,
    clock: SharedClock,
}

impl std::fmt::Debug for InMemoryEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let log = self.log.read();
        f.debug_struct("InMemoryEventStore")
            .field("events", &log.events.len())
            .field("last_sequence", &log.last_sequence)
            .finish_non_exhaustive()
    }
}

impl InMemoryEventStore {
    /// Creates an empty store with its own subscription registry.
    pub fn new() -> Self {
        Self::with_registry(Arc::new(SubscriptionRegistry::new()))
    }

    /// Creates an empty store publishing committed events to `registry`.
    pub fn with_registry(registry: Arc<SubscriptionRegistry>) -> Self {
        Self {
            log: Arc::default(),
            registry,
            clock: idcore::clock::system_clock(),
        }
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

    /// Number of stored events.
    pub fn len(&self) -> usize {
        self.log.read().events.len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn commit(&self, writes: EventWrites) -> EventStoreResult<Vec<Event>> {
        let (expected_versions, pending) = writes.into_parts();
        let mut log = self.log.write();

        for ((aggregate_type, aggregate_id), expected) in &expected_versions {
            let current = log
                .heads
                .get(&(aggregate_type.clone(), aggregate_id.clone()))
                .map_or_else(AggregateVersion::initial, |head| head.version);
            if !expected.matches(current) {
                debug!(
                    aggregate_type = %aggregate_type,
                    aggregate_id = %aggregate_id,
                    expected = %expected,
                    actual = %current,
                    "version check failed"
                );
                return Err(EventStoreError::ConcurrencyConflict {
                    aggregate_type: aggregate_type.clone(),
                    aggregate_id: aggregate_id.clone(),
                    expected: expected.to_string(),
                    actual: current,
                });
            }
        }

        // Applied in event order on a copy, so a rename can free and re-take
        // values within one push and a rejected push changes nothing.
        let mut constraints = log.constraints.clone();
        for constraint in pending.iter().flat_map(|event| &event.unique_constraints) {
            match constraint.action() {
                UniqueConstraintAction::Add => {
                    if !constraints.insert(constraint.key()) {
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
                    let _ = constraints.remove(&constraint.key());
                }
            }
        }

        let creation_date = self.clock.now();
        let mut committed = Vec::with_capacity(pending.len());
        for event in pending {
            let key = event.aggregate.key();
            let head = log.heads.get(&key).copied().unwrap_or_default();
            let sequence = log.last_sequence.next();
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
            let _ = log.heads.insert(
                key,
                Head {
                    version: stored.aggregate_version,
                    last_sequence: sequence,
                },
            );
            log.last_sequence = sequence;
            log.events.push(stored.clone());
            committed.push(stored);
        }
        log.constraints = constraints;

        Ok(committed)
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    #[instrument(name = "memory.push", skip(self, writes), fields(events = writes.events().len()))]
    async fn push(&self, writes: EventWrites) -> EventStoreResult<Vec<Event>> {
        if writes.is_empty() {
            return Ok(Vec::new());
        }

        let committed = self.commit(writes)?;
        debug!(
            first_sequence = %committed[0].sequence,
            count = committed.len(),
            "events appended"
        );
        self.registry.publish(&committed);
        Ok(committed)
    }

    async fn filter(&self, query: &EventQuery) -> EventStoreResult<Vec<Event>> {
        let log = self.log.read();
        let limit = query.limit_filter().unwrap_or(usize::MAX);
        let matching = |event: &&Event| query.matches(event);

        let events = if query.is_descending() {
            log.events.iter().rev().filter(matching).take(limit).cloned().collect()
        } else {
            log.events.iter().filter(matching).take(limit).cloned().collect()
        };
        Ok(events)
    }

    async fn latest_sequence(&self, query: &EventQuery) -> EventStoreResult<Sequence> {
        let log = self.log.read();
        Ok(log
            .events
            .iter()
            .rev()
            .find(|event| query.matches(event))
            .map_or_else(Sequence::zero, |event| event.sequence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use idcore::{
        AggregateRef, EditorUser, EventType, ExpectedVersion, PendingEvent, ResourceOwner,
    };
    use idcore_testing::ManualClock;
    use proptest::prelude::*;

    fn aggregate(id: &str) -> AggregateRef {
        AggregateRef::new(
            AggregateType::new("user"),
            AggregateId::try_new(id).unwrap(),
            ResourceOwner::try_new("org1").unwrap(),
        )
    }

    fn added(aggregate: &AggregateRef) -> EventWrites {
        EventWrites::new()
            .with_aggregate(aggregate.clone(), ExpectedVersion::New)
            .with_event(PendingEvent::new(
                aggregate.clone(),
                EventType::new("user.human.added"),
                EditorUser::new("editor"),
            ))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn clones_share_the_log() {
        let store = InMemoryEventStore::new();
        let clone = store.clone();

        let _ = store.push(added(&aggregate("u1"))).await.unwrap();

        assert_eq!(clone.len(), 1);
        assert!(Arc::ptr_eq(&store.log, &clone.log));
    }

    #[tokio::test]
    async fn sequences_are_global_across_aggregates() {
        let store = InMemoryEventStore::new();

        let first = store.push(added(&aggregate("u1"))).await.unwrap();
        let second = store.push(added(&aggregate("u2"))).await.unwrap();

        assert_eq!(first[0].sequence, Sequence::new(1));
        assert_eq!(second[0].sequence, Sequence::new(2));
        assert_eq!(second[0].previous_aggregate_sequence, Sequence::zero());
    }

    #[tokio::test]
    async fn creation_date_comes_from_the_clock() {
        let pinned = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let store = InMemoryEventStore::new().with_clock(Arc::new(ManualClock::at(pinned)));

        let events = store.push(added(&aggregate("u1"))).await.unwrap();

        assert_eq!(events[0].creation_date, pinned);
    }

    #[tokio::test]
    async fn committed_events_are_published() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let store = InMemoryEventStore::with_registry(Arc::clone(&registry));
        let mut subscription = registry.subscribe([AggregateType::new("user")]);

        let _ = store.push(added(&aggregate("u1"))).await.unwrap();

        let notified = subscription.recv().await.unwrap();
        assert_eq!(notified.sequence, Sequence::new(1));
    }

    #[tokio::test]
    async fn rejected_pushes_are_not_published() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let store = InMemoryEventStore::with_registry(Arc::clone(&registry));
        let mut subscription = registry.subscribe(Vec::new());
        let _ = store.push(added(&aggregate("u1"))).await.unwrap();
        let _ = subscription.drain();

        let result = store.push(added(&aggregate("u1"))).await;

        assert!(matches!(result, Err(EventStoreError::ConcurrencyConflict { .. })));
        assert_eq!(subscription.drain(), 0);
    }

    #[tokio::test]
    async fn empty_pushes_append_nothing() {
        let store = InMemoryEventStore::new();

        let events = store.push(EventWrites::new()).await.unwrap();

        assert!(events.is_empty());
        assert!(store.is_empty());
    }

    proptest! {
        #[test]
        fn sequences_increase_by_one_in_append_order(
            pushes in prop::collection::vec((0..4_usize, 1..4_usize), 1..20)
        ) {
            let events = tokio_test::block_on(async {
                let store = InMemoryEventStore::new();
                let mut events = Vec::new();
                for (user, count) in pushes {
                    let aggregate = aggregate(&format!("u{user}"));
                    let pending = (0..count).map(|_| {
                        PendingEvent::new(
                            aggregate.clone(),
                            EventType::new("user.human.changed"),
                            EditorUser::new("editor"),
                        )
                    });
                    let writes = EventWrites::new()
                        .with_aggregate(aggregate.clone(), ExpectedVersion::Any)
                        .with_events(pending)
                        .build()
                        .unwrap();
                    events.extend(store.push(writes).await.unwrap());
                }
                events
            });

            for (index, event) in events.iter().enumerate() {
                prop_assert_eq!(event.sequence, Sequence::new(u64::try_from(index).unwrap() + 1));
                prop_assert!(event.previous_aggregate_sequence < event.sequence);
            }
        }
    }
}
