//! The event log contract: write batches, read filters and the [`EventStore`] trait.

use crate::errors::{EventStoreError, EventStoreResult};
use crate::event::{AggregateRef, Event, PendingEvent};
use crate::types::{AggregateId, AggregateType, AggregateVersion, EventType, ResourceOwner, Sequence};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Optimistic concurrency expectation for one aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// No check.
    Any,
    /// The aggregate must not have any events yet.
    New,
    /// The aggregate must be at exactly this version.
    Exact(AggregateVersion),
}

impl ExpectedVersion {
    /// Whether an aggregate currently at `current` satisfies this expectation.
    pub fn matches(self, current: AggregateVersion) -> bool {
        match self {
            Self::Any => true,
            Self::New => current == AggregateVersion::initial(),
            Self::Exact(expected) => current == expected,
        }
    }
}

impl fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("any version"),
            Self::New => f.write_str("a new aggregate"),
            Self::Exact(version) => write!(f, "version {version}"),
        }
    }
}

/// Events to append atomically, with one expectation per touched aggregate.
///
/// The builder accumulates errors and reports the first one from
/// [`build()`](Self::build):
///
/// ```ignore
/// let writes = EventWrites::new()
///     .with_aggregate(user.clone(), ExpectedVersion::New)
///     .with_event(added)
///     .build()?;
///
/// store.push(writes).await?;
/// ```
#[derive(Debug, Default)]
pub struct EventWrites {
    events: Vec<PendingEvent>,
    expected_versions: HashMap<(AggregateType, AggregateId), ExpectedVersion>,
    builder_errors: Vec<EventStoreError>,
}

impl EventWrites {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares an aggregate and the version the caller expects it to be at.
    ///
    /// Declaring the same aggregate twice with different expectations is an
    /// error reported by [`build()`](Self::build).
    pub fn with_aggregate(mut self, aggregate: AggregateRef, expected: ExpectedVersion) -> Self {
        use std::collections::hash_map::Entry;

        match self.expected_versions.entry(aggregate.key()) {
            Entry::Vacant(entry) => {
                let _ = entry.insert(expected);
            }
            Entry::Occupied(entry) => {
                if *entry.get() != expected {
                    self.builder_errors.push(EventStoreError::InvalidInput(format!(
                        "aggregate {}/{} declared with both {} and {}",
                        aggregate.aggregate_type,
                        aggregate.aggregate_id,
                        entry.get(),
                        expected
                    )));
                }
            }
        }
        self
    }

    /// Adds an event for a previously declared aggregate.
    pub fn with_event(mut self, event: PendingEvent) -> Self {
        if self.expected_versions.contains_key(&event.aggregate.key()) {
            self.events.push(event);
        } else {
            self.builder_errors.push(EventStoreError::InvalidInput(format!(
                "event {} targets undeclared aggregate {}/{}",
                event.event_type, event.aggregate.aggregate_type, event.aggregate.aggregate_id
            )));
        }
        self
    }

    /// Adds several events, see [`with_event`](Self::with_event).
    pub fn with_events(self, events: impl IntoIterator<Item = PendingEvent>) -> Self {
        events.into_iter().fold(self, Self::with_event)
    }

    /// Finalizes the batch.
    ///
    /// # Errors
    ///
    /// Returns the first builder error: an event for an undeclared aggregate
    /// or conflicting expectations for the same aggregate.
    pub fn build(mut self) -> EventStoreResult<Self> {
        if self.builder_errors.is_empty() {
            return Ok(self);
        }
        Err(self.builder_errors.remove(0))
    }

    /// Expectations by aggregate.
    pub const fn expected_versions(&self) -> &HashMap<(AggregateType, AggregateId), ExpectedVersion> {
        &self.expected_versions
    }

    /// Pending events in append order.
    pub fn events(&self) -> &[PendingEvent] {
        &self.events
    }

    /// Whether the batch contains no events.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Consumes the batch.
    pub fn into_parts(
        self,
    ) -> (
        HashMap<(AggregateType, AggregateId), ExpectedVersion>,
        Vec<PendingEvent>,
    ) {
        (self.expected_versions, self.events)
    }
}

/// Filter for reading the event log.
///
/// Empty lists mean "no restriction". Results are ordered by sequence,
/// ascending unless [`descending`](Self::descending) is set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventQuery {
    aggregate_types: Vec<AggregateType>,
    aggregate_ids: Vec<AggregateId>,
    resource_owner: Option<ResourceOwner>,
    event_types: Vec<EventType>,
    sequence_greater: Option<Sequence>,
    limit: Option<usize>,
    descending: bool,
}

impl EventQuery {
    /// Query matching every event.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts to the given aggregate types.
    #[must_use]
    pub fn aggregate_types(mut self, types: impl IntoIterator<Item = AggregateType>) -> Self {
        self.aggregate_types.extend(types);
        self
    }

    /// Restricts to the given aggregate ids.
    #[must_use]
    pub fn aggregate_ids(mut self, ids: impl IntoIterator<Item = AggregateId>) -> Self {
        self.aggregate_ids.extend(ids);
        self
    }

    /// Restricts to one aggregate instance.
    #[must_use]
    pub fn aggregate(self, aggregate_type: AggregateType, aggregate_id: AggregateId) -> Self {
        self.aggregate_types([aggregate_type]).aggregate_ids([aggregate_id])
    }

    /// Restricts to one resource owner.
    #[must_use]
    pub fn resource_owner(mut self, owner: ResourceOwner) -> Self {
        self.resource_owner = Some(owner);
        self
    }

    /// Restricts to the given event types.
    #[must_use]
    pub fn event_types(mut self, types: impl IntoIterator<Item = EventType>) -> Self {
        self.event_types.extend(types);
        self
    }

    /// Only events strictly after `sequence`.
    #[must_use]
    pub const fn sequence_greater(mut self, sequence: Sequence) -> Self {
        self.sequence_greater = Some(sequence);
        self
    }

    /// At most `limit` events.
    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Newest first.
    #[must_use]
    pub const fn descending(mut self) -> Self {
        self.descending = true;
        self
    }

    /// Aggregate type restriction.
    pub fn aggregate_type_filter(&self) -> &[AggregateType] {
        &self.aggregate_types
    }

    /// Aggregate id restriction.
    pub fn aggregate_id_filter(&self) -> &[AggregateId] {
        &self.aggregate_ids
    }

    /// Resource owner restriction.
    pub const fn resource_owner_filter(&self) -> Option<&ResourceOwner> {
        self.resource_owner.as_ref()
    }

    /// Event type restriction.
    pub fn event_type_filter(&self) -> &[EventType] {
        &self.event_types
    }

    /// Exclusive lower sequence bound.
    pub const fn sequence_greater_filter(&self) -> Option<Sequence> {
        self.sequence_greater
    }

    /// Maximum number of events.
    pub const fn limit_filter(&self) -> Option<usize> {
        self.limit
    }

    /// Whether results are newest first.
    pub const fn is_descending(&self) -> bool {
        self.descending
    }

    /// Whether `event` passes every restriction except the limit.
    pub fn matches(&self, event: &Event) -> bool {
        (self.aggregate_types.is_empty() || self.aggregate_types.contains(&event.aggregate_type))
            && (self.aggregate_ids.is_empty() || self.aggregate_ids.contains(&event.aggregate_id))
            && self
                .resource_owner
                .as_ref()
                .map_or(true, |owner| owner == &event.resource_owner)
            && (self.event_types.is_empty() || self.event_types.contains(&event.event_type))
            && self
                .sequence_greater
                .map_or(true, |sequence| event.sequence > sequence)
    }
}

/// The append-only event log.
///
/// Implementations must make [`push`](Self::push) all-or-nothing: version
/// checks, unique constraint checks and the insert of every event happen in
/// one atomic unit, so that two concurrent pushes claiming the same unique
/// value cannot both pass. After a successful commit the new events are
/// published to the store's [`SubscriptionRegistry`](crate::subscription::SubscriptionRegistry).
///
/// Implementations include:
/// - `idcore-postgres`: production backend using one transaction per push
/// - `idcore-memory`: in-memory backend for tests and development
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends events atomically and returns them with their assigned
    /// sequences, versions and creation dates.
    ///
    /// # Errors
    ///
    /// - [`EventStoreError::ConcurrencyConflict`] if an expectation is stale
    /// - [`EventStoreError::AlreadyExists`] if an added unique constraint is held
    /// - [`EventStoreError::Internal`] on storage faults
    async fn push(&self, writes: EventWrites) -> EventStoreResult<Vec<Event>>;

    /// Reads events matching `query` in sequence order.
    async fn filter(&self, query: &EventQuery) -> EventStoreResult<Vec<Event>>;

    /// Highest sequence among events matching `query`, zero if none.
    async fn latest_sequence(&self, query: &EventQuery) -> EventStoreResult<Sequence>;
}

#[async_trait]
impl<T: EventStore + ?Sized> EventStore for Arc<T> {
    async fn push(&self, writes: EventWrites) -> EventStoreResult<Vec<Event>> {
        (**self).push(writes).await
    }

    async fn filter(&self, query: &EventQuery) -> EventStoreResult<Vec<Event>> {
        (**self).filter(query).await
    }

    async fn latest_sequence(&self, query: &EventQuery) -> EventStoreResult<Sequence> {
        (**self).latest_sequence(query).await
    }
}
