//! The event envelope and typed payloads.
//!
//! Every event shares one envelope ([`Event`]) holding the aggregate identity,
//! ordering data and audit fields. The type specific data lives in `payload`,
//! selected by `event_type`. Domain crates describe their payloads with
//! [`EventPayload`] and turn them into [`PendingEvent`]s for appending.

use crate::constraint::UniqueConstraint;
use crate::errors::{EventStoreError, ReduceError};
use crate::types::{
    AggregateId, AggregateType, AggregateVersion, EditorUser, EventType, ResourceOwner, Sequence,
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identity of one aggregate instance together with its owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregateRef {
    /// Aggregate type.
    pub aggregate_type: AggregateType,
    /// Aggregate id.
    pub aggregate_id: AggregateId,
    /// Owning organisation.
    pub resource_owner: ResourceOwner,
}

impl AggregateRef {
    /// Creates a reference to an aggregate instance.
    pub const fn new(
        aggregate_type: AggregateType,
        aggregate_id: AggregateId,
        resource_owner: ResourceOwner,
    ) -> Self {
        Self {
            aggregate_type,
            aggregate_id,
            resource_owner,
        }
    }

    /// `(type, id)` pair used for per-aggregate bookkeeping.
    pub fn key(&self) -> (AggregateType, AggregateId) {
        (self.aggregate_type.clone(), self.aggregate_id.clone())
    }
}

/// An immutable, persisted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Store-wide position, strictly increasing.
    pub sequence: Sequence,
    /// Sequence of the previous event of the same aggregate, zero for the first.
    pub previous_aggregate_sequence: Sequence,
    /// Aggregate type.
    pub aggregate_type: AggregateType,
    /// Aggregate id.
    pub aggregate_id: AggregateId,
    /// Version of the aggregate after this event.
    pub aggregate_version: AggregateVersion,
    /// Owning organisation.
    pub resource_owner: ResourceOwner,
    /// Event type tag selecting the payload shape.
    pub event_type: EventType,
    /// Commit time assigned by the store.
    pub creation_date: DateTime<Utc>,
    /// Who caused the event.
    pub editor_user: EditorUser,
    /// Type specific data.
    pub payload: Option<Value>,
}

impl Event {
    /// Deserializes the payload into `T`.
    ///
    /// A missing payload is treated as JSON `null`, so unit-like payloads
    /// deserialize from events that carry no data.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ReduceError> {
        let value = self.payload.clone().unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|error| ReduceError::InvalidEventMapping {
            event_type: self.event_type.clone(),
            sequence: self.sequence,
            detail: error.to_string(),
        })
    }

    /// Aggregate identity of this event.
    pub fn aggregate(&self) -> AggregateRef {
        AggregateRef::new(
            self.aggregate_type.clone(),
            self.aggregate_id.clone(),
            self.resource_owner.clone(),
        )
    }

    /// Whether this event has the given type.
    pub fn is(&self, event_type: &str) -> bool {
        self.event_type.as_ref() == event_type
    }
}

/// Typed payload of one event type.
///
/// Implemented by the payload structs of domain crates; the implementation
/// ties the Rust type to its wire tag and declares its uniqueness claims.
pub trait EventPayload: Serialize {
    /// Wire tag of the event type.
    const EVENT_TYPE: &'static str;

    /// Uniqueness claims made or released by this event.
    fn unique_constraints(&self, _aggregate: &AggregateRef) -> Vec<UniqueConstraint> {
        Vec::new()
    }

    /// Whether the payload is stored; marker events carry no data.
    fn has_data(&self) -> bool {
        true
    }

    /// The event type as a vocabulary value.
    fn event_type() -> EventType {
        EventType::new(Self::EVENT_TYPE)
    }
}

/// An event that has not been appended yet.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEvent {
    /// Target aggregate.
    pub aggregate: AggregateRef,
    /// Event type tag.
    pub event_type: EventType,
    /// Who causes the event.
    pub editor_user: EditorUser,
    /// Serialized payload.
    pub payload: Option<Value>,
    /// Claims and releases applied atomically with the append.
    pub unique_constraints: Vec<UniqueConstraint>,
}

impl PendingEvent {
    /// Builds a pending event from raw parts.
    pub fn new(aggregate: AggregateRef, event_type: EventType, editor_user: EditorUser) -> Self {
        Self {
            aggregate,
            event_type,
            editor_user,
            payload: None,
            unique_constraints: Vec::new(),
        }
    }

    /// Builds a pending event from a typed payload.
    pub fn from_payload<P: EventPayload>(
        aggregate: AggregateRef,
        editor_user: EditorUser,
        payload: &P,
    ) -> Result<Self, EventStoreError> {
        let unique_constraints = payload.unique_constraints(&aggregate);
        let data = if payload.has_data() {
            Some(serde_json::to_value(payload).map_err(|error| {
                EventStoreError::SerializationFailed {
                    event_type: P::event_type(),
                    detail: error.to_string(),
                }
            })?)
        } else {
            None
        };

        Ok(Self {
            aggregate,
            event_type: P::event_type(),
            editor_user,
            payload: data,
            unique_constraints,
        })
    }

    /// Sets the raw payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Adds a uniqueness claim or release.
    #[must_use]
    pub fn with_constraint(mut self, constraint: UniqueConstraint) -> Self {
        self.unique_constraints.push(constraint);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Renamed {
        name: String,
    }

    impl EventPayload for Renamed {
        const EVENT_TYPE: &'static str = "thing.renamed";

        fn unique_constraints(&self, aggregate: &AggregateRef) -> Vec<UniqueConstraint> {
            vec![UniqueConstraint::add(
                "names",
                format!("{}{}", self.name, aggregate.resource_owner),
                "name taken",
            )]
        }
    }

    fn aggregate() -> AggregateRef {
        AggregateRef::new(
            AggregateType::new("thing"),
            AggregateId::try_new("t1").unwrap(),
            ResourceOwner::try_new("org1").unwrap(),
        )
    }

    fn stored(payload: Option<Value>) -> Event {
        Event {
            sequence: Sequence::new(7),
            previous_aggregate_sequence: Sequence::zero(),
            aggregate_type: AggregateType::new("thing"),
            aggregate_id: AggregateId::try_new("t1").unwrap(),
            aggregate_version: AggregateVersion::new(1),
            resource_owner: ResourceOwner::try_new("org1").unwrap(),
            event_type: EventType::new("thing.renamed"),
            creation_date: Utc::now(),
            editor_user: EditorUser::new("editor"),
            payload,
        }
    }

    #[test]
    fn pending_event_carries_payload_and_constraints() {
        let pending = PendingEvent::from_payload(
            aggregate(),
            EditorUser::new("editor"),
            &Renamed {
                name: "gigi".to_string(),
            },
        )
        .unwrap();

        assert_eq!(pending.event_type, EventType::new("thing.renamed"));
        assert_eq!(pending.payload, Some(json!({"name": "gigi"})));
        assert_eq!(pending.unique_constraints[0].unique_field(), "gigiorg1");
    }

    #[test]
    fn payload_as_maps_shape_errors_to_invalid_event_mapping() {
        let event = stored(Some(json!({"unexpected": true})));

        let result = event.payload_as::<Renamed>();

        assert!(matches!(
            result,
            Err(ReduceError::InvalidEventMapping { sequence, .. }) if sequence == Sequence::new(7)
        ));
    }

    #[test]
    fn payload_as_reads_matching_payload() {
        let event = stored(Some(json!({"name": "gigi"})));

        let renamed: Renamed = event.payload_as().unwrap();

        assert_eq!(renamed.name, "gigi");
        assert!(event.is("thing.renamed"));
    }
}
