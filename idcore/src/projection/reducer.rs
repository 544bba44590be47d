use super::statement::Statement;
use crate::errors::ReduceError;
use crate::event::Event;
use crate::types::{AggregateType, EventType};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Pure function from one event to the statement it causes.
pub type ReduceFn = Arc<dyn Fn(&Event) -> Result<Statement, ReduceError> + Send + Sync>;

/// A reducer bound to one event type.
#[derive(Clone)]
pub struct EventReducer {
    /// Event type handled.
    pub event_type: EventType,
    /// The reduction.
    pub reduce: ReduceFn,
}

impl EventReducer {
    /// Binds `reduce` to `event_type`.
    pub fn new<F>(event_type: impl Into<String>, reduce: F) -> Self
    where
        F: Fn(&Event) -> Result<Statement, ReduceError> + Send + Sync + 'static,
    {
        Self {
            event_type: EventType::new(event_type),
            reduce: Arc::new(reduce),
        }
    }
}

impl fmt::Debug for EventReducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventReducer")
            .field("event_type", &self.event_type)
            .finish_non_exhaustive()
    }
}

/// The reducers a projection registers for one aggregate type.
#[derive(Debug, Clone)]
pub struct AggregateReducer {
    /// Aggregate type handled.
    pub aggregate_type: AggregateType,
    /// Reducers by event type.
    pub event_reducers: Vec<EventReducer>,
}

impl AggregateReducer {
    /// Creates an empty reducer set for `aggregate_type`.
    pub fn new(aggregate_type: impl Into<String>) -> Self {
        Self {
            aggregate_type: AggregateType::new(aggregate_type),
            event_reducers: Vec::new(),
        }
    }

    /// Adds a reducer for `event_type`.
    #[must_use]
    pub fn on<F>(mut self, event_type: impl Into<String>, reduce: F) -> Self
    where
        F: Fn(&Event) -> Result<Statement, ReduceError> + Send + Sync + 'static,
    {
        self.event_reducers.push(EventReducer::new(event_type, reduce));
        self
    }
}

/// A read model built by reducing events into one table.
///
/// ```ignore
/// impl Projection for UserProjection {
///     fn name(&self) -> &str { "projections.users" }
///     fn table(&self) -> &str { USER_TABLE }
///     fn reducers(&self) -> Vec<AggregateReducer> {
///         vec![AggregateReducer::new("user")
///             .on("user.human.added", reduce_added)
///             .on("user.removed", |event| Ok(Statement::delete(event, USER_TABLE)))]
///     }
/// }
/// ```
pub trait Projection: Send + Sync {
    /// Handler name, used as the key of the projection's watermark.
    fn name(&self) -> &str;

    /// Primary table.
    fn table(&self) -> &str;

    /// Columns identifying one row of [`table`](Self::table).
    fn key_columns(&self) -> Vec<String> {
        vec![super::statement::AGGREGATE_ID.to_string()]
    }

    /// Reducers by aggregate type and event type.
    fn reducers(&self) -> Vec<AggregateReducer>;
}

/// Dispatch table from `(aggregate_type, event_type)` to reducer.
///
/// Built once from [`Projection::reducers`]; events without a registered
/// reducer reduce to a no-op statement.
#[derive(Debug, Clone, Default)]
pub struct ReducerRegistry {
    aggregate_types: Vec<AggregateType>,
    reducers: HashMap<(AggregateType, EventType), EventReducer>,
}

impl ReducerRegistry {
    /// Builds the dispatch table of a projection.
    pub fn new(projection: &dyn Projection) -> Self {
        Self::from_reducers(projection.reducers())
    }

    /// Builds the dispatch table from explicit reducers.
    ///
    /// A later registration for the same pair replaces an earlier one.
    pub fn from_reducers(aggregate_reducers: Vec<AggregateReducer>) -> Self {
        let mut registry = Self::default();
        for aggregate in aggregate_reducers {
            if !registry.aggregate_types.contains(&aggregate.aggregate_type) {
                registry.aggregate_types.push(aggregate.aggregate_type.clone());
            }
            for reducer in aggregate.event_reducers {
                let key = (aggregate.aggregate_type.clone(), reducer.event_type.clone());
                let _ = registry.reducers.insert(key, reducer);
            }
        }
        registry
    }

    /// Aggregate types with at least one registration.
    pub fn aggregate_types(&self) -> &[AggregateType] {
        &self.aggregate_types
    }

    /// Whether a reducer is registered for the event.
    pub fn handles(&self, event: &Event) -> bool {
        self.reducers
            .contains_key(&(event.aggregate_type.clone(), event.event_type.clone()))
    }

    /// Reduces one event.
    ///
    /// # Errors
    ///
    /// Propagates the reducer's error, typically
    /// [`ReduceError::InvalidEventMapping`].
    pub fn reduce(&self, event: &Event) -> Result<Statement, ReduceError> {
        match self
            .reducers
            .get(&(event.aggregate_type.clone(), event.event_type.clone()))
        {
            Some(reducer) => (reducer.reduce)(event),
            None => Ok(Statement::no_op(event)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projection::statement::{Column, StatementKind};
    use crate::types::{AggregateId, AggregateVersion, EditorUser, ResourceOwner, Sequence};
    use chrono::Utc;
    use serde::Deserialize;
    use serde_json::json;

    struct Things;

    #[derive(Deserialize)]
    struct Renamed {
        name: String,
    }

    impl Projection for Things {
        fn name(&self) -> &str {
            "projections.things"
        }

        fn table(&self) -> &str {
            "projections.things"
        }

        fn reducers(&self) -> Vec<AggregateReducer> {
            vec![AggregateReducer::new("thing").on("thing.renamed", |event| {
                let renamed: Renamed = event.payload_as()?;
                Ok(Statement::update(
                    event,
                    "projections.things",
                    vec![Column::new("name", renamed.name)],
                ))
            })]
        }
    }

    fn event(event_type: &str, payload: serde_json::Value) -> Event {
        Event {
            sequence: Sequence::new(3),
            previous_aggregate_sequence: Sequence::new(1),
            aggregate_type: AggregateType::new("thing"),
            aggregate_id: AggregateId::try_new("t1").unwrap(),
            aggregate_version: AggregateVersion::new(2),
            resource_owner: ResourceOwner::try_new("org1").unwrap(),
            event_type: EventType::new(event_type),
            creation_date: Utc::now(),
            editor_user: EditorUser::new("editor"),
            payload: Some(payload),
        }
    }

    #[test]
    fn registered_event_is_dispatched_to_its_reducer() {
        let registry = ReducerRegistry::new(&Things);

        let statement = registry.reduce(&event("thing.renamed", json!({"name": "x"}))).unwrap();

        assert!(matches!(statement.kind, StatementKind::Update { .. }));
        assert_eq!(registry.aggregate_types(), [AggregateType::new("thing")]);
    }

    #[test]
    fn unregistered_event_reduces_to_no_op() {
        let registry = ReducerRegistry::new(&Things);

        let statement = registry.reduce(&event("thing.painted", json!({}))).unwrap();

        assert_eq!(statement.kind, StatementKind::NoOp);
        assert_eq!(statement.sequence, Sequence::new(3));
    }

    #[test]
    fn malformed_payload_is_an_invalid_event_mapping() {
        let registry = ReducerRegistry::new(&Things);

        let result = registry.reduce(&event("thing.renamed", json!({"name": 42})));

        assert!(matches!(result, Err(ReduceError::InvalidEventMapping { .. })));
    }
}
