//! # idcore
//!
//! Event-sourcing and projection engine for identity and access management.
//!
//! The crate defines the mechanism by which aggregates, events and
//! projections are stored, reduced and reacted to:
//!
//! - [`store`]: the append-only event log with optimistic concurrency and
//!   unique constraints enforced atomically with the append
//! - [`event`] and [`constraint`]: the event envelope, typed payloads and
//!   declarative uniqueness claims
//! - [`projection`]: reducers turning events into idempotent relational
//!   statements
//! - [`spooler`] and [`handler`]: ordered catch-up delivery with watermarks,
//!   retries and poison-event containment
//! - [`command`] and [`query`]: the write and read sides built on top
//! - [`idempotency`]: at-most-once external effects under at-least-once
//!   delivery
//!
//! Storage backends live in separate crates (`idcore-memory`,
//! `idcore-postgres`); reusable backend contract tests live in
//! `idcore-testing`.
//!
//! ```ignore
//! let registry = Arc::new(SubscriptionRegistry::new());
//! let store = Arc::new(InMemoryEventStore::with_registry(registry.clone()));
//! let spooler = Spooler::new(store.clone(), state, registry, SpoolerConfig::default());
//! let handle = spooler.spawn(Arc::new(ProjectionHandler::new(UserProjection, db)));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod clock;
pub mod command;
pub mod config;
pub mod constraint;
pub mod errors;
pub mod event;
pub mod handler;
pub mod idempotency;
pub mod projection;
pub mod query;
pub mod spooler;
pub mod store;
pub mod subscription;
pub mod types;

pub use clock::{Clock, SharedClock, SystemClock};
pub use command::{Commands, WriteModel, WriteModelState};
pub use config::{CommandConfig, IdcoreConfig, SpoolerConfig, SubscriptionConfig};
pub use constraint::{UniqueConstraint, UniqueConstraintAction};
pub use errors::{
    CommandError, CommandResult, EventStoreError, EventStoreResult, HandlerError, HandlerResult,
    Operation, QueryError, QueryResult, ReduceError,
};
pub use event::{AggregateRef, Event, EventPayload, PendingEvent};
pub use handler::{lease_deadline, FailedEvent, Handler, HandlerStateStore};
pub use projection::{
    Projection, ProjectionHandler, ReducerRegistry, Statement, StatementExecutor, StatementKind,
};
pub use query::{ProjectionReader, Queries, SearchQuery, SearchRequest, SearchResponse};
pub use spooler::{HandlerState, HandlerStatus, Spooler, SpoolerHandle, TickReport};
pub use store::{EventQuery, EventStore, EventWrites, ExpectedVersion};
pub use subscription::{Subscription, SubscriptionRegistry};
pub use types::{
    AggregateId, AggregateType, AggregateVersion, EditorUser, EventType, ResourceOwner, Sequence,
};
