//! Error types for idcore.
//!
//! Each layer has its own error enum so that callers can tell a retryable
//! concurrency conflict apart from a uniqueness violation or a storage fault:
//!
//! - **EventStoreError**: append and read failures of the event log
//! - **ReduceError**: an event could not be turned into a projection statement
//! - **HandlerError**: anything a spooled handler can fail with
//! - **CommandError**: failures surfaced synchronously to command callers
//! - **QueryError**: failures while reading projections

use crate::types::{AggregateId, AggregateType, AggregateVersion, EventType, Sequence};
use std::fmt;
use thiserror::Error;

/// Storage operation in which a backend failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Appending events.
    Push,
    /// Reading events.
    Filter,
    /// Reading the latest sequence.
    LatestSequence,
    /// Opening a transaction.
    BeginTransaction,
    /// Committing a transaction.
    CommitTransaction,
    /// Executing a projection statement.
    Execute,
    /// Reading projection rows.
    Search,
    /// Reading or writing handler bookkeeping.
    HandlerState,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Push => "push",
            Self::Filter => "filter",
            Self::LatestSequence => "latest_sequence",
            Self::BeginTransaction => "begin_transaction",
            Self::CommitTransaction => "commit_transaction",
            Self::Execute => "execute",
            Self::Search => "search",
            Self::HandlerState => "handler_state",
        };
        f.write_str(name)
    }
}

/// Errors returned by [`EventStore`](crate::store::EventStore) implementations.
#[derive(Debug, Clone, Error)]
pub enum EventStoreError {
    /// The caller's expected aggregate version is stale.
    ///
    /// The caller should reload the aggregate and retry the command.
    #[error("concurrency conflict on {aggregate_type}/{aggregate_id}: expected {expected}, found version {actual}")]
    ConcurrencyConflict {
        /// Type of the conflicting aggregate.
        aggregate_type: AggregateType,
        /// Id of the conflicting aggregate.
        aggregate_id: AggregateId,
        /// What the caller expected.
        expected: String,
        /// The version found in the store.
        actual: AggregateVersion,
    },

    /// A unique constraint is already held by another aggregate.
    #[error("{message}")]
    AlreadyExists {
        /// Constraint table, e.g. `usernames`.
        unique_type: String,
        /// User facing message attached to the constraint.
        message: String,
    },

    /// The write batch was malformed.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An event payload could not be serialized.
    #[error("failed to serialize payload of {event_type}: {detail}")]
    SerializationFailed {
        /// Event type whose payload failed.
        event_type: EventType,
        /// Serializer message.
        detail: String,
    },

    /// The backend aborted the operation, e.g. on a serialization failure or
    /// a deadlock. Running it again may succeed.
    #[error("transient failure during {operation}: {detail}")]
    Transient {
        /// Operation in which the failure happened.
        operation: Operation,
        /// Backend message.
        detail: String,
    },

    /// Storage or transport fault.
    #[error("event store failure during {operation}: {detail}")]
    Internal {
        /// Operation in which the failure happened.
        operation: Operation,
        /// Backend message.
        detail: String,
    },
}

impl EventStoreError {
    /// Shorthand for [`EventStoreError::Internal`].
    pub fn internal(operation: Operation, detail: impl fmt::Display) -> Self {
        Self::Internal {
            operation,
            detail: detail.to_string(),
        }
    }

    /// Whether reloading state and retrying may succeed.
    pub const fn is_concurrency_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }

    /// Whether reloading state and running the operation again may succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. } | Self::Transient { .. })
    }
}

/// Errors produced while reducing an event into a statement.
#[derive(Debug, Clone, Error)]
pub enum ReduceError {
    /// The payload does not have the shape the reducer expects.
    #[error("invalid event mapping for {event_type} at sequence {sequence}: {detail}")]
    InvalidEventMapping {
        /// Type of the offending event.
        event_type: EventType,
        /// Sequence of the offending event.
        sequence: Sequence,
        /// Deserializer message.
        detail: String,
    },

    /// The reducer failed for another reason.
    #[error("reduce failed: {0}")]
    Internal(String),
}

/// Errors a spooled [`Handler`](crate::handler::Handler) can return.
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    /// The event can never be processed by this handler.
    #[error(transparent)]
    InvalidEventMapping(ReduceError),

    /// Reading or writing the event log failed.
    #[error(transparent)]
    Store(#[from] EventStoreError),

    /// A command issued by the handler failed.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// Any other failure, e.g. a projection write or an external call.
    #[error("{0}")]
    Internal(String),
}

impl HandlerError {
    /// Permanent failures are skipped without retries.
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::InvalidEventMapping(_))
    }

    /// Shorthand for [`HandlerError::Internal`].
    pub fn internal(detail: impl fmt::Display) -> Self {
        Self::Internal(detail.to_string())
    }
}

impl From<ReduceError> for HandlerError {
    fn from(error: ReduceError) -> Self {
        match error {
            ReduceError::InvalidEventMapping { .. } => Self::InvalidEventMapping(error),
            ReduceError::Internal(detail) => Self::Internal(detail),
        }
    }
}

/// Errors surfaced synchronously to command callers.
#[derive(Debug, Clone, Error)]
pub enum CommandError {
    /// A unique value is already taken; shown to the end user, never retried.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The addressed aggregate does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The aggregate is not in a state that allows the command.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// The command input is invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Optimistic concurrency kept failing after every retry.
    #[error("concurrency conflict after {attempts} attempts")]
    ConcurrencyConflict {
        /// Number of attempts made.
        attempts: u32,
    },

    /// Event store failure that is not a uniqueness violation.
    #[error("event store error: {0}")]
    EventStore(EventStoreError),
}

impl From<EventStoreError> for CommandError {
    fn from(error: EventStoreError) -> Self {
        match error {
            EventStoreError::AlreadyExists { message, .. } => Self::AlreadyExists(message),
            EventStoreError::ConcurrencyConflict { .. } | EventStoreError::Transient { .. } => {
                Self::ConcurrencyConflict { attempts: 1 }
            }
            other => Self::EventStore(other),
        }
    }
}

/// Errors produced by the query layer.
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    /// No row matched.
    #[error("not found: {0}")]
    NotFound(String),

    /// The search request was malformed.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Reading the projection failed.
    #[error("query failed: {0}")]
    Internal(String),
}

/// Result alias for event store operations.
pub type EventStoreResult<T> = Result<T, EventStoreError>;

/// Result alias for command execution.
pub type CommandResult<T> = Result<T, CommandError>;

/// Result alias for handler operations.
pub type HandlerResult<T> = Result<T, HandlerError>;

/// Result alias for queries.
pub type QueryResult<T> = Result<T, QueryError>;
