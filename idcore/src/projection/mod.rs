//! The reduction engine.
//!
//! Projections register reducers per `(aggregate_type, event_type)`; each
//! reducer is a pure function from an event to a [`Statement`]. A
//! [`ProjectionHandler`] plugs a projection into the spooler and applies its
//! statements through a backend's [`StatementExecutor`].

mod handler;
mod reducer;
pub mod sql;
mod statement;

pub use handler::ProjectionHandler;
pub use reducer::{AggregateReducer, EventReducer, Projection, ReduceFn, ReducerRegistry};
pub use statement::{
    Column, ColumnValue, Condition, Statement, StatementKind, AGGREGATE_ID, CHANGE_DATE,
    CREATION_DATE, RESOURCE_OWNER, SEQUENCE,
};

use crate::errors::EventStoreResult;
use async_trait::async_trait;
use std::sync::Arc;

/// Applies statements to projection tables.
///
/// All commands of one statement run in one transaction. Implementations
/// honour the row-level idempotency rules documented on [`Statement`].
#[async_trait]
pub trait StatementExecutor: Send + Sync {
    /// Applies one statement.
    async fn execute(&self, statement: &Statement) -> EventStoreResult<()>;
}

#[async_trait]
impl<T: StatementExecutor + ?Sized> StatementExecutor for Arc<T> {
    async fn execute(&self, statement: &Statement) -> EventStoreResult<()> {
        (**self).execute(statement).await
    }
}
