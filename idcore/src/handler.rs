//! Spooled event handlers and their persisted bookkeeping.
//!
//! A [`Handler`] is anything that consumes the log in order: a projection
//! writing read-model tables or a side-effect handler sending notifications.
//! The [`Spooler`](crate::spooler::Spooler) owns delivery, retries and the
//! watermark; the handler only reduces one event at a time.

use crate::errors::{EventStoreError, EventStoreResult, HandlerError, HandlerResult, Operation};
use crate::event::Event;
use crate::types::{AggregateType, Sequence};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Consumer of events of some aggregate types.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Unique name; the key of the handler's watermark and failure records.
    fn name(&self) -> &str;

    /// Aggregate types the handler is interested in.
    fn aggregate_types(&self) -> Vec<AggregateType>;

    /// Processes one event.
    ///
    /// Must be idempotent: after a crash the same event may be delivered
    /// again. [`HandlerError::InvalidEventMapping`] marks the event as
    /// impossible to process and skips it without retries.
    async fn reduce(&self, event: &Event) -> HandlerResult<()>;

    /// Called after every failed attempt.
    fn on_error(&self, event: &Event, error: &HandlerError, failure_count: u32) {
        warn!(
            handler = self.name(),
            sequence = %event.sequence,
            event_type = %event.event_type,
            failure_count,
            error = %error,
            "handler failed"
        );
    }

    /// Called after a batch completed without errors.
    fn on_success(&self, _watermark: Sequence) {}
}

#[async_trait]
impl<T: Handler + ?Sized> Handler for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn aggregate_types(&self) -> Vec<AggregateType> {
        (**self).aggregate_types()
    }

    async fn reduce(&self, event: &Event) -> HandlerResult<()> {
        (**self).reduce(event).await
    }

    fn on_error(&self, event: &Event, error: &HandlerError, failure_count: u32) {
        (**self).on_error(event, error, failure_count);
    }

    fn on_success(&self, watermark: Sequence) {
        (**self).on_success(watermark);
    }
}

/// Failure record of one event for one handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedEvent {
    /// Handler name.
    pub handler: String,
    /// Sequence of the failing event.
    pub sequence: Sequence,
    /// Number of failed attempts.
    pub failure_count: u32,
    /// Message of the most recent failure.
    pub last_error: String,
    /// Whether the event was given up on and the watermark moved past it.
    pub skipped: bool,
    /// Time of the most recent failure.
    pub last_failed_at: DateTime<Utc>,
}

/// End of a lock lease of length `lease` taken at `now`.
///
/// Fails instead of wrapping when the deadline is not a representable
/// timestamp.
pub fn lease_deadline(now: DateTime<Utc>, lease: Duration) -> EventStoreResult<DateTime<Utc>> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|lease| now.checked_add_signed(lease))
        .ok_or_else(|| {
            EventStoreError::internal(Operation::HandlerState, format!("lease of {lease:?} is out of range"))
        })
}

/// Persistence of watermarks, failure records, run timestamps and locks.
///
/// Only the spooler mutates this state.
#[async_trait]
pub trait HandlerStateStore: Send + Sync {
    /// Highest sequence the handler has finished, zero if none.
    async fn current_sequence(&self, handler: &str) -> EventStoreResult<Sequence>;

    /// Stores a new watermark. Implementations ignore values lower than the
    /// stored one so that the watermark never moves backward.
    async fn set_current_sequence(&self, handler: &str, sequence: Sequence) -> EventStoreResult<()>;

    /// Failure record of one event, if any.
    async fn failed_event(&self, handler: &str, sequence: Sequence) -> EventStoreResult<Option<FailedEvent>>;

    /// Increments the failure count of an event, creating the record on the
    /// first failure, and returns the updated record.
    async fn record_failure(
        &self,
        handler: &str,
        sequence: Sequence,
        error: &str,
        at: DateTime<Utc>,
    ) -> EventStoreResult<FailedEvent>;

    /// Flags an event as permanently skipped.
    async fn mark_skipped(&self, handler: &str, sequence: Sequence) -> EventStoreResult<()>;

    /// All failure records of a handler in sequence order.
    async fn failed_events(&self, handler: &str) -> EventStoreResult<Vec<FailedEvent>>;

    /// Stores the time of the last batch that completed without errors.
    async fn record_run(&self, handler: &str, at: DateTime<Utc>) -> EventStoreResult<()>;

    /// Time of the last batch that completed without errors.
    async fn last_run(&self, handler: &str) -> EventStoreResult<Option<DateTime<Utc>>>;

    /// Takes or renews the handler's lock for `lease`. Returns false if
    /// another owner holds an unexpired lock.
    async fn try_lock(
        &self,
        handler: &str,
        owner: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> EventStoreResult<bool>;

    /// Releases the lock if `owner` holds it.
    async fn unlock(&self, handler: &str, owner: &str) -> EventStoreResult<()>;
}

#[async_trait]
impl<T: HandlerStateStore + ?Sized> HandlerStateStore for Arc<T> {
    async fn current_sequence(&self, handler: &str) -> EventStoreResult<Sequence> {
        (**self).current_sequence(handler).await
    }

    async fn set_current_sequence(&self, handler: &str, sequence: Sequence) -> EventStoreResult<()> {
        (**self).set_current_sequence(handler, sequence).await
    }

    async fn failed_event(&self, handler: &str, sequence: Sequence) -> EventStoreResult<Option<FailedEvent>> {
        (**self).failed_event(handler, sequence).await
    }

    async fn record_failure(
        &self,
        handler: &str,
        sequence: Sequence,
        error: &str,
        at: DateTime<Utc>,
    ) -> EventStoreResult<FailedEvent> {
        (**self).record_failure(handler, sequence, error, at).await
    }

    async fn mark_skipped(&self, handler: &str, sequence: Sequence) -> EventStoreResult<()> {
        (**self).mark_skipped(handler, sequence).await
    }

    async fn failed_events(&self, handler: &str) -> EventStoreResult<Vec<FailedEvent>> {
        (**self).failed_events(handler).await
    }

    async fn record_run(&self, handler: &str, at: DateTime<Utc>) -> EventStoreResult<()> {
        (**self).record_run(handler, at).await
    }

    async fn last_run(&self, handler: &str) -> EventStoreResult<Option<DateTime<Utc>>> {
        (**self).last_run(handler).await
    }

    async fn try_lock(
        &self,
        handler: &str,
        owner: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> EventStoreResult<bool> {
        (**self).try_lock(handler, owner, lease, now).await
    }

    async fn unlock(&self, handler: &str, owner: &str) -> EventStoreResult<()> {
        (**self).unlock(handler, owner).await
    }
}
