//! Replay-based "already handled" detection for side-effect handlers.
//!
//! Sending an email is not idempotent, but spooled handlers see events at
//! least once. Before performing an effect for event `E` a handler scans the
//! aggregate's events after `E` for a completion marker; after the effect it
//! appends that marker through the command layer. A later "code added" event
//! of the same kind counts as a marker too, since it replaces the earlier
//! code before it was delivered.

use crate::clock::Clock;
use crate::errors::EventStoreResult;
use crate::event::Event;
use crate::store::{EventQuery, EventStore};
use crate::types::EventType;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::debug;

fn later_events_query(event: &Event, event_types: &[&str]) -> EventQuery {
    EventQuery::new()
        .aggregate(event.aggregate_type.clone(), event.aggregate_id.clone())
        .event_types(event_types.iter().map(|event_type| EventType::new(*event_type)))
        .sequence_greater(event.sequence)
}

/// Whether any event of `event_types` follows `event` on its aggregate.
pub async fn already_handled<S: EventStore + ?Sized>(
    store: &S,
    event: &Event,
    event_types: &[&str],
) -> EventStoreResult<bool> {
    let later = store.filter(&later_events_query(event, event_types).limit(1)).await?;
    if let Some(marker) = later.first() {
        debug!(
            sequence = %event.sequence,
            marker = %marker.event_type,
            marker_sequence = %marker.sequence,
            "already handled"
        );
    }
    Ok(!later.is_empty())
}

/// Like [`already_handled`], but a later event only counts if `matches`
/// accepts it, e.g. because it carries the same correlation id.
pub async fn already_handled_matching<S, F>(
    store: &S,
    event: &Event,
    event_types: &[&str],
    matches: F,
) -> EventStoreResult<bool>
where
    S: EventStore + ?Sized,
    F: Fn(&Event) -> bool + Send,
{
    let later = store.filter(&later_events_query(event, event_types)).await?;
    Ok(later.iter().any(matches))
}

/// Instant at which something created at `created_at` stops being valid.
///
/// `None` when the deadline lies beyond what a timestamp can represent, i.e.
/// it never expires.
pub fn expires_at(created_at: DateTime<Utc>, expiry: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(expiry)
        .ok()
        .and_then(|expiry| created_at.checked_add_signed(expiry))
}

/// Whether a code created with `event` and valid for `expiry` has expired.
pub fn code_expired(clock: &dyn Clock, event: &Event, expiry: Duration) -> bool {
    expires_at(event.creation_date, expiry).is_some_and(|deadline| deadline < clock.now())
}

/// Expired codes are treated as handled: they are never sent.
pub async fn code_already_handled_or_expired<S: EventStore + ?Sized>(
    store: &S,
    clock: &dyn Clock,
    event: &Event,
    expiry: Duration,
    event_types: &[&str],
) -> EventStoreResult<bool> {
    if code_expired(clock, event, expiry) {
        debug!(sequence = %event.sequence, "code expired");
        return Ok(true);
    }
    already_handled(store, event, event_types).await
}
