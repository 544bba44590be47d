use async_trait::async_trait;
use chrono::{DateTime, Utc};
use idcore::{
    lease_deadline, EventStoreError, EventStoreResult, FailedEvent, HandlerStateStore, Operation,
    Sequence,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
struct Lease {
    owner: String,
    until: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Records {
    watermarks: HashMap<String, Sequence>,
    failures: BTreeMap<(String, Sequence), FailedEvent>,
    runs: HashMap<String, DateTime<Utc>>,
    locks: HashMap<String, Lease>,
}

/// Handler watermarks, failure records, run timestamps and locks in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryHandlerStateStore {
    records: Arc<RwLock<Records>>,
}

impl InMemoryHandlerStateStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HandlerStateStore for InMemoryHandlerStateStore {
    async fn current_sequence(&self, handler: &str) -> EventStoreResult<Sequence> {
        Ok(self
            .records
            .read()
            .watermarks
            .get(handler)
            .copied()
            .unwrap_or_default())
    }

    async fn set_current_sequence(&self, handler: &str, sequence: Sequence) -> EventStoreResult<()> {
        let mut records = self.records.write();
        let watermark = records.watermarks.entry(handler.to_string()).or_default();
        *watermark = (*watermark).max(sequence);
        Ok(())
    }

    async fn failed_event(&self, handler: &str, sequence: Sequence) -> EventStoreResult<Option<FailedEvent>> {
        Ok(self
            .records
            .read()
            .failures
            .get(&(handler.to_string(), sequence))
            .cloned())
    }

    async fn record_failure(
        &self,
        handler: &str,
        sequence: Sequence,
        error: &str,
        at: DateTime<Utc>,
    ) -> EventStoreResult<FailedEvent> {
        let mut records = self.records.write();
        let failed = records
            .failures
            .entry((handler.to_string(), sequence))
            .or_insert_with(|| FailedEvent {
                handler: handler.to_string(),
                sequence,
                failure_count: 0,
                last_error: String::new(),
                skipped: false,
                last_failed_at: at,
            });
        failed.failure_count += 1;
        failed.last_error = error.to_string();
        failed.last_failed_at = at;
        Ok(failed.clone())
    }

    async fn mark_skipped(&self, handler: &str, sequence: Sequence) -> EventStoreResult<()> {
        let mut records = self.records.write();
        let failed = records
            .failures
            .get_mut(&(handler.to_string(), sequence))
            .ok_or_else(|| {
                EventStoreError::internal(
                    Operation::HandlerState,
                    format!("no failure recorded for {handler} at {sequence}"),
                )
            })?;
        failed.skipped = true;
        Ok(())
    }

    async fn failed_events(&self, handler: &str) -> EventStoreResult<Vec<FailedEvent>> {
        Ok(self
            .records
            .read()
            .failures
            .values()
            .filter(|failed| failed.handler == handler)
            .cloned()
            .collect())
    }

    async fn record_run(&self, handler: &str, at: DateTime<Utc>) -> EventStoreResult<()> {
        let _ = self.records.write().runs.insert(handler.to_string(), at);
        Ok(())
    }

    async fn last_run(&self, handler: &str) -> EventStoreResult<Option<DateTime<Utc>>> {
        Ok(self.records.read().runs.get(handler).copied())
    }

    async fn try_lock(
        &self,
        handler: &str,
        owner: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> EventStoreResult<bool> {
        let until = lease_deadline(now, lease)?;
        let mut records = self.records.write();

        let free = records
            .locks
            .get(handler)
            .map_or(true, |held| held.owner == owner || held.until <= now);
        if free {
            let _ = records.locks.insert(
                handler.to_string(),
                Lease {
                    owner: owner.to_string(),
                    until,
                },
            );
        }
        Ok(free)
    }

    async fn unlock(&self, handler: &str, owner: &str) -> EventStoreResult<()> {
        let mut records = self.records.write();
        if records
            .locks
            .get(handler)
            .is_some_and(|held| held.owner == owner)
        {
            let _ = records.locks.remove(handler);
        }
        Ok(())
    }
}
