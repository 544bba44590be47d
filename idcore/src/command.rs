//! Command layer helpers.
//!
//! Commands rebuild the state they validate against by replaying events into
//! a [`WriteModel`], decide, and append with an expectation on the version
//! they saw. A stale expectation surfaces as a concurrency conflict, which
//! [`Commands::execute`] retries by running the whole command again.

use crate::config::CommandConfig;
use crate::errors::{CommandError, CommandResult};
use crate::event::Event;
use crate::store::{EventQuery, EventStore, EventWrites, ExpectedVersion};
use crate::types::{AggregateVersion, Sequence};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, instrument, warn};

/// State a command validates against, rebuilt by replay.
pub trait WriteModel: Send {
    /// Events that make up the model, in sequence order.
    fn query(&self) -> EventQuery;

    /// Folds one event into the model.
    fn reduce(&mut self, event: &Event);
}

/// A replayed write model together with the position it was replayed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteModelState<W> {
    /// The folded model.
    pub model: W,
    /// Version of the aggregate after the last replayed event.
    pub version: AggregateVersion,
    /// Sequence of the last replayed event.
    pub sequence: Sequence,
}

impl<W> WriteModelState<W> {
    /// Whether no event was replayed.
    pub fn is_new(&self) -> bool {
        self.version == AggregateVersion::initial()
    }

    /// Expectation to append with so that concurrent writers are detected.
    pub fn expected_version(&self) -> ExpectedVersion {
        if self.is_new() {
            ExpectedVersion::New
        } else {
            ExpectedVersion::Exact(self.version)
        }
    }
}

/// Entry point of command handlers.
#[derive(Debug, Clone)]
pub struct Commands<S> {
    store: S,
    config: CommandConfig,
}

impl<S: EventStore> Commands<S> {
    /// Creates the command layer over `store`.
    pub const fn new(store: S, config: CommandConfig) -> Self {
        Self { store, config }
    }

    /// The underlying store.
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Replays `model` from the log.
    #[instrument(name = "commands.load", skip(self, model))]
    pub async fn load<W: WriteModel>(&self, mut model: W) -> CommandResult<WriteModelState<W>> {
        let events = self.store.filter(&model.query()).await?;
        let mut version = AggregateVersion::initial();
        let mut sequence = Sequence::zero();
        for event in &events {
            model.reduce(event);
            version = event.aggregate_version;
            sequence = event.sequence;
        }
        debug!(replayed = events.len(), version = %version, "write model loaded");

        Ok(WriteModelState {
            model,
            version,
            sequence,
        })
    }

    /// Appends `writes`, mapping store failures to command errors.
    #[instrument(name = "commands.push", skip(self, writes), fields(events = writes.events().len()))]
    pub async fn push(&self, writes: EventWrites) -> CommandResult<Vec<Event>> {
        Ok(self.store.push(writes).await?)
    }

    /// Runs `command`, re-running it while it fails with a concurrency
    /// conflict, up to the configured number of attempts.
    ///
    /// Every attempt must reload its write models; retrying with stale state
    /// would conflict again.
    pub async fn execute<T, F, Fut>(&self, mut command: F) -> CommandResult<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = CommandResult<T>> + Send,
    {
        let max_attempts = self.config.max_attempts.into_inner();
        let mut attempt = 1;
        loop {
            let delay = with_jitter(self.config.delay_for_attempt(attempt));
            if !delay.is_zero() {
                sleep(delay).await;
            }
            match command().await {
                Err(CommandError::ConcurrencyConflict { .. }) if attempt < max_attempts => {
                    warn!(attempt, max_attempts, "concurrency conflict, retrying command");
                    attempt += 1;
                }
                Err(CommandError::ConcurrencyConflict { .. }) => {
                    return Err(CommandError::ConcurrencyConflict { attempts: attempt });
                }
                other => return other,
            }
        }
    }
}

/// Adds up to 50% random jitter so that conflicting writers spread out.
fn with_jitter(delay: Duration) -> Duration {
    let max_jitter = u64::try_from(delay.as_millis() / 2).unwrap_or(u64::MAX);
    if max_jitter == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::rng().random_range(0..=max_jitter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BaseDelayMs, MaxAttempts};
    use crate::errors::{EventStoreError, EventStoreResult};
    use crate::types::{AggregateId, AggregateType};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ConflictingStore;

    #[async_trait]
    impl EventStore for ConflictingStore {
        async fn push(&self, _writes: EventWrites) -> EventStoreResult<Vec<Event>> {
            Err(EventStoreError::ConcurrencyConflict {
                aggregate_type: AggregateType::new("user"),
                aggregate_id: AggregateId::try_new("u1").unwrap(),
                expected: "a new aggregate".to_string(),
                actual: AggregateVersion::new(1),
            })
        }

        async fn filter(&self, _query: &EventQuery) -> EventStoreResult<Vec<Event>> {
            Ok(Vec::new())
        }

        async fn latest_sequence(&self, _query: &EventQuery) -> EventStoreResult<Sequence> {
            Ok(Sequence::zero())
        }
    }

    fn commands(max_attempts: u32) -> Commands<ConflictingStore> {
        Commands::new(
            ConflictingStore,
            CommandConfig {
                max_attempts: MaxAttempts::try_new(max_attempts).unwrap(),
                base_delay: BaseDelayMs::try_new(0).unwrap(),
            },
        )
    }

    #[tokio::test]
    async fn conflicts_are_retried_until_attempts_are_exhausted() {
        let commands = &commands(3);
        let counter = AtomicU32::new(0);
        let attempts = &counter;

        let result: CommandResult<()> = commands
            .execute(move || async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                commands.push(EventWrites::new()).await.map(|_| ())
            })
            .await;

        assert!(matches!(result, Err(CommandError::ConcurrencyConflict { attempts: 3 })));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let commands = commands(3);
        let counter = AtomicU32::new(0);
        let attempts = &counter;

        let result: CommandResult<()> = commands
            .execute(move || async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(CommandError::AlreadyExists("Errors.User.AlreadyExists".to_string()))
            })
            .await;

        assert!(matches!(result, Err(CommandError::AlreadyExists(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn jitter_stays_within_half_the_delay() {
        let delay = Duration::from_millis(100);

        for _ in 0..50 {
            let jittered = with_jitter(delay);
            assert!(jittered >= delay && jittered <= Duration::from_millis(150));
        }
        assert_eq!(with_jitter(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn new_models_expect_new_aggregates() {
        let state = WriteModelState {
            model: (),
            version: AggregateVersion::initial(),
            sequence: Sequence::zero(),
        };
        let existing = WriteModelState {
            version: AggregateVersion::new(4),
            ..state.clone()
        };

        assert_eq!(state.expected_version(), ExpectedVersion::New);
        assert_eq!(existing.expected_version(), ExpectedVersion::Exact(AggregateVersion::new(4)));
    }
}
