//! Failure injection for projection writes.
//!
//! Wrapping an executor with [`ChaosExecutorExt::with_chaos`] makes a share of
//! its statements fail before they reach the backend. Spooler tests use it to
//! check that retried statements converge to the same tables as a clean run.

use async_trait::async_trait;
use idcore::{EventStoreError, EventStoreResult, Operation, Statement, StatementExecutor};
use nutype::nutype;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{random, Rng, SeedableRng};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Probability value for failure injection rates.
///
/// ```ignore
/// let never = Probability::try_new(0.0).unwrap();
/// let always = Probability::try_new(1.0).unwrap();
///
/// assert!(Probability::try_new(1.5).is_err());
/// ```
#[nutype(
    validate(greater_or_equal = 0.0, less_or_equal = 1.0),
    default = 0.0,
    derive(Debug, Clone, Copy, PartialEq, PartialOrd, Display, Into, Default)
)]
pub struct Probability(f32);

/// How often and how reproducibly failures are injected.
#[derive(Debug, Clone)]
pub struct ChaosConfig {
    deterministic_seed: Option<u64>,
    failure_probability: Probability,
}

impl ChaosConfig {
    /// Seeded configuration; the same seed injects the same failures.
    pub fn deterministic() -> Self {
        Self {
            deterministic_seed: Some(0),
            ..Self::default()
        }
    }

    /// Sets the failure probability, clamped to `[0, 1]`.
    #[must_use]
    pub fn with_failure_probability(mut self, probability: f32) -> Self {
        if let Ok(probability) = Probability::try_new(probability.clamp(0.0, 1.0)) {
            self.failure_probability = probability;
        }
        self
    }
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            deterministic_seed: None,
            failure_probability: Probability::default(),
        }
    }
}

/// Statement executor that fails randomly before delegating.
#[derive(Debug)]
pub struct ChaosExecutor<X> {
    executor: X,
    config: ChaosConfig,
    rng: Mutex<StdRng>,
    injected: AtomicUsize,
}

impl<X> ChaosExecutor<X> {
    /// Wraps `executor`.
    pub fn new(executor: X, config: ChaosConfig) -> Self {
        let rng = match config.deterministic_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::seed_from_u64(random()),
        };

        Self {
            executor,
            config,
            rng: Mutex::new(rng),
            injected: AtomicUsize::new(0),
        }
    }

    /// Number of failures injected so far.
    pub fn injected_failures(&self) -> usize {
        self.injected.load(Ordering::SeqCst)
    }

    /// The wrapped executor.
    pub const fn inner(&self) -> &X {
        &self.executor
    }

    fn should_inject(&self) -> bool {
        let probability: f32 = self.config.failure_probability.into();
        if probability <= 0.0 {
            return false;
        }
        if probability >= 1.0 {
            return true;
        }
        self.rng.lock().random_bool(f64::from(probability))
    }
}

#[async_trait]
impl<X: StatementExecutor> StatementExecutor for ChaosExecutor<X> {
    async fn execute(&self, statement: &Statement) -> EventStoreResult<()> {
        if self.should_inject() {
            let _ = self.injected.fetch_add(1, Ordering::SeqCst);
            debug!(sequence = %statement.sequence, "chaos: injected statement failure");
            return Err(EventStoreError::internal(
                Operation::Execute,
                "chaos: injected failure",
            ));
        }
        self.executor.execute(statement).await
    }
}

/// Adds [`with_chaos`](Self::with_chaos) to every executor.
pub trait ChaosExecutorExt: Sized {
    /// Wraps `self` in a [`ChaosExecutor`].
    fn with_chaos(self, config: ChaosConfig) -> ChaosExecutor<Self>;
}

impl<X: StatementExecutor> ChaosExecutorExt for X {
    fn with_chaos(self, config: ChaosConfig) -> ChaosExecutor<Self> {
        ChaosExecutor::new(self, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use idcore::{AggregateId, AggregateType, Sequence, StatementKind};

    #[derive(Debug, Default)]
    struct CountingExecutor {
        executed: AtomicUsize,
    }

    #[async_trait]
    impl StatementExecutor for CountingExecutor {
        async fn execute(&self, _statement: &Statement) -> EventStoreResult<()> {
            let _ = self.executed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn statement() -> Statement {
        Statement {
            aggregate_type: AggregateType::new("user"),
            aggregate_id: AggregateId::try_new("u1").unwrap(),
            sequence: Sequence::new(1),
            creation_date: Utc::now(),
            kind: StatementKind::NoOp,
        }
    }

    #[test]
    fn deterministic_config_sets_seed() {
        let default_is_none = ChaosConfig::default().deterministic_seed.is_none();
        let deterministic_is_some = ChaosConfig::deterministic().deterministic_seed.is_some();

        assert!(default_is_none && deterministic_is_some);
    }

    #[tokio::test]
    async fn zero_probability_passes_every_statement_through() {
        let executor = CountingExecutor::default().with_chaos(ChaosConfig::deterministic());

        for _ in 0..10 {
            executor.execute(&statement()).await.unwrap();
        }

        assert_eq!(executor.inner().executed.load(Ordering::SeqCst), 10);
        assert_eq!(executor.injected_failures(), 0);
    }

    #[tokio::test]
    async fn full_probability_fails_before_the_backend_is_reached() {
        let executor = CountingExecutor::default()
            .with_chaos(ChaosConfig::deterministic().with_failure_probability(1.0));

        let result = executor.execute(&statement()).await;

        assert!(matches!(
            result,
            Err(EventStoreError::Internal {
                operation: Operation::Execute,
                ..
            })
        ));
        assert_eq!(executor.inner().executed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn probabilities_outside_the_unit_interval_are_clamped() {
        let config = ChaosConfig::default().with_failure_probability(3.0);

        assert!((f32::from(config.failure_probability) - 1.0).abs() < f32::EPSILON);
    }
}
