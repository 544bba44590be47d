//! Catch-up loop driving handlers from their persisted watermark.
//!
//! Each tick walks `Idle -> Fetching -> Applying -> (Success | Failed) -> Idle`:
//!
//! 1. take the handler's lease lock so that only one worker runs it
//! 2. read up to `bulk_limit` events strictly after the watermark
//! 3. reduce them one by one, advancing the watermark after each success;
//!    the lease is renewed before every event and periodically while a
//!    reduction runs, and the tick stops as soon as it is lost
//! 4. on failure record it; below the skip threshold the tick stops and the
//!    same event is retried next tick, above it the event is skipped as poison
//! 5. after a clean batch record the run timestamp for health checks
//!
//! Within one process ticks of the same handler are serialized as well, so
//! clones of a spooler sharing a worker id never overlap.
//!
//! [`Spooler::spawn`] runs ticks whenever a push notification arrives or the
//! requeue timer fires, whichever comes first, until shut down.

use crate::clock::{system_clock, SharedClock};
use crate::config::SpoolerConfig;
use crate::errors::{EventStoreResult, HandlerError, HandlerResult};
use crate::event::Event;
use crate::handler::{FailedEvent, Handler, HandlerStateStore};
use crate::idempotency::expires_at;
use crate::store::{EventQuery, EventStore};
use crate::subscription::SubscriptionRegistry;
use crate::types::Sequence;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex as TickGate};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Where a handler currently is in its tick cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    /// Waiting for a push notification or the requeue timer.
    Idle,
    /// Reading events after the watermark.
    Fetching,
    /// Reducing fetched events.
    Applying,
    /// The last tick stopped at a failing event that will be retried.
    Failed,
    /// The loop has been shut down.
    Stopped,
}

/// Operator view of one handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerStatus {
    /// Current state.
    pub state: HandlerState,
    /// Watermark after the last tick.
    pub watermark: Sequence,
    /// Error of the most recent failure, cleared by a clean tick.
    pub last_error: Option<String>,
    /// End of the most recent tick.
    pub last_tick: Option<DateTime<Utc>>,
}

impl Default for HandlerStatus {
    fn default() -> Self {
        Self {
            state: HandlerState::Idle,
            watermark: Sequence::zero(),
            last_error: None,
            last_tick: None,
        }
    }
}

/// Outcome of one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// Handler name.
    pub handler: String,
    /// Events read from the log.
    pub fetched: usize,
    /// Events reduced successfully.
    pub processed: usize,
    /// Events given up on during this tick.
    pub skipped: Vec<Sequence>,
    /// Failure that stopped the tick; the event will be retried.
    pub failed: Option<FailedEvent>,
    /// Watermark at the end of the tick.
    pub watermark: Sequence,
    /// The handler's lock was held elsewhere or lost during the tick; the
    /// watermark stays at the last event processed under the lock.
    pub locked_out: bool,
}

impl TickReport {
    fn new(handler: &str, watermark: Sequence) -> Self {
        Self {
            handler: handler.to_string(),
            fetched: 0,
            processed: 0,
            skipped: Vec::new(),
            failed: None,
            watermark,
            locked_out: false,
        }
    }

    /// Whether the tick ran and completed without an unresolved failure.
    pub const fn is_success(&self) -> bool {
        self.failed.is_none() && !self.locked_out
    }
}

/// Drives handlers over the event log.
///
/// Cheap to clone; clones share state stores, statuses and the worker id.
#[derive(Clone)]
pub struct Spooler {
    store: Arc<dyn EventStore>,
    state: Arc<dyn HandlerStateStore>,
    registry: Arc<SubscriptionRegistry>,
    config: SpoolerConfig,
    clock: SharedClock,
    worker_id: String,
    statuses: Arc<RwLock<HashMap<String, HandlerStatus>>>,
    ticks: Arc<Mutex<HashMap<String, Arc<TickGate<()>>>>>,
}

impl std::fmt::Debug for Spooler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Spooler")
            .field("config", &self.config)
            .field("worker_id", &self.worker_id)
            .finish_non_exhaustive()
    }
}

impl Spooler {
    /// Creates a spooler reading from `store` and persisting bookkeeping in
    /// `state`. Push notifications come from `registry`.
    pub fn new(
        store: Arc<dyn EventStore>,
        state: Arc<dyn HandlerStateStore>,
        registry: Arc<SubscriptionRegistry>,
        config: SpoolerConfig,
    ) -> Self {
        Self {
            store,
            state,
            registry,
            config,
            clock: system_clock(),
            worker_id: Uuid::new_v4().to_string(),
            statuses: Arc::default(),
            ticks: Arc::default(),
        }
    }

    /// Replaces the time source.
    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the lock owner id, e.g. with a pod name.
    #[must_use]
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// Active configuration.
    pub const fn config(&self) -> &SpoolerConfig {
        &self.config
    }

    /// Last observed status of a handler.
    pub fn status(&self, handler: &str) -> Option<HandlerStatus> {
        self.statuses.read().get(handler).cloned()
    }

    fn update_status(&self, handler: &str, update: impl FnOnce(&mut HandlerStatus)) {
        let mut statuses = self.statuses.write();
        update(statuses.entry(handler.to_string()).or_default());
    }

    /// Whether the handler completed a clean batch within `max_age`.
    pub async fn health(&self, handler: &str, max_age: Duration) -> EventStoreResult<bool> {
        let Some(last_run) = self.state.last_run(handler).await? else {
            return Ok(false);
        };
        let now = self.clock.now();
        Ok(expires_at(last_run, max_age).map_or(true, |deadline| deadline >= now))
    }

    /// Runs one tick for `handler`.
    ///
    /// Handler failures are absorbed into the report; only failures of the
    /// event log or the handler state store are returned as errors, in which
    /// case the watermark stays where the last successful event left it.
    #[instrument(name = "spooler.run_once", skip(self, handler), fields(handler = handler.name()))]
    pub async fn run_once<H: Handler + ?Sized>(&self, handler: &H) -> HandlerResult<TickReport> {
        let name = handler.name();
        let gate = Arc::clone(self.ticks.lock().entry(name.to_string()).or_default());
        let Ok(_running) = gate.try_lock_owned() else {
            debug!("handler already ticking in this process");
            return self.locked_out(name).await;
        };
        if !self.renew_lease(name).await? {
            debug!("handler locked by another worker");
            return self.locked_out(name).await;
        }

        let result = self.tick(handler).await;
        if let Err(unlock_error) = self.state.unlock(name, &self.worker_id).await {
            warn!(error = %unlock_error, "failed to release handler lock");
        }

        let finished = self.clock.now();
        match &result {
            Ok(report) => self.update_status(name, |status| {
                status.state = if report.failed.is_some() {
                    HandlerState::Failed
                } else {
                    HandlerState::Idle
                };
                status.watermark = report.watermark;
                status.last_error = report.failed.as_ref().map(|failed| failed.last_error.clone());
                status.last_tick = Some(finished);
            }),
            Err(error) => self.update_status(name, |status| {
                status.state = HandlerState::Failed;
                status.last_error = Some(error.to_string());
                status.last_tick = Some(finished);
            }),
        }
        result
    }

    async fn locked_out(&self, name: &str) -> HandlerResult<TickReport> {
        let watermark = self.state.current_sequence(name).await?;
        let mut report = TickReport::new(name, watermark);
        report.locked_out = true;
        Ok(report)
    }

    /// Takes or extends the lease from the current time.
    async fn renew_lease(&self, name: &str) -> EventStoreResult<bool> {
        let lease = self.config.lock_lease.as_duration();
        self.state
            .try_lock(name, &self.worker_id, lease, self.clock.now())
            .await
    }

    /// Reduces `event` while renewing the lease every third of its length.
    /// The reduction is never cancelled; the flag tells whether the lease was
    /// held throughout.
    async fn reduce_under_lease<H: Handler + ?Sized>(
        &self,
        handler: &H,
        event: &Event,
    ) -> (HandlerResult<()>, bool) {
        let every = self.config.lock_lease.as_duration() / 3;
        let mut heartbeat = interval_at(Instant::now() + every, every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut lease_held = true;
        let mut reduce = handler.reduce(event);

        loop {
            tokio::select! {
                result = &mut reduce => return (result, lease_held),
                _ = heartbeat.tick(), if lease_held => {
                    match self.renew_lease(handler.name()).await {
                        Ok(true) => debug!(sequence = %event.sequence, "lease renewed"),
                        Ok(false) => {
                            warn!(sequence = %event.sequence, "lease taken over during reduce");
                            lease_held = false;
                        }
                        Err(error) => {
                            warn!(sequence = %event.sequence, error = %error, "lease renewal failed");
                            lease_held = false;
                        }
                    }
                }
            }
        }
    }

    async fn tick<H: Handler + ?Sized>(&self, handler: &H) -> HandlerResult<TickReport> {
        let name = handler.name();
        self.update_status(name, |status| status.state = HandlerState::Fetching);

        let watermark = self.state.current_sequence(name).await?;
        let query = EventQuery::new()
            .aggregate_types(handler.aggregate_types())
            .sequence_greater(watermark)
            .limit(self.config.bulk_limit.into_inner());
        let events = self.store.filter(&query).await?;

        let mut report = TickReport::new(name, watermark);
        report.fetched = events.len();
        debug!(fetched = report.fetched, watermark = %watermark, "fetched events");
        self.update_status(name, |status| status.state = HandlerState::Applying);

        for event in &events {
            if !self.renew_lease(name).await? {
                warn!(sequence = %event.sequence, "handler lock lost, stopping tick");
                report.locked_out = true;
                return Ok(report);
            }
            let (result, lease_held) = self.reduce_under_lease(handler, event).await;
            if !lease_held {
                warn!(sequence = %event.sequence, "handler lock lost, event left for the new owner");
                report.locked_out = true;
                return Ok(report);
            }
            match result {
                Ok(()) => {
                    self.advance(name, event.sequence, &mut report).await?;
                    report.processed += 1;
                }
                Err(error) => {
                    let failed = self
                        .state
                        .record_failure(name, event.sequence, &error.to_string(), self.clock.now())
                        .await?;
                    handler.on_error(event, &error, failed.failure_count);

                    if error.is_permanent() || failed.failure_count > self.config.failure_count_until_skip {
                        self.skip(name, event, &error, &failed, &mut report).await?;
                        continue;
                    }

                    warn!(
                        sequence = %event.sequence,
                        failure_count = failed.failure_count,
                        error = %error,
                        "event failed, will retry"
                    );
                    report.failed = Some(failed);
                    return Ok(report);
                }
            }
        }

        self.state.record_run(name, self.clock.now()).await?;
        handler.on_success(report.watermark);
        if report.processed > 0 || !report.skipped.is_empty() {
            info!(
                processed = report.processed,
                skipped = report.skipped.len(),
                watermark = %report.watermark,
                "batch applied"
            );
        }
        Ok(report)
    }

    async fn advance(&self, name: &str, sequence: Sequence, report: &mut TickReport) -> HandlerResult<()> {
        self.state.set_current_sequence(name, sequence).await?;
        report.watermark = sequence;
        Ok(())
    }

    async fn skip(
        &self,
        name: &str,
        event: &Event,
        error: &HandlerError,
        failed: &FailedEvent,
        report: &mut TickReport,
    ) -> HandlerResult<()> {
        self.state.mark_skipped(name, event.sequence).await?;
        self.advance(name, event.sequence, report).await?;
        report.skipped.push(event.sequence);
        error!(
            sequence = %event.sequence,
            event_type = %event.event_type,
            aggregate_id = %event.aggregate_id,
            failure_count = failed.failure_count,
            error = %error,
            "poison event skipped"
        );
        Ok(())
    }

    /// Runs `handler` in a background task until the handle is shut down.
    ///
    /// A tick that returns a full batch is followed by another one right
    /// away; otherwise the loop waits for a push notification or the requeue
    /// timer. A tick is never interrupted; shutdown is observed between ticks.
    pub fn spawn<H: Handler + 'static>(&self, handler: Arc<H>) -> SpoolerHandle {
        let spooler = self.clone();
        let name = handler.name().to_string();
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let mut subscription = self.registry.subscribe(handler.aggregate_types());
        let bulk_limit = self.config.bulk_limit.into_inner();
        let requeue_every = self.config.requeue_every.as_duration();
        let retry_delay = self.config.retry_delay.as_duration();

        let task_name = name.clone();
        let task = tokio::spawn(async move {
            info!(handler = %task_name, "spooler started");
            let mut push_open = true;
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                let wait = match spooler.run_once(&*handler).await {
                    Ok(report) if report.is_success() && report.fetched >= bulk_limit => continue,
                    Ok(report) if report.is_success() || report.locked_out => requeue_every,
                    Ok(_) => retry_delay,
                    Err(error) => {
                        error!(handler = %task_name, error = %error, "spooler tick failed");
                        retry_delay
                    }
                };
                spooler.update_status(&task_name, |status| {
                    if status.state != HandlerState::Failed {
                        status.state = HandlerState::Idle;
                    }
                });

                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        // A dropped handle stops the loop as well.
                        if changed.is_err() {
                            break;
                        }
                    }
                    received = subscription.recv(), if push_open => {
                        if received.is_none() {
                            push_open = false;
                        }
                        let _ = subscription.drain();
                    }
                    () = sleep(wait) => {}
                }
            }
            spooler.update_status(&task_name, |status| status.state = HandlerState::Stopped);
            info!(handler = %task_name, "spooler stopped");
        });

        SpoolerHandle {
            handler: name,
            spooler: self.clone(),
            shutdown,
            task,
        }
    }
}

/// Control handle of a spawned handler loop.
#[derive(Debug)]
pub struct SpoolerHandle {
    handler: String,
    spooler: Spooler,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SpoolerHandle {
    /// Handler name.
    pub fn handler(&self) -> &str {
        &self.handler
    }

    /// Last observed status.
    pub fn status(&self) -> HandlerStatus {
        self.spooler.status(&self.handler).unwrap_or_default()
    }

    /// Stops the loop after the current tick and waits for it to finish.
    pub async fn shutdown(self) -> HandlerResult<()> {
        let _ = self.shutdown.send(true);
        self.task
            .await
            .map_err(|error| HandlerError::internal(format!("spooler task failed: {error}")))
    }
}
