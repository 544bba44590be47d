//! In-process push notification of newly committed events.
//!
//! Stores publish every committed batch to a [`SubscriptionRegistry`]. Each
//! [`Subscription`] owns a bounded channel; publishing never blocks, and a
//! notification dropped on a full channel only delays a subscriber, because
//! spooled handlers always re-read the log from their persisted watermark.

use crate::config::SubscriptionConfig;
use crate::event::Event;
use crate::types::AggregateType;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

#[derive(Debug)]
struct Subscriber {
    id: u64,
    aggregate_types: Vec<AggregateType>,
    sender: mpsc::Sender<Event>,
}

impl Subscriber {
    fn wants(&self, event: &Event) -> bool {
        self.aggregate_types.is_empty() || self.aggregate_types.contains(&event.aggregate_type)
    }
}

#[derive(Debug, Default)]
struct Subscribers {
    next_id: u64,
    entries: Vec<Subscriber>,
}

/// Registry of live subscriptions.
///
/// Constructed once at process start and shared by `Arc` between the event
/// store (publisher) and the spoolers (subscribers).
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    config: SubscriptionConfig,
    subscribers: Mutex<Subscribers>,
}

impl SubscriptionRegistry {
    /// Creates an empty registry with default channel capacity.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty registry with the given configuration.
    pub fn with_config(config: SubscriptionConfig) -> Self {
        Self {
            config,
            subscribers: Mutex::default(),
        }
    }

    /// Subscribes to events of the given aggregate types; an empty list means
    /// every aggregate type.
    pub fn subscribe(&self, aggregate_types: impl IntoIterator<Item = AggregateType>) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.config.channel_capacity.into_inner());
        let mut subscribers = self.subscribers.lock();
        subscribers.next_id += 1;
        let id = subscribers.next_id;
        subscribers.entries.push(Subscriber {
            id,
            aggregate_types: aggregate_types.into_iter().collect(),
            sender,
        });
        debug!(subscription = id, "subscription registered");

        Subscription { id, receiver }
    }

    /// Notifies matching subscribers about committed events.
    ///
    /// Full channels drop the notification; closed channels are removed.
    pub fn publish(&self, events: &[Event]) {
        let mut subscribers = self.subscribers.lock();
        subscribers.entries.retain(|subscriber| {
            if subscriber.sender.is_closed() {
                debug!(subscription = subscriber.id, "subscription closed");
                return false;
            }
            for event in events.iter().filter(|event| subscriber.wants(event)) {
                match subscriber.sender.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        trace!(
                            subscription = subscriber.id,
                            sequence = %event.sequence,
                            "subscription channel full, notification dropped"
                        );
                        break;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!(subscription = subscriber.id, "subscription closed");
                        return false;
                    }
                }
            }
            true
        });
    }

    /// Number of registered subscriptions, closed ones included until the
    /// next publish.
    pub fn len(&self) -> usize {
        self.subscribers.lock().entries.len()
    }

    /// Whether there are no registered subscriptions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Receiving end of one subscription.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    receiver: mpsc::Receiver<Event>,
}

impl Subscription {
    /// Registry-unique id.
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Waits for the next notification; `None` once the registry is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }

    /// Discards every queued notification and returns how many there were.
    pub fn drain(&mut self) -> usize {
        let mut drained = 0;
        while self.receiver.try_recv().is_ok() {
            drained += 1;
        }
        drained
    }
}
