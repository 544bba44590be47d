//! Time source abstraction.
//!
//! Stores stamp `creation_date`, spoolers record run timestamps and
//! notification handlers compare code expiry against "now". All of them take
//! a [`Clock`] so tests can pin time.

use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Delegates to the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}

/// Shared, dynamically dispatched clock.
pub type SharedClock = Arc<dyn Clock>;

/// The system clock behind an `Arc`.
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}
