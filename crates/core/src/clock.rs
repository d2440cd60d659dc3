//! Replaceable source of "now" for grace-period arithmetic.

use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Duration, Utc};

/// Source of the current time. Injected into the reconciler so tests can move
/// time forward without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock. Cloning shares the underlying instant.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<ArcSwap<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn at(t: DateTime<Utc>) -> Self {
        Self { now: Arc::new(ArcSwap::from_pointee(t)) }
    }

    pub fn set(&self, t: DateTime<Utc>) {
        self.now.store(Arc::new(t));
    }

    /// Move time by `d` (negative values move it backwards).
    pub fn advance(&self, d: Duration) {
        let next = *self.now.load_full() + d;
        self.set(next);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::at(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.load_full()
    }
}
