//! Deduplicating FIFO of reconcile keys with per-key exclusivity.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rustc_hash::{FxHashMap, FxHashSet};

/// Exponential per-key retry delay.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self { base: Duration::from_millis(100), max: Duration::from_secs(300) }
    }
}

impl Backoff {
    /// Delay before the `failures`-th retry (1-based).
    pub fn delay(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        self.base.checked_mul(1u32 << exp).unwrap_or(self.max).min(self.max)
    }
}

/// A key is queued at most once. A key re-added while it is being processed
/// is held back and re-queued by [`WorkQueue::done`], so two workers never
/// hold the same key. Keys are never dropped; the queue holds at most one
/// entry per distinct key and callers bound intake upstream.
#[derive(Default)]
pub struct WorkQueue {
    order: VecDeque<String>,
    queued: FxHashSet<String>,
    processing: FxHashSet<String>,
    failures: FxHashMap<String, u32>,
    timers: FxHashMap<String, Instant>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Returns true when the key became poppable.
    pub fn add(&mut self, key: &str) -> bool {
        if self.queued.contains(key) {
            return false;
        }
        self.queued.insert(key.to_string());
        if self.processing.contains(key) {
            return false;
        }
        self.order.push_back(key.to_string());
        true
    }

    pub fn pop(&mut self) -> Option<String> {
        let key = self.order.pop_front()?;
        self.queued.remove(&key);
        self.processing.insert(key.clone());
        Some(key)
    }

    /// Finish processing `key`. Returns true if it was re-queued because it
    /// was added again meanwhile.
    pub fn done(&mut self, key: &str) -> bool {
        self.processing.remove(key);
        if self.queued.contains(key) {
            self.order.push_back(key.to_string());
            return true;
        }
        false
    }

    /// Record a failure and return how many consecutive failures `key` has.
    pub fn fail(&mut self, key: &str) -> u32 {
        let n = self.failures.entry(key.to_string()).or_insert(0);
        *n = n.saturating_add(1);
        *n
    }

    pub fn forget(&mut self, key: &str) {
        self.failures.remove(key);
    }

    pub fn failures(&self, key: &str) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }

    /// Ask for `key` to be re-added at `at`. Returns false when a timer for
    /// the key already fires at or before `at`; the caller then starts none.
    pub fn schedule(&mut self, key: &str, at: Instant) -> bool {
        match self.timers.get_mut(key) {
            Some(pending) if *pending <= at => false,
            Some(pending) => {
                *pending = at;
                true
            }
            None => {
                self.timers.insert(key.to_string(), at);
                true
            }
        }
    }

    /// A timer scheduled for `at` fired. Re-adds the key unless a newer,
    /// earlier timer superseded this one and already did so. Returns true
    /// when the key became poppable.
    pub fn fire(&mut self, key: &str, at: Instant) -> bool {
        match self.timers.get(key) {
            Some(pending) if *pending == at => {
                self.timers.remove(key);
            }
            Some(_) => return false,
            None => {}
        }
        self.add(key)
    }

    pub fn scheduled(&self) -> usize {
        self.timers.len()
    }
}
