//! Ownership, completion and grace-period gate for deleting finished runs.

use chrono::{DateTime, Duration, Utc};
use runvault_core::Completion;

/// What to do with the live run once it has been archived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    /// Has owner references: the parent (and kube GC) own its lifecycle.
    Owned,
    /// No completion condition yet.
    Running,
    /// Grace period is zero.
    Disabled,
    /// Completed but still inside the grace period for this long.
    Wait(Duration),
    Delete,
}

/// Decide from observed state alone; nothing here remembers prior calls.
pub fn plan(owned: bool, completion: Option<Completion>, grace: Duration, now: DateTime<Utc>) -> Plan {
    if owned {
        return Plan::Owned;
    }
    let Some(done) = completion else {
        return Plan::Running;
    };
    if grace.is_zero() {
        return Plan::Disabled;
    }
    // No recorded transition time: completed at some unknown point, so any
    // grace period has elapsed.
    let Some(at) = done.at else {
        return Plan::Delete;
    };
    let deadline = match at.checked_add_signed(grace) {
        Some(d) => d,
        None if grace > Duration::zero() => return Plan::Wait(Duration::MAX),
        None => return Plan::Delete,
    };
    if now >= deadline {
        Plan::Delete
    } else {
        Plan::Wait(deadline - now)
    }
}
