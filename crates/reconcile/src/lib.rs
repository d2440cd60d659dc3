//! runvault reconcile: archive runs, stamp correlation annotations and clean
//! up finished runs, plus the queue and worker loop that drive it.

#![forbid(unsafe_code)]

pub mod cleanup;
pub mod controller;
pub mod queue;
pub mod reconciler;

pub use controller::{Controller, ControllerConfig};
pub use queue::{Backoff, WorkQueue};
pub use reconciler::{Cleanup, Outcome, Reconciled, Reconciler};
