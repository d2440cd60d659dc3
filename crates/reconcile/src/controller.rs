//! Worker pool feeding reconcile keys through the reconciler.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use metrics::{counter, gauge};
use runvault_core::{ReconcileError, ResourceClient};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::queue::{Backoff, WorkQueue};
use crate::reconciler::Reconciler;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub workers: usize,
    /// Capacity of the key channel feeding the controller. A full channel
    /// blocks the watcher; the queue behind it never drops keys.
    pub queue_cap: usize,
    pub backoff: Backoff,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self { workers: 4, queue_cap: 2048, backoff: Backoff::default() }
    }
}

impl ControllerConfig {
    /// `RUNVAULT_WORKERS` and `RUNVAULT_QUEUE_CAP` over the defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            workers: std::env::var("RUNVAULT_WORKERS").ok().and_then(|s| s.parse().ok()).unwrap_or(d.workers),
            queue_cap: std::env::var("RUNVAULT_QUEUE_CAP").ok().and_then(|s| s.parse().ok()).unwrap_or(d.queue_cap),
            backoff: d.backoff,
        }
    }
}

struct Shared {
    queue: Mutex<WorkQueue>,
    ready: Notify,
}

impl Shared {
    fn add(&self, key: &str) {
        let became_ready = match self.queue.lock() {
            Ok(mut q) => {
                let r = q.add(key);
                gauge!("queue_depth", q.len() as f64);
                r
            }
            Err(_) => false,
        };
        if became_ready {
            self.ready.notify_one();
        }
    }

    fn pop(&self) -> Option<String> {
        self.queue.lock().ok()?.pop()
    }

    fn with<T>(&self, f: impl FnOnce(&mut WorkQueue) -> T) -> Option<T> {
        self.queue.lock().ok().map(|mut q| f(&mut q))
    }

    fn fire(&self, key: &str, at: Instant) {
        if self.with(|q| q.fire(key, at)).unwrap_or(false) {
            self.ready.notify_one();
        }
    }

    /// Re-add `key` after `delay`. At most one timer per key is pending; a
    /// request later than the pending one is absorbed by it.
    fn add_after(self: &Arc<Self>, key: String, delay: Duration, cancel: CancellationToken) {
        let Some(at) = Instant::now().checked_add(delay) else {
            debug!(key = %key, ?delay, "requeue delay out of range; not scheduling");
            return;
        };
        let scheduled = self.with(|q| {
            let fresh = q.schedule(&key, at);
            gauge!("queue_timers", q.scheduled() as f64);
            fresh
        });
        if scheduled != Some(true) {
            return;
        }
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(at)) => shared.fire(&key, at),
                _ = cancel.cancelled() => {}
            }
        });
    }
}

/// Binds a stream of keys to a reconciler. Guarantees at most one in-flight
/// reconcile per key; distinct keys run concurrently on `workers` tasks.
pub struct Controller<C: ResourceClient + 'static> {
    reconciler: Arc<Reconciler<C>>,
    cfg: ControllerConfig,
}

impl<C: ResourceClient + 'static> Controller<C> {
    pub fn new(reconciler: Arc<Reconciler<C>>, cfg: ControllerConfig) -> Self {
        Self { reconciler, cfg }
    }

    /// Consume keys until `cancel` fires. Returns once every worker stopped.
    pub async fn run(self, mut keys: mpsc::Receiver<String>, cancel: CancellationToken) -> Result<()> {
        let shared = Arc::new(Shared { queue: Mutex::new(WorkQueue::new()), ready: Notify::new() });
        let mut tasks = JoinSet::new();

        {
            let shared = Arc::clone(&shared);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                loop {
                    tokio::select! {
                        maybe = keys.recv() => match maybe {
                            Some(key) => shared.add(&key),
                            None => {
                                debug!("key channel closed; feeder exiting");
                                break;
                            }
                        },
                        _ = cancel.cancelled() => break,
                    }
                }
            });
        }

        let workers = self.cfg.workers.max(1);
        for id in 0..workers {
            let shared = Arc::clone(&shared);
            let reconciler = Arc::clone(&self.reconciler);
            let cancel = cancel.clone();
            let backoff = self.cfg.backoff;
            tasks.spawn(async move { worker(id, shared, reconciler, backoff, cancel).await });
        }
        info!(workers, "controller started");

        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                if e.is_panic() {
                    cancel.cancel();
                    return Err(anyhow!("controller task panicked: {}", e));
                }
            }
        }
        let pending = shared.with(|q| q.len()).unwrap_or(0);
        info!(pending, "controller stopped");
        Ok(())
    }
}

async fn worker<C: ResourceClient + 'static>(
    id: usize,
    shared: Arc<Shared>,
    reconciler: Arc<Reconciler<C>>,
    backoff: Backoff,
    cancel: CancellationToken,
) {
    loop {
        let key = loop {
            if let Some(k) = shared.pop() {
                break k;
            }
            tokio::select! {
                _ = shared.ready.notified() => {}
                _ = cancel.cancelled() => return,
            }
        };

        let res = reconciler.reconcile(&cancel, &key).await;
        let mut requeue: Option<Duration> = None;
        match res {
            Ok(outcome) => {
                shared.with(|q| q.forget(&key));
                requeue = outcome.requeue_after();
                debug!(worker = id, key = %key, ?outcome, "reconciled");
            }
            Err(ReconcileError::Cancelled) => {
                shared.with(|q| q.done(&key));
                return;
            }
            Err(e) if e.is_retryable() => {
                let failures = shared.with(|q| q.fail(&key)).unwrap_or(1);
                let delay = backoff.delay(failures);
                counter!("reconcile_requeue_total", 1u64);
                warn!(worker = id, key = %key, error = %e, failures, ?delay, "reconcile failed; requeueing");
                requeue = Some(delay);
            }
            Err(e) => {
                shared.with(|q| q.forget(&key));
                error!(worker = id, key = %key, error = %e, kind = e.kind(), "reconcile failed permanently; dropping key");
            }
        }

        if shared.with(|q| q.done(&key)).unwrap_or(false) {
            shared.ready.notify_one();
        }
        if let Some(delay) = requeue {
            shared.add_after(key, delay, cancel.clone());
        }
    }
}
