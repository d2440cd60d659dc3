//! Single-pass, level-triggered reconcile of one run key.
//!
//! Every invocation recomputes the full decision from what it observes:
//!
//! 1. fetch the run (gone is success),
//! 2. archive: update the annotated record, or create Result + Record under
//!    names derived from the run's UID,
//! 3. write the correlation annotations back (unless disabled),
//! 4. delete the run if it is unowned, complete and past its grace period.
//!
//! Nothing is retried here; errors go back to the caller's requeue policy.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use runvault_core::{
    annotation, naming, Clock, ClientError, Config, Converter, CorrelationRefs, Identity, ReconcileError,
    ReconcileKey, ResourceClient, RunView,
};
use runvault_persist::RecordStore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cleanup::{self, Plan};

/// What happened to the run's live copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cleanup {
    Owned,
    Running,
    Disabled,
    /// Inside the grace period; re-evaluate after this long.
    Waiting { requeue_after: Duration },
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    pub refs: CorrelationRefs,
    /// Took the create path (no complete annotation pair on the run).
    pub created: bool,
    /// An annotation update was sent to the cluster.
    pub annotated: bool,
    pub cleanup: Cleanup,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The run no longer exists.
    Gone,
    Reconciled(Reconciled),
}

impl Outcome {
    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            Outcome::Reconciled(Reconciled { cleanup: Cleanup::Waiting { requeue_after }, .. }) => Some(*requeue_after),
            _ => None,
        }
    }
}

pub struct Reconciler<C: ResourceClient> {
    resources: Arc<C>,
    store: Arc<dyn RecordStore>,
    converter: Arc<dyn Converter<C::Object>>,
    clock: Arc<dyn Clock>,
    config: Config,
}

/// Run `fut` unless `cancel` fires first.
async fn guarded<T>(cancel: &CancellationToken, fut: impl Future<Output = T>) -> Result<T, ReconcileError> {
    if cancel.is_cancelled() {
        return Err(ReconcileError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ReconcileError::Cancelled),
        out = fut => Ok(out),
    }
}

impl<C: ResourceClient> Reconciler<C> {
    pub fn new(
        resources: Arc<C>,
        store: Arc<dyn RecordStore>,
        converter: Arc<dyn Converter<C::Object>>,
        clock: Arc<dyn Clock>,
        config: Config,
    ) -> Self {
        Self { resources, store, converter, clock, config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Reconcile `"<namespace>/<name>"`.
    pub async fn reconcile(&self, cancel: &CancellationToken, key: &str) -> Result<Outcome, ReconcileError> {
        let started = Instant::now();
        let res = self.reconcile_key(cancel, key).await;
        histogram!("reconcile_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("reconcile_total", 1u64);
        if let Err(e) = &res {
            counter!("reconcile_err", 1u64, "kind" => e.kind());
        }
        res
    }

    async fn reconcile_key(&self, cancel: &CancellationToken, key: &str) -> Result<Outcome, ReconcileError> {
        let key = ReconcileKey::parse(key)?;
        let run = match guarded(cancel, self.resources.get(&key.namespace, &key.name)).await? {
            Ok(run) => run,
            Err(ClientError::NotFound(_)) => {
                debug!(key = %key, "run gone; nothing to reconcile");
                return Ok(Outcome::Gone);
            }
            Err(e) => return Err(e.into()),
        };
        let id = run.identity()?;

        let (refs, created) = self.archive(cancel, &run, &id).await?;

        let (run, annotated) = if self.config.disable_annotation_update {
            (run, false)
        } else {
            self.annotate(cancel, run, &refs).await?
        };

        let cleanup = self.cleanup(cancel, &run, &id).await?;
        Ok(Outcome::Reconciled(Reconciled { refs, created, annotated, cleanup }))
    }

    /// Upsert the run's record. Returns the correlation pair and whether the
    /// create path was taken.
    async fn archive(
        &self,
        cancel: &CancellationToken,
        run: &C::Object,
        id: &Identity,
    ) -> Result<(CorrelationRefs, bool), ReconcileError> {
        let data = self.converter.convert(run)?;
        let existing = annotation::read(run)
            .complete()
            .filter(|r| naming::parse_record_name(&r.record).is_some());

        if let Some(refs) = existing {
            guarded(cancel, self.store.upsert_record(&refs.record, &data)).await??;
            counter!("records_upserted_total", 1u64, "path" => "update");
            debug!(key = %id.key(), record = %refs.record, "record updated");
            return Ok((refs, false));
        }

        let (result, record) = naming::names_for(id);
        guarded(cancel, self.store.upsert_result(&result)).await??;
        guarded(cancel, self.store.upsert_record(&record, &data)).await??;
        counter!("records_upserted_total", 1u64, "path" => "create");
        info!(key = %id.key(), kind = %id.kind, uid = %id.uid, record = %record, "run archived");
        Ok((CorrelationRefs { result, record }, true))
    }

    async fn annotate(
        &self,
        cancel: &CancellationToken,
        run: C::Object,
        refs: &CorrelationRefs,
    ) -> Result<(C::Object, bool), ReconcileError> {
        match annotation::write(&run, refs) {
            None => Ok((run, false)),
            Some(next) => {
                let updated = guarded(cancel, self.resources.update(&next)).await??;
                debug!(result = %refs.result, record = %refs.record, "correlation annotations written");
                Ok((updated, true))
            }
        }
    }

    async fn cleanup(&self, cancel: &CancellationToken, run: &C::Object, id: &Identity) -> Result<Cleanup, ReconcileError> {
        let owned = !run.owner_refs().is_empty();
        match cleanup::plan(owned, run.completion(), self.config.completed_run_grace_period, self.clock.now()) {
            Plan::Owned => Ok(Cleanup::Owned),
            Plan::Running => Ok(Cleanup::Running),
            Plan::Disabled => Ok(Cleanup::Disabled),
            Plan::Wait(left) => {
                let requeue_after = left.to_std().unwrap_or(Duration::ZERO);
                debug!(key = %id.key(), ?requeue_after, "completed run inside grace period");
                Ok(Cleanup::Waiting { requeue_after })
            }
            Plan::Delete => {
                match guarded(cancel, self.resources.delete(id)).await? {
                    Ok(()) => {
                        counter!("runs_deleted_total", 1u64);
                        info!(key = %id.key(), uid = %id.uid, "completed run deleted");
                    }
                    Err(ClientError::NotFound(_)) => debug!(key = %id.key(), "run already gone"),
                    Err(e) => return Err(e.into()),
                }
                Ok(Cleanup::Deleted)
            }
        }
    }
}
