//! List+watch a run kind and emit reconcile keys.

use anyhow::Result;
use futures::{Stream, StreamExt};
use kube::{
    api::Api,
    core::DynamicObject,
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client,
};
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::kinds::RunKind;

/// `namespace/name` for a namespaced object; cluster-scoped objects are
/// never runs and yield `None`.
pub fn key_of(obj: &DynamicObject) -> Option<String> {
    let ns = obj.metadata.namespace.as_deref()?;
    let name = obj.metadata.name.as_deref()?;
    Some(format!("{}/{}", ns, name))
}

async fn send(tx: &mpsc::Sender<String>, obj: &DynamicObject) -> bool {
    match key_of(obj) {
        Some(key) => {
            counter!("watch_keys_total", 1u64);
            tx.send(key).await.is_ok()
        }
        None => true,
    }
}

/// Start list+watch for a run kind and send a reconcile key for every
/// applied, deleted or relisted object. Deletions are forwarded too so the
/// reconciler observes NotFound and settles the key. Watch errors are retried
/// with backoff; this only returns once the key channel closes.
pub async fn start_watcher(client: Client, kind: RunKind, namespace: Option<&str>, tx: mpsc::Sender<String>) -> Result<()> {
    let ar = kind.adapter().api_resource();
    let api: Api<DynamicObject> = match namespace {
        Some(ns) => Api::namespaced_with(client, ns, &ar),
        None => Api::all_with(client, &ar),
    };

    let cfg = watcher::Config::default();
    info!(kind = %kind, ns = ?namespace, "watcher started");
    forward_keys(watcher::watcher(api, cfg).default_backoff(), kind, &tx).await;
    Ok(())
}

/// Drain watch events into `tx`. Errors are logged and skipped.
pub(crate) async fn forward_keys<S>(stream: S, kind: RunKind, tx: &mpsc::Sender<String>)
where
    S: Stream<Item = Result<Event<DynamicObject>, watcher::Error>>,
{
    futures::pin_mut!(stream);
    while let Some(ev) = stream.next().await {
        let open = match ev {
            Ok(Event::Applied(o)) | Ok(Event::Deleted(o)) => send(tx, &o).await,
            Ok(Event::Restarted(list)) => {
                debug!(kind = %kind, count = list.len(), "watch restart");
                let mut open = true;
                for o in list.iter() {
                    if !send(tx, o).await {
                        open = false;
                        break;
                    }
                }
                open
            }
            Err(e) => {
                counter!("watch_errors_total", 1u64);
                warn!(kind = %kind, error = %e, "watch error; retrying");
                !tx.is_closed()
            }
        };
        if !open {
            debug!(kind = %kind, "key channel closed; stopping watcher");
            return;
        }
    }
    warn!(kind = %kind, "watcher stream ended");
}
