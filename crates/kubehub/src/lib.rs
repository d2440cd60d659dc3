//! runvault kubehub – run kinds, cluster clients, converter and watcher wiring

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use kube::Client;
use tracing::info;

pub mod client;
pub mod convert;
pub mod fake;
pub mod kinds;
pub mod watch;

pub use client::KubeResources;
pub use convert::JsonConverter;
pub use fake::FakeResources;
pub use kinds::{KindAdapter, PipelineRunAdapter, RunKind, RunObject, TaskRunAdapter};
pub use watch::start_watcher;

/// Client for the current kube context.
pub async fn get_kube_client() -> Result<Client> {
    let client = Client::try_default().await.context("building kube client from current context")?;
    info!(version = ?client.apiserver_version().await.ok().map(|v| v.git_version), "connected to apiserver");
    Ok(client)
}
