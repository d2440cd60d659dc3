//! `ResourceClient` over the kube API (dynamic objects).

use anyhow::anyhow;
use kube::{
    api::{Api, DeleteParams, PostParams, Preconditions},
    core::DynamicObject,
    Client,
};
use metrics::counter;
use runvault_core::{ClientError, Identity, ResourceClient};
use tracing::debug;

use crate::kinds::{RunKind, RunObject};

/// Map kube errors onto the collaborator taxonomy: 404 is NotFound, 409 is
/// Conflict, everything else is worth retrying later.
pub fn map_kube_err(e: kube::Error, what: &str) -> ClientError {
    match e {
        kube::Error::Api(resp) if resp.code == 404 => ClientError::NotFound(what.to_string()),
        kube::Error::Api(resp) if resp.code == 409 => ClientError::Conflict(format!("{}: {}", what, resp.message)),
        other => ClientError::Transient(anyhow::Error::new(other).context(what.to_string())),
    }
}

/// Live cluster access for one run kind.
#[derive(Clone)]
pub struct KubeResources {
    client: Client,
    kind: RunKind,
}

impl KubeResources {
    pub fn new(client: Client, kind: RunKind) -> Self {
        Self { client, kind }
    }

    pub fn kind(&self) -> RunKind {
        self.kind
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.kind.adapter().api_resource())
    }
}

#[async_trait::async_trait]
impl ResourceClient for KubeResources {
    type Object = RunObject;

    async fn get(&self, namespace: &str, name: &str) -> Result<RunObject, ClientError> {
        let what = format!("{} {}/{}", self.kind, namespace, name);
        let obj = self.api(namespace).get(name).await.map_err(|e| map_kube_err(e, &what))?;
        Ok(RunObject::new(self.kind, obj))
    }

    async fn update(&self, run: &RunObject) -> Result<RunObject, ClientError> {
        let namespace = run.namespace().ok_or_else(|| ClientError::transient(anyhow!("update: object has no namespace")))?;
        let what = format!("{} {}/{}", self.kind, namespace, run.name());
        let obj = self
            .api(namespace)
            .replace(run.name(), &PostParams::default(), &run.obj)
            .await
            .map_err(|e| map_kube_err(e, &what))?;
        counter!("kube_update_total", 1u64);
        Ok(RunObject::new(self.kind, obj))
    }

    async fn delete(&self, id: &Identity) -> Result<(), ClientError> {
        let what = format!("{} {}/{}", self.kind, id.namespace, id.name);
        let dp = DeleteParams {
            preconditions: Some(Preconditions { uid: Some(id.uid.clone()), resource_version: None }),
            ..DeleteParams::default()
        };
        self.api(&id.namespace).delete(&id.name, &dp).await.map_err(|e| map_kube_err(e, &what))?;
        debug!(kind = %self.kind, key = %id.key(), uid = %id.uid, "delete issued");
        counter!("kube_delete_total", 1u64);
        Ok(())
    }
}
