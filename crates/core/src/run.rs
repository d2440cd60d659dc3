//! Capability interface over a watched run, independent of its concrete kind.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::{ClientError, ConversionError};

/// Immutable identity of a watched object. `namespace/name` may be reused
/// after deletion; `uid` disambiguates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

impl Identity {
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerRef {
    pub name: String,
    pub kind: Option<String>,
    pub uid: Option<String>,
    pub controller: bool,
}

impl OwnerRef {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into(), kind: None, uid: None, controller: false }
    }
}

pub type OwnerRefs = SmallVec<[OwnerRef; 2]>;

/// The finished state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub succeeded: bool,
    /// Last transition of the completion condition; `None` when the object
    /// does not record one (treated as "long ago").
    pub at: Option<DateTime<Utc>>,
}

/// Canonical archival payload of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordData {
    /// Fully qualified type, e.g. `tekton.dev/v1beta1.TaskRun`.
    #[serde(rename = "type")]
    pub type_name: String,
    pub value: serde_json::Value,
}

/// What the reconciler needs to know about a run. Implemented once per
/// supported kind so the reconcile path never pokes at raw fields.
pub trait RunView {
    fn identity(&self) -> Result<Identity, ConversionError>;
    fn owner_refs(&self) -> OwnerRefs;
    fn completion(&self) -> Option<Completion>;
    fn annotation(&self, key: &str) -> Option<&str>;
    fn set_annotation(&mut self, key: &str, value: &str);
}

/// Deterministic snapshot -> payload mapping.
pub trait Converter<R>: Send + Sync {
    fn convert(&self, run: &R) -> Result<RecordData, ConversionError>;
}

/// Live-cluster access for one supported kind. Scoped by namespace and name;
/// mutations are optimistic (a stale `resourceVersion` is a conflict).
#[async_trait::async_trait]
pub trait ResourceClient: Send + Sync {
    type Object: RunView + Clone + Send + Sync;

    async fn get(&self, namespace: &str, name: &str) -> Result<Self::Object, ClientError>;

    async fn update(&self, run: &Self::Object) -> Result<Self::Object, ClientError>;

    /// Delete the object named by `id`, guarded by its UID so a re-created
    /// object reusing the name is left alone.
    async fn delete(&self, id: &Identity) -> Result<(), ClientError>;
}
