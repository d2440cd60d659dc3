//! Supported run kinds and the adapter each one provides to the reconciler.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use runvault_core::{Completion, ConversionError, Identity, OwnerRef, OwnerRefs, RunView};
use serde_json::Value as Json;

pub const TEKTON_GROUP: &str = "tekton.dev";
pub const TEKTON_VERSION: &str = "v1beta1";
const SUCCEEDED: &str = "Succeeded";

/// Per-kind projection of the fields the reconcile path relies on.
pub trait KindAdapter: Send + Sync {
    fn kind(&self) -> &'static str;
    fn plural(&self) -> &'static str;
    fn completion(&self, obj: &DynamicObject) -> Option<Completion>;

    fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(TEKTON_GROUP, TEKTON_VERSION, self.kind())
    }

    fn api_resource(&self) -> ApiResource {
        ApiResource::from_gvk_with_plural(&self.gvk(), self.plural())
    }
}

/// A single unit of work.
pub struct TaskRunAdapter;

/// A composite of TaskRuns.
pub struct PipelineRunAdapter;

impl KindAdapter for TaskRunAdapter {
    fn kind(&self) -> &'static str {
        "TaskRun"
    }

    fn plural(&self) -> &'static str {
        "taskruns"
    }

    fn completion(&self, obj: &DynamicObject) -> Option<Completion> {
        succeeded_condition(&obj.data)
    }
}

impl KindAdapter for PipelineRunAdapter {
    fn kind(&self) -> &'static str {
        "PipelineRun"
    }

    fn plural(&self) -> &'static str {
        "pipelineruns"
    }

    fn completion(&self, obj: &DynamicObject) -> Option<Completion> {
        succeeded_condition(&obj.data)
    }
}

/// Finished when the `Succeeded` condition is `True` or `False`; `Unknown`
/// means still running. The transition time falls back to `completionTime`.
fn succeeded_condition(data: &Json) -> Option<Completion> {
    let status = data.get("status")?;
    let cond = status
        .get("conditions")?
        .as_array()?
        .iter()
        .find(|c| c.get("type").and_then(|t| t.as_str()) == Some(SUCCEEDED))?;
    let succeeded = match cond.get("status").and_then(|s| s.as_str()) {
        Some("True") => true,
        Some("False") => false,
        _ => return None,
    };
    let at = cond
        .get("lastTransitionTime")
        .and_then(|v| v.as_str())
        .or_else(|| status.get("completionTime").and_then(|v| v.as_str()))
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));
    Some(Completion { succeeded, at })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunKind {
    TaskRun,
    PipelineRun,
}

impl RunKind {
    pub const ALL: [RunKind; 2] = [RunKind::TaskRun, RunKind::PipelineRun];

    pub fn adapter(&self) -> &'static dyn KindAdapter {
        match self {
            RunKind::TaskRun => &TaskRunAdapter,
            RunKind::PipelineRun => &PipelineRunAdapter,
        }
    }

    pub fn api_version(&self) -> String {
        format!("{}/{}", TEKTON_GROUP, TEKTON_VERSION)
    }

    /// Match `apiVersion` + `kind` of an object.
    pub fn from_type(api_version: &str, kind: &str) -> Option<RunKind> {
        RunKind::ALL
            .into_iter()
            .find(|k| k.api_version() == api_version && k.adapter().kind() == kind)
    }
}

impl std::fmt::Display for RunKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.adapter().kind())
    }
}

impl FromStr for RunKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "taskrun" | "taskruns" | "tr" => Ok(RunKind::TaskRun),
            "pipelinerun" | "pipelineruns" | "pr" => Ok(RunKind::PipelineRun),
            other => Err(format!("unsupported kind {:?} (expect taskrun or pipelinerun)", other)),
        }
    }
}

/// A watched run: the dynamic object plus the adapter for its kind.
#[derive(Debug, Clone, PartialEq)]
pub struct RunObject {
    pub kind: RunKind,
    pub obj: DynamicObject,
}

impl RunObject {
    pub fn new(kind: RunKind, obj: DynamicObject) -> Self {
        Self { kind, obj }
    }

    /// Wrap an object whose `apiVersion`/`kind` name a supported kind.
    pub fn from_dynamic(obj: DynamicObject) -> Result<Self, ConversionError> {
        let types = obj.types.as_ref().ok_or_else(|| ConversionError::new("object missing apiVersion/kind"))?;
        let kind = RunKind::from_type(&types.api_version, &types.kind)
            .ok_or_else(|| ConversionError::new(format!("unsupported type {}.{}", types.api_version, types.kind)))?;
        Ok(Self { kind, obj })
    }

    /// Deserialize from a JSON manifest.
    pub fn from_json(v: Json) -> Result<Self, ConversionError> {
        let obj: DynamicObject =
            serde_json::from_value(v).map_err(|e| ConversionError::new(format!("decoding object: {}", e)))?;
        Self::from_dynamic(obj)
    }

    pub fn namespace(&self) -> Option<&str> {
        self.obj.metadata.namespace.as_deref()
    }

    pub fn name(&self) -> &str {
        self.obj.metadata.name.as_deref().unwrap_or("")
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.obj.metadata.resource_version.as_deref()
    }

    pub fn generation(&self) -> i64 {
        self.obj.metadata.generation.unwrap_or(0)
    }

    pub fn set_generation(&mut self, g: i64) {
        self.obj.metadata.generation = Some(g);
    }

    pub fn set_owner_refs(&mut self, owners: Vec<k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference>) {
        self.obj.metadata.owner_references = if owners.is_empty() { None } else { Some(owners) };
    }
}

impl RunView for RunObject {
    fn identity(&self) -> Result<Identity, ConversionError> {
        let meta = &self.obj.metadata;
        let name = meta.name.clone().filter(|s| !s.is_empty()).ok_or_else(|| ConversionError::new("object missing metadata.name"))?;
        let namespace = meta
            .namespace
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ConversionError::new(format!("{} missing metadata.namespace", name)))?;
        let uid = meta
            .uid
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ConversionError::new(format!("{}/{} missing metadata.uid", namespace, name)))?;
        Ok(Identity { kind: self.kind.to_string(), namespace, name, uid })
    }

    fn owner_refs(&self) -> OwnerRefs {
        self.obj
            .metadata
            .owner_references
            .iter()
            .flatten()
            .map(|o| OwnerRef {
                name: o.name.clone(),
                kind: Some(o.kind.clone()).filter(|s| !s.is_empty()),
                uid: Some(o.uid.clone()).filter(|s| !s.is_empty()),
                controller: o.controller.unwrap_or(false),
            })
            .collect()
    }

    fn completion(&self) -> Option<Completion> {
        self.kind.adapter().completion(&self.obj)
    }

    fn annotation(&self, key: &str) -> Option<&str> {
        self.obj.metadata.annotations.as_ref()?.get(key).map(String::as_str)
    }

    fn set_annotation(&mut self, key: &str, value: &str) {
        self.obj
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(key.to_string(), value.to_string());
    }
}
