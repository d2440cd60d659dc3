//! Run snapshot -> archival payload.

use runvault_core::{ConversionError, Converter, RecordData, RunView};
use serde_json::Value as Json;

use crate::kinds::RunObject;

/// Archives the whole object as JSON, minus server bookkeeping that changes
/// on every write without saying anything about the run.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonConverter;

pub(crate) fn strip_managed_fields(v: &mut Json) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

impl Converter<RunObject> for JsonConverter {
    fn convert(&self, run: &RunObject) -> Result<RecordData, ConversionError> {
        let types = run.obj.types.as_ref().ok_or_else(|| ConversionError::new("object missing apiVersion/kind"))?;
        if types.api_version != run.kind.api_version() || types.kind != run.kind.to_string() {
            return Err(ConversionError::new(format!(
                "object type {}.{} does not match watched kind {}",
                types.api_version, types.kind, run.kind
            )));
        }
        run.identity()?;
        let mut value =
            serde_json::to_value(&run.obj).map_err(|e| ConversionError::new(format!("serializing object: {}", e)))?;
        strip_managed_fields(&mut value);
        Ok(RecordData { type_name: format!("{}.{}", types.api_version, types.kind), value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinds::RunKind;
    use serde_json::json;

    fn pipelinerun() -> RunObject {
        RunObject::from_json(json!({
            "apiVersion": "tekton.dev/v1beta1",
            "kind": "PipelineRun",
            "metadata": {
                "name": "pipelinerun",
                "namespace": "ns",
                "uid": "12345",
                "managedFields": [{"manager": "kubectl"}]
            },
            "spec": {"pipelineSpec": {"tasks": [{"name": "task"}]}}
        }))
        .unwrap()
    }

    #[test]
    fn payload_is_typed_and_stripped() {
        let data = JsonConverter.convert(&pipelinerun()).unwrap();
        assert_eq!(data.type_name, "tekton.dev/v1beta1.PipelineRun");
        assert_eq!(data.value["metadata"]["name"], "pipelinerun");
        assert_eq!(data.value["spec"]["pipelineSpec"]["tasks"][0]["name"], "task");
        assert!(data.value["metadata"].get("managedFields").is_none());
    }

    #[test]
    fn conversion_is_deterministic() {
        let pr = pipelinerun();
        assert_eq!(JsonConverter.convert(&pr).unwrap(), JsonConverter.convert(&pr.clone()).unwrap());
    }

    #[test]
    fn kind_mismatch_is_rejected() {
        let mut pr = pipelinerun();
        pr.kind = RunKind::TaskRun;
        assert!(JsonConverter.convert(&pr).unwrap_err().to_string().contains("does not match"));
    }

    #[test]
    fn missing_uid_is_rejected() {
        let mut pr = pipelinerun();
        pr.obj.metadata.uid = None;
        assert!(JsonConverter.convert(&pr).is_err());
    }
}
