use std::collections::BTreeMap;
use std::fs;

use camino::Utf8Path;
use serde::Deserialize;
use serde_json::Value;

use crate::error::AccessionError;

/// Scheme prefix that marks a descriptor string as a file location.
pub const LOCATION_SCHEME: &str = "gs://";

/// Structured record of a completed pipeline execution, as emitted by the
/// workflow engine. Immutable once loaded.
#[derive(Debug, Clone, Deserialize)]
pub struct RunMetadata {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Task invocations keyed by fully qualified task name
    /// (`workflow.task`). Scattered tasks appear as several entries under
    /// one key.
    pub calls: BTreeMap<String, Vec<TaskCall>>,

    /// Top-level declared workflow inputs. Used to seed raw-input artifacts
    /// and to carry run parameters consumed by quality-metric payloads.
    #[serde(default)]
    pub inputs: Value,

    /// Top-level declared workflow outputs.
    #[serde(default)]
    pub outputs: Value,
}

/// One executed task invocation as recorded in the run metadata.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskCall {
    #[serde(default)]
    pub inputs: Value,

    #[serde(default)]
    pub outputs: Value,

    #[serde(rename = "dockerImageUsed", default)]
    pub docker_image: Option<String>,
}

impl RunMetadata {
    pub fn load(path: &Utf8Path) -> Result<Self, AccessionError> {
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|_| AccessionError::MetadataRead(path.to_string()))?;
        serde_json::from_str(&content)
            .map_err(|err| AccessionError::MetadataParse(err.to_string()))
    }

    pub fn workflow_id(&self) -> Option<&str> {
        self.labels
            .get("cromwell-workflow-id")
            .map(String::as_str)
    }

    /// Locations declared as workflow-level inputs.
    pub fn input_whitelist(&self) -> Vec<String> {
        extract_locations(&self.inputs)
    }

    /// Locations declared as workflow-level outputs.
    pub fn output_whitelist(&self) -> Vec<String> {
        extract_locations(&self.outputs)
    }
}

/// Strips the workflow qualifier from a call key: `atac.align` -> `align`.
pub fn short_task_name(qualified: &str) -> &str {
    qualified.rsplit('.').next().unwrap_or(qualified)
}

/// Recursively extracts file locations from a descriptor tree. Descriptor
/// values are arbitrary nestings of strings, lists, and mappings; any string
/// carrying the location scheme is a file reference.
pub fn extract_locations(value: &Value) -> Vec<String> {
    let mut found = Vec::new();
    collect_locations(value, &mut found);
    found
}

fn collect_locations(value: &Value, found: &mut Vec<String>) {
    match value {
        Value::String(text) if text.starts_with(LOCATION_SCHEME) => {
            found.push(text.clone());
        }
        Value::Array(items) => {
            for item in items {
                collect_locations(item, found);
            }
        }
        Value::Object(entries) => {
            for item in entries.values() {
                collect_locations(item, found);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn short_names() {
        assert_eq!(short_task_name("atac.align"), "align");
        assert_eq!(short_task_name("align"), "align");
    }

    #[test]
    fn extract_nested_locations() {
        let tree = json!({
            "bam": "gs://bucket/run/align/x.bam",
            "fastqs": [["gs://bucket/a.fastq.gz", "gs://bucket/b.fastq.gz"]],
            "genome": {"ref_fa": "gs://refs/GRCh38.fa", "blacklist": null},
            "threads": 4,
            "label": "not-a-file"
        });
        let mut locations = extract_locations(&tree);
        locations.sort();
        assert_eq!(
            locations,
            vec![
                "gs://bucket/a.fastq.gz",
                "gs://bucket/b.fastq.gz",
                "gs://bucket/run/align/x.bam",
                "gs://refs/GRCh38.fa",
            ]
        );
    }

    #[test]
    fn parse_run_metadata() {
        let raw = json!({
            "workflowRoot": "gs://bucket/run/",
            "labels": {"cromwell-workflow-id": "cromwell-1234"},
            "calls": {
                "atac.align": [
                    {"inputs": {"fastqs": []}, "outputs": {"bam": "gs://bucket/x.bam"},
                     "dockerImageUsed": "quay.io/atac:v1.1"}
                ]
            },
            "inputs": {"atac.fastqs": ["gs://bucket/a.fastq.gz"]},
            "outputs": {}
        });
        let metadata: RunMetadata = serde_json::from_value(raw).unwrap();
        assert_eq!(metadata.workflow_id(), Some("cromwell-1234"));
        assert_eq!(metadata.calls.len(), 1);
        assert_eq!(
            metadata.input_whitelist(),
            vec!["gs://bucket/a.fastq.gz".to_string()]
        );
        let call = &metadata.calls["atac.align"][0];
        assert_eq!(call.docker_image.as_deref(), Some("quay.io/atac:v1.1"));
    }
}
