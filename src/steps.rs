use std::fs;

use camino::Utf8Path;
use serde::Deserialize;

use crate::domain::{OutputType, RoleKey};
use crate::error::AccessionError;
use crate::qc::QcRegistry;

/// Declarative description of everything to accession for one run: an
/// ordered sequence of steps. Order is a correctness contract, not a
/// preference: a step whose outputs are ancestors of a later step's outputs
/// must be listed first, because derivation resolution consults the records
/// submitted earlier in the same run.
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct StepDocument {
    pub steps: Vec<StepSpec>,
}

/// One accessioning unit: which task's outputs to submit and how to map
/// them onto catalog records.
#[derive(Debug, Clone, Deserialize)]
pub struct StepSpec {
    /// Analysis-step identifier on the catalog side.
    #[serde(rename = "dcc_step_run")]
    pub step_run: String,

    /// Analysis-step version reference.
    #[serde(rename = "dcc_step_version")]
    pub step_version: String,

    /// Name of the originating pipeline task.
    #[serde(rename = "wdl_task_name")]
    pub task_name: String,

    #[serde(rename = "wdl_files")]
    pub outputs: Vec<OutputSpec>,
}

/// One output role of the step's task, mapped to a catalog record type.
#[derive(Debug, Clone, Deserialize)]
pub struct OutputSpec {
    #[serde(rename = "filekey")]
    pub role_key: RoleKey,

    pub file_format: String,

    #[serde(default)]
    pub file_format_type: Option<String>,

    pub output_type: OutputType,

    /// Set when this output may share a content hash with a record of a
    /// different output type already on the catalog; a submission conflict
    /// is then skipped rather than fatal.
    #[serde(default)]
    pub possible_duplicate: bool,

    #[serde(default)]
    pub derived_from_files: Vec<AncestorSpec>,

    #[serde(default)]
    pub quality_metrics: Vec<String>,
}

/// Declares where one set of provenance ancestors is found in the graph.
#[derive(Debug, Clone, Deserialize)]
pub struct AncestorSpec {
    #[serde(rename = "derived_from_task")]
    pub task_name: String,

    #[serde(rename = "derived_from_filekey")]
    pub role_key: RoleKey,

    /// Disambiguates ancestors whose content hash collides across output
    /// types.
    #[serde(rename = "derived_from_output_type", default)]
    pub output_type: Option<OutputType>,

    /// Match the ancestor task's input files instead of its outputs.
    #[serde(rename = "derived_from_inputs", default)]
    pub via_inputs: bool,

    /// Search descendants instead of ancestors.
    #[serde(rename = "derived_from_search_down", default)]
    pub search_down: bool,
}

impl StepDocument {
    pub fn load(path: &Utf8Path) -> Result<Self, AccessionError> {
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|_| AccessionError::StepsRead(path.to_string()))?;
        serde_json::from_str(&content).map_err(|err| AccessionError::StepsParse(err.to_string()))
    }

    /// Fails fast on step specs naming quality metrics no registered
    /// attacher handles; dispatch later in the run never misses.
    pub fn validate(&self, registry: &QcRegistry) -> Result<(), AccessionError> {
        for step in &self.steps {
            for output in &step.outputs {
                for metric in &output.quality_metrics {
                    if !registry.contains(metric) {
                        return Err(AccessionError::UnknownQcMetric(metric.clone()));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    fn document(value: serde_json::Value) -> StepDocument {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn parse_step_document() {
        let doc = document(json!([
            {
                "dcc_step_run": "atac-alignment-step",
                "dcc_step_version": "/analysis-step-versions/atac-alignment-step-v1/",
                "wdl_task_name": "align",
                "wdl_files": [
                    {
                        "filekey": "bam",
                        "file_format": "bam",
                        "output_type": "unfiltered alignments",
                        "quality_metrics": ["samtools_flagstat"],
                        "derived_from_files": [
                            {
                                "derived_from_task": "align",
                                "derived_from_filekey": "fastqs",
                                "derived_from_inputs": true
                            }
                        ]
                    }
                ]
            }
        ]));

        assert_eq!(doc.steps.len(), 1);
        let step = &doc.steps[0];
        assert_eq!(step.task_name, "align");
        let output = &step.outputs[0];
        assert_eq!(output.role_key.as_str(), "bam");
        assert!(!output.possible_duplicate);
        assert!(output.derived_from_files[0].via_inputs);
        assert!(!output.derived_from_files[0].search_down);
    }

    #[test]
    fn invalid_role_key_fails_at_parse_time() {
        let result: Result<StepDocument, _> = serde_json::from_value(json!([
            {
                "dcc_step_run": "s",
                "dcc_step_version": "v",
                "wdl_task_name": "align",
                "wdl_files": [
                    {"filekey": "not a key", "file_format": "bam", "output_type": "alignments"}
                ]
            }
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn unknown_quality_metric_fails_validation() {
        let doc = document(json!([
            {
                "dcc_step_run": "s",
                "dcc_step_version": "v",
                "wdl_task_name": "align",
                "wdl_files": [
                    {
                        "filekey": "bam",
                        "file_format": "bam",
                        "output_type": "alignments",
                        "quality_metrics": ["no_such_metric"]
                    }
                ]
            }
        ]));
        let err = doc.validate(&QcRegistry::standard()).unwrap_err();
        assert_matches!(err, AccessionError::UnknownQcMetric(_));
    }

    #[test]
    fn known_quality_metrics_validate() {
        let doc = document(json!([
            {
                "dcc_step_run": "s",
                "dcc_step_version": "v",
                "wdl_task_name": "dedup",
                "wdl_files": [
                    {
                        "filekey": "nodup_bam",
                        "file_format": "bam",
                        "output_type": "alignments",
                        "quality_metrics": ["samtools_flagstat", "cross_correlation", "idr"]
                    }
                ]
            }
        ]));
        doc.validate(&QcRegistry::standard()).unwrap();
    }
}
