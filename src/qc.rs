use std::collections::HashMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Map, Value, json};

use crate::catalog::{CatalogClient, Record};
use crate::content::ContentProvider;
use crate::domain::RoleKey;
use crate::engine::CommonMetadata;
use crate::error::AccessionError;
use crate::graph::{FileId, TaskId, WorkflowRun};
use crate::lineage::LineageResolver;

/// Everything a quality-metric attacher may consult: the provenance graph,
/// both external collaborators, the organizational metadata, and the run's
/// top-level inputs (for parameters like the IDR threshold).
pub struct QcContext<'a> {
    pub run: &'a WorkflowRun,
    pub content: &'a dyn ContentProvider,
    pub catalog: &'a dyn CatalogClient,
    pub common: &'a CommonMetadata,
}

impl QcContext<'_> {
    /// The run-wide QC report, read from the artifact carrying the
    /// `qc_json` role.
    fn qc_report(&self) -> Result<Value, AccessionError> {
        let role: RoleKey = "qc_json".parse()?;
        let files = self.run.files_with_role(&role);
        let file = files
            .first()
            .ok_or_else(|| AccessionError::QcPayload("run has no qc_json artifact".to_string()))?;
        let raw = self.content.read(&self.run.file(*file).location)?;
        serde_json::from_slice(&raw)
            .map_err(|err| AccessionError::QcPayload(format!("unparseable qc report: {err}")))
    }

    fn producer_of(&self, file: FileId) -> Result<TaskId, AccessionError> {
        self.run.file(file).producer.ok_or_else(|| {
            AccessionError::QcPayload(format!(
                "{} has no producing task",
                self.run.file(file).location
            ))
        })
    }

    /// Workflow input parameter, tolerant of the workflow-name qualifier
    /// (`idr_thresh` matches both `idr_thresh` and `atac.idr_thresh`).
    fn run_input(&self, name: &str) -> Result<Value, AccessionError> {
        let inputs = &self.run.metadata().inputs;
        let Value::Object(entries) = inputs else {
            return Err(AccessionError::QcPayload(format!(
                "run metadata has no input {name}"
            )));
        };
        let suffix = format!(".{name}");
        entries
            .iter()
            .find(|(key, _)| key.as_str() == name || key.ends_with(&suffix))
            .map(|(_, value)| value.clone())
            .ok_or_else(|| AccessionError::QcPayload(format!("run metadata has no input {name}")))
    }

    /// Inline `data:` attachment of a plot artifact.
    fn attachment(&self, file: FileId, mime_type: &str) -> Result<Value, AccessionError> {
        let location = &self.run.file(file).location;
        let contents = self.content.read(location)?;
        let encoded = BASE64.encode(contents);
        let download = location.rsplit('/').next().unwrap_or(location);
        Ok(json!({
            "type": mime_type,
            "download": download,
            "href": format!("data:{mime_type};base64,{encoded}"),
        }))
    }
}

/// A pluggable handler that attaches one kind of quality metric to a
/// freshly accessioned record. Attachers are idempotent: a record already
/// carrying a metric of the handler's type is left untouched.
pub trait QcAttacher: Send + Sync {
    /// Step-spec name this attacher is registered under.
    fn metric_name(&self) -> &'static str;

    /// Catalog `@type` of the metric, used for the idempotence probe.
    fn metric_type(&self) -> &'static str;

    fn attach(
        &self,
        ctx: &QcContext<'_>,
        record: &Record,
        file: FileId,
    ) -> Result<Option<Record>, AccessionError>;
}

/// Maps step-spec metric names to typed attachers. Unknown names are
/// rejected when the step document is validated, never at dispatch time.
pub struct QcRegistry {
    attachers: HashMap<&'static str, Box<dyn QcAttacher>>,
}

impl QcRegistry {
    pub fn new() -> Self {
        Self {
            attachers: HashMap::new(),
        }
    }

    /// Registry with every attacher the step documents may name.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(FlagstatAttacher));
        registry.register(Box::new(CrossCorrelationAttacher));
        registry.register(Box::new(IdrAttacher));
        registry
    }

    pub fn register(&mut self, attacher: Box<dyn QcAttacher>) {
        self.attachers.insert(attacher.metric_name(), attacher);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.attachers.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&dyn QcAttacher> {
        self.attachers.get(name).map(Box::as_ref)
    }
}

impl Default for QcRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

fn walk<'v>(value: &'v Value, path: &[&str]) -> Result<&'v Value, AccessionError> {
    let mut current = value;
    for key in path {
        current = current.get(key).ok_or_else(|| {
            AccessionError::QcPayload(format!("qc report is missing {}", path.join(".")))
        })?;
    }
    Ok(current)
}

fn step_run_of(record: &Record) -> Result<&str, AccessionError> {
    record.step_run_id().ok_or_else(|| {
        AccessionError::QcPayload("accessioned record carries no step_run".to_string())
    })
}

/// Samtools flagstat summary of the deduplicated alignments.
struct FlagstatAttacher;

impl QcAttacher for FlagstatAttacher {
    fn metric_name(&self) -> &'static str {
        "samtools_flagstat"
    }

    fn metric_type(&self) -> &'static str {
        "SamtoolsFlagstatsQualityMetric"
    }

    fn attach(
        &self,
        ctx: &QcContext<'_>,
        record: &Record,
        _file: FileId,
    ) -> Result<Option<Record>, AccessionError> {
        if record.has_quality_metric(self.metric_type()) {
            return Ok(None);
        }
        let report = ctx.qc_report()?;
        let replicate = record.bio_replicate()?;
        let section = walk(&report, &["nodup_flagstat_qc", &format!("rep{replicate}")])?;
        let Value::Object(fields) = section else {
            return Err(AccessionError::QcPayload(
                "flagstat section is not a mapping".to_string(),
            ));
        };

        let mut payload = Map::new();
        for (key, value) in fields {
            // Percentages are reported as bare numbers; the catalog schema
            // wants them suffixed.
            if key.contains("_pct") {
                payload.insert(key.clone(), json!(format!("{value}%")));
            } else {
                payload.insert(key.clone(), value.clone());
            }
        }
        payload.insert("step_run".to_string(), json!(step_run_of(record)?));
        payload.insert("quality_metric_of".to_string(), json!([record.at_id()?]));
        payload.insert("status".to_string(), json!("released"));
        ctx.common.extend(&mut payload);

        let posted = ctx
            .catalog
            .create("samtools-flagstats-quality-metric", &Value::Object(payload))?;
        Ok(Some(posted))
    }
}

/// Library complexity and cross-correlation scores, with the plot attached.
struct CrossCorrelationAttacher;

impl QcAttacher for CrossCorrelationAttacher {
    fn metric_name(&self) -> &'static str {
        "cross_correlation"
    }

    fn metric_type(&self) -> &'static str {
        "ComplexityXcorrQualityMetric"
    }

    fn attach(
        &self,
        ctx: &QcContext<'_>,
        record: &Record,
        file: FileId,
    ) -> Result<Option<Record>, AccessionError> {
        if record.has_quality_metric(self.metric_type()) {
            return Ok(None);
        }
        let report = ctx.qc_report()?;
        let replicate = record.bio_replicate()?;
        let task = ctx.producer_of(file)?;
        let resolver = LineageResolver::new(ctx.run);

        let plot = *resolver
            .search_down(task, "xcor", &"plot_pdf".parse()?)?
            .first()
            .ok_or_else(|| {
                AccessionError::QcPayload("no cross-correlation plot in lineage".to_string())
            })?;
        let read_len_log = *resolver
            .search_up(task, "bowtie2", &"read_len_log".parse()?, false)?
            .first()
            .ok_or_else(|| {
                AccessionError::QcPayload("no read-length log in lineage".to_string())
            })?;
        let raw = ctx.content.read(&ctx.run.file(read_len_log).location)?;
        let read_length: u64 = String::from_utf8_lossy(&raw)
            .trim()
            .parse()
            .map_err(|_| AccessionError::QcPayload("unparseable read length".to_string()))?;

        let rep = format!("rep{replicate}");
        let xcor = walk(&report, &["xcor_score", &rep])?;
        let pbc = walk(&report, &["pbc_qc", &rep])?;

        let mut payload = Map::new();
        payload.insert("NRF".to_string(), pbc["NRF"].clone());
        payload.insert("PBC1".to_string(), pbc["PBC1"].clone());
        payload.insert("PBC2".to_string(), pbc["PBC2"].clone());
        payload.insert("NSC".to_string(), xcor["NSC"].clone());
        payload.insert("RSC".to_string(), xcor["RSC"].clone());
        payload.insert("sample size".to_string(), xcor["num_reads"].clone());
        payload.insert("fragment length".to_string(), xcor["est_frag_len"].clone());
        payload.insert("quality_metric_of".to_string(), json!([record.at_id()?]));
        payload.insert("step_run".to_string(), json!(step_run_of(record)?));
        payload.insert("paired-end".to_string(), ctx.run_input("paired_end")?);
        payload.insert("read length".to_string(), json!(read_length));
        payload.insert("status".to_string(), json!("released"));
        payload.insert(
            "cross_correlation_plot".to_string(),
            ctx.attachment(plot, "application/pdf")?,
        );
        ctx.common.extend(&mut payload);

        let posted = ctx
            .catalog
            .create("complexity-xcorr-quality-metrics", &Value::Object(payload))?;
        Ok(Some(posted))
    }
}

/// IDR reproducibility scores for thresholded peak calls.
struct IdrAttacher;

impl QcAttacher for IdrAttacher {
    fn metric_name(&self) -> &'static str {
        "idr"
    }

    fn metric_type(&self) -> &'static str {
        "IDRQualityMetric"
    }

    fn attach(
        &self,
        ctx: &QcContext<'_>,
        record: &Record,
        file: FileId,
    ) -> Result<Option<Record>, AccessionError> {
        if record.has_quality_metric(self.metric_type()) {
            return Ok(None);
        }
        let report = ctx.qc_report()?;
        let replicate = record.bio_replicate()?;
        let task = ctx.producer_of(file)?;
        let resolver = LineageResolver::new(ctx.run);

        let frip = walk(
            &report,
            &["idr_frip_qc", &format!("rep{replicate}-pr"), "FRiP"],
        )?
        .clone();
        let idr_peaks = walk(&report, &["ataqc", &format!("rep{replicate}"), "IDR peaks"])?
            .get(0)
            .cloned()
            .ok_or_else(|| AccessionError::QcPayload("empty IDR peaks entry".to_string()))?;

        let plot = *resolver
            .search_up(task, "idr_pr", &"idr_plot".parse()?, false)?
            .first()
            .ok_or_else(|| AccessionError::QcPayload("no IDR plot in lineage".to_string()))?;

        let mut payload = Map::new();
        payload.insert("F1".to_string(), frip);
        payload.insert("N1".to_string(), idr_peaks);
        payload.insert("step_run".to_string(), json!(step_run_of(record)?));
        payload.insert("quality_metric_of".to_string(), json!([record.at_id()?]));
        payload.insert("IDR_cutoff".to_string(), ctx.run_input("idr_thresh")?);
        payload.insert("status".to_string(), json!("released"));
        payload.insert(
            format!("IDR_plot_rep{replicate}_pr"),
            ctx.attachment(plot, "image/png")?,
        );
        ctx.common.extend(&mut payload);

        let posted = ctx
            .catalog
            .create("idr-quality-metrics", &Value::Object(payload))?;
        Ok(Some(posted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_registry_names() {
        let registry = QcRegistry::standard();
        for name in ["samtools_flagstat", "cross_correlation", "idr"] {
            assert!(registry.contains(name), "missing attacher {name}");
        }
        assert!(!registry.contains("fastqc"));
    }

    #[test]
    fn registry_lookup_returns_matching_attacher() {
        let registry = QcRegistry::standard();
        let attacher = registry.get("idr").unwrap();
        assert_eq!(attacher.metric_type(), "IDRQualityMetric");
    }

    #[test]
    fn walk_reports_missing_path() {
        let report = serde_json::json!({"xcor_score": {}});
        let err = walk(&report, &["xcor_score", "rep1"]).unwrap_err();
        assert!(matches!(err, AccessionError::QcPayload(_)));
    }
}
