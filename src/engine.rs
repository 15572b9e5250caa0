use camino::Utf8Path;
use serde_json::{Map, Value, json};

use crate::catalog::{CatalogClient, Record};
use crate::content::ContentProvider;
use crate::domain::{Assembly, RoleKey};
use crate::error::AccessionError;
use crate::graph::{FileId, WorkflowRun};
use crate::lineage::LineageResolver;
use crate::metadata::LOCATION_SCHEME;
use crate::qc::{QcContext, QcRegistry};
use crate::steps::{AncestorSpec, OutputSpec, StepDocument, StepSpec};

/// Role under which raw sequencing inputs enter the run.
const RAW_INPUT_ROLE: &str = "fastqs";

/// Organizational metadata stamped onto every submitted payload. Threaded
/// explicitly through the engine instead of living in process-wide state.
#[derive(Debug, Clone)]
pub struct CommonMetadata {
    pub lab: String,
    pub award: String,
}

impl CommonMetadata {
    pub fn new(lab: impl Into<String>, award: impl Into<String>) -> Self {
        Self {
            lab: lab.into(),
            award: award.into(),
        }
    }

    /// Lab short name out of the lab resource path:
    /// `/labs/encode-processing-pipeline/` -> `encode-processing-pipeline`.
    pub fn lab_pi(&self) -> &str {
        self.lab
            .split("/labs/")
            .nth(1)
            .map(|rest| rest.split('/').next().unwrap_or(rest))
            .unwrap_or(self.lab.as_str())
    }

    pub fn extend(&self, payload: &mut Map<String, Value>) {
        payload.insert("lab".to_string(), json!(self.lab));
        payload.insert("award".to_string(), json!(self.award));
    }
}

/// Orchestrates accessioning of one finished run: builds candidate records
/// for each declared step, resolves their derivation lineage, submits them
/// idempotently, and dispatches quality-metric attachment.
///
/// The in-run cache of newly submitted records is consulted by every later
/// derivation lookup, which is why steps execute strictly in declared order.
pub struct AccessionEngine<C: ContentProvider, K: CatalogClient> {
    run: WorkflowRun,
    content: C,
    catalog: K,
    common: CommonMetadata,
    registry: QcRegistry,
    current_user: String,
    new_records: Vec<Record>,
}

impl<C: ContentProvider, K: CatalogClient> AccessionEngine<C, K> {
    /// Resolving the submitting identity is the first catalog interaction;
    /// failure here aborts before anything is mutated.
    pub fn new(
        run: WorkflowRun,
        content: C,
        catalog: K,
        common: CommonMetadata,
        registry: QcRegistry,
    ) -> Result<Self, AccessionError> {
        let current_user = catalog.current_user()?;
        tracing::info!(user = %current_user, "authenticated against catalog");
        Ok(Self {
            run,
            content,
            catalog,
            common,
            registry,
            current_user,
            new_records: Vec::new(),
        })
    }

    pub fn run(&self) -> &WorkflowRun {
        &self.run
    }

    /// Records created or revived during this run, in submission order.
    pub fn new_records(&self) -> &[Record] {
        &self.new_records
    }

    /// The sole idempotence anchor: catalog identity is keyed by content
    /// hash, never by any run-specific identifier.
    pub fn record_at_catalog(&self, location: &str) -> Result<Option<Record>, AccessionError> {
        let md5 = self.content.hash(location)?;
        let matches = self.catalog.find(&[("md5sum", &md5), ("type", "File")])?;
        match matches.first() {
            Some(found) => self.catalog.get(found.id()?),
            None => Ok(None),
        }
    }

    /// True when every raw sequencing input already has a catalog record.
    /// Accessioning pipeline outputs before their raw inputs exist would
    /// leave dangling lineage.
    pub fn raw_files_accessioned(&self) -> Result<bool, AccessionError> {
        let role: RoleKey = RAW_INPUT_ROLE.parse()?;
        for file in self.run.raw_inputs_with_role(&role) {
            if self
                .record_at_catalog(&self.run.file(file).location)?
                .is_none()
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Experiment the submitted files belong to, read off the catalog
    /// record of the first raw input.
    fn dataset(&self) -> Result<String, AccessionError> {
        let role: RoleKey = RAW_INPUT_ROLE.parse()?;
        let raws = self.run.raw_inputs_with_role(&role);
        let first = raws
            .first()
            .ok_or_else(|| AccessionError::NoRawInputs(RAW_INPUT_ROLE.to_string()))?;
        let location = self.run.file(*first).location.clone();
        let record = self
            .record_at_catalog(&location)?
            .ok_or(AccessionError::RawInputNotCatalogued(location))?;
        record
            .dataset()
            .map(str::to_string)
            .ok_or_else(|| {
                AccessionError::MalformedRecord("raw input record has no dataset".to_string())
            })
    }

    /// Assembly tag derived from the reference genome the run used. Empty
    /// when the run carries no recognizable reference.
    fn assembly(&self) -> String {
        let tasks = self.run.tasks_named("read_genome_tsv");
        let Some(&task) = tasks.first() else {
            return String::new();
        };
        let ref_fa = self
            .run
            .task(task)
            .outputs
            .get("genome")
            .and_then(|genome| genome.get("ref_fa"))
            .and_then(|value| value.as_str())
            .unwrap_or("");
        Assembly::detect_in(ref_fa)
            .map(|assembly| assembly.as_str().to_string())
            .unwrap_or_default()
    }

    /// The step-run alias (lab prefix, run name, execution-image tag) is the
    /// idempotence key: repeated calls resolve to the existing record.
    fn get_or_make_step_run(&self, step: &StepSpec) -> Result<Record, AccessionError> {
        let tasks = self.run.tasks_named(&step.task_name);
        let &task = tasks
            .first()
            .ok_or_else(|| AccessionError::NoSuchTask(step.task_name.clone()))?;
        let image = self
            .run
            .task(task)
            .docker_image
            .as_deref()
            .ok_or_else(|| AccessionError::MissingExecutionImage(step.task_name.clone()))?;
        let tag = image.rsplit(':').next().unwrap_or(image);
        let alias = format!("{}:{}-{}", self.common.lab_pi(), step.step_run, tag);

        if let Some(existing) = self.catalog.get(&alias)? {
            tracing::debug!(%alias, "step run already on catalog");
            return Ok(existing);
        }
        let payload = json!({
            "aliases": [alias],
            "status": "released",
            "analysis_step_version": step.step_version,
        });
        self.catalog.create("analysis_step_runs", &payload)
    }

    /// Resolves the candidate's declared ancestors to catalog reference
    /// strings, deduplicated, order unspecified.
    pub fn get_derived_from(
        &self,
        file: FileId,
        specs: &[AncestorSpec],
    ) -> Result<Vec<String>, AccessionError> {
        let mut references = Vec::new();
        for spec in specs {
            for reference in self.resolve_ancestor_spec(file, spec)? {
                if !references.contains(&reference) {
                    references.push(reference);
                }
            }
        }
        Ok(references)
    }

    fn resolve_ancestor_spec(
        &self,
        file: FileId,
        spec: &AncestorSpec,
    ) -> Result<Vec<String>, AccessionError> {
        let from_task = self.run.file(file).producer.ok_or_else(|| {
            AccessionError::NoProducingTask(self.run.file(file).location.clone())
        })?;
        let resolver = LineageResolver::new(&self.run);
        let ancestors = if spec.search_down {
            resolver.search_down(from_task, &spec.task_name, &spec.role_key)?
        } else {
            resolver.search_up(from_task, &spec.task_name, &spec.role_key, spec.via_inputs)?
        };

        // Candidate pool: catalog state plus everything submitted earlier in
        // this run. Records created by a previous step must be visible here.
        let mut pool: Vec<Record> = Vec::new();
        for &ancestor in &ancestors {
            if let Some(record) = self.record_at_catalog(&self.run.file(ancestor).location)? {
                pool.push(record);
            }
        }
        pool.extend(self.new_records.iter().cloned());

        let mut ids: Vec<String> = Vec::new();
        for &ancestor in &ancestors {
            let md5 = self.run.file(ancestor).md5sum.as_str();
            for record in &pool {
                if record.md5sum() != Some(md5) {
                    continue;
                }
                // Distinct output kinds can legitimately share a content
                // hash; the declared discriminator tells them apart.
                if let Some(expected) = &spec.output_type {
                    if record.output_type() != Some(expected.as_str()) {
                        continue;
                    }
                }
                let id = record.id()?.to_string();
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }

        if ids.is_empty() {
            return Err(AccessionError::MissingAllDerivedFrom {
                task: spec.task_name.clone(),
                role_key: spec.role_key.to_string(),
            });
        }
        if ids.len() != ancestors.len() {
            return Err(AccessionError::MissingSomeDerivedFrom {
                task: spec.task_name.clone(),
                role_key: spec.role_key.to_string(),
            });
        }
        Ok(ids.into_iter().map(|id| format!("/files/{id}/")).collect())
    }

    fn file_candidate(
        &self,
        file: FileId,
        spec: &OutputSpec,
        step_run: &Record,
        derived_from: Vec<String>,
        dataset: &str,
    ) -> Result<Value, AccessionError> {
        let artifact = self.run.file(file);
        let file_name = artifact
            .location
            .trim_start_matches(LOCATION_SCHEME)
            .replace('/', "-");

        let mut payload = Map::new();
        payload.insert("status".to_string(), json!("uploading"));
        payload.insert(
            "aliases".to_string(),
            json!([format!("{}:{}", self.common.lab_pi(), file_name)]),
        );
        payload.insert("file_format".to_string(), json!(spec.file_format));
        if let Some(format_type) = &spec.file_format_type {
            payload.insert("file_format_type".to_string(), json!(format_type));
        }
        payload.insert("output_type".to_string(), json!(spec.output_type.as_str()));
        payload.insert("assembly".to_string(), json!(self.assembly()));
        payload.insert("dataset".to_string(), json!(dataset));
        payload.insert("step_run".to_string(), json!(step_run.at_id()?));
        payload.insert("derived_from".to_string(), json!(derived_from));
        payload.insert("file_size".to_string(), json!(artifact.size));
        payload.insert("md5sum".to_string(), json!(artifact.md5sum));
        self.common.extend(&mut payload);
        Ok(Value::Object(payload))
    }

    /// Submits one candidate. Three outcomes: create a new record (download,
    /// post, then patch in the permanent submitted location, which must
    /// reference the created identifier), revive a soft-deleted record in
    /// place, or return the live existing record without any mutation.
    pub fn accession_file(
        &mut self,
        mut candidate: Value,
        file: FileId,
    ) -> Result<Record, AccessionError> {
        let location = self.run.file(file).location.clone();
        match self.record_at_catalog(&location)? {
            None => {
                let local = self.content.download(&location)?;
                candidate["submitted_file_name"] = json!(local.as_str());
                // The local copy exists only for the upload; it is removed
                // whether or not the submission goes through.
                let posted = self.catalog.create("file", &candidate);
                remove_local_copy(&local);
                let posted = posted?;
                let patched = self
                    .catalog
                    .update(posted.id()?, &json!({"submitted_file_name": location}))?;
                tracing::info!(%location, record = patched.id()?, "created catalog record");
                self.new_records.push(patched.clone());
                Ok(patched)
            }
            Some(existing) if existing.is_soft_deleted() => {
                candidate["submitted_file_name"] = json!(location);
                candidate["submitted_by"] = json!(self.current_user);
                let patched = self.catalog.update(existing.id()?, &candidate)?;
                tracing::info!(%location, record = patched.id()?, "revived catalog record");
                self.new_records.push(patched.clone());
                Ok(patched)
            }
            Some(existing) => {
                tracing::debug!(%location, record = existing.id()?, "record already current");
                Ok(existing)
            }
        }
    }

    /// Accessions every matching output of one declared step. Two failures
    /// are survivable per candidate: a catalog conflict on an output flagged
    /// as a possible duplicate, and a candidate none of whose ancestors
    /// exist yet. Everything else aborts the run.
    pub fn accession_step(&mut self, step: &StepSpec) -> Result<Vec<Record>, AccessionError> {
        tracing::info!(task = %step.task_name, "accessioning step");
        let step_run = self.get_or_make_step_run(step)?;
        let dataset = self.dataset()?;
        let mut accessioned = Vec::new();

        for task in self.run.tasks_named(&step.task_name) {
            for output in &step.outputs {
                let files: Vec<FileId> = self
                    .run
                    .task(task)
                    .output_files
                    .iter()
                    .copied()
                    .filter(|&file| self.run.file(file).has_role(&output.role_key))
                    .collect();
                for file in files {
                    let location = self.run.file(file).location.clone();
                    let record =
                        match self.try_accession_output(file, output, &step_run, &dataset) {
                            Ok(record) => record,
                            Err(AccessionError::CatalogConflict { .. })
                                if output.possible_duplicate =>
                            {
                                tracing::warn!(%location, "conflicting duplicate, skipped");
                                continue;
                            }
                            Err(err @ AccessionError::MissingAllDerivedFrom { .. }) => {
                                tracing::warn!(%location, %err, "ancestors absent, skipped");
                                continue;
                            }
                            Err(err) => return Err(err),
                        };
                    self.attach_quality_metrics(&record, file, &output.quality_metrics)?;
                    accessioned.push(record);
                }
            }
        }
        Ok(accessioned)
    }

    fn try_accession_output(
        &mut self,
        file: FileId,
        output: &OutputSpec,
        step_run: &Record,
        dataset: &str,
    ) -> Result<Record, AccessionError> {
        let derived_from = self.get_derived_from(file, &output.derived_from_files)?;
        let candidate = self.file_candidate(file, output, step_run, derived_from, dataset)?;
        self.accession_file(candidate, file)
    }

    fn attach_quality_metrics(
        &self,
        record: &Record,
        file: FileId,
        metrics: &[String],
    ) -> Result<(), AccessionError> {
        if metrics.is_empty() {
            return Ok(());
        }
        // Attachers see the record with its server-calculated properties.
        let canonical = self.catalog.get(record.id()?)?.ok_or_else(|| {
            AccessionError::MalformedRecord(format!(
                "record {} vanished after submission",
                record.id().unwrap_or("?")
            ))
        })?;
        let ctx = QcContext {
            run: &self.run,
            content: &self.content,
            catalog: &self.catalog,
            common: &self.common,
        };
        for name in metrics {
            let attacher = self
                .registry
                .get(name)
                .ok_or_else(|| AccessionError::UnknownQcMetric(name.clone()))?;
            if attacher.attach(&ctx, &canonical, file)?.is_some() {
                tracing::info!(metric = name.as_str(), record = canonical.id()?, "attached quality metric");
            }
        }
        Ok(())
    }

    /// Applies every declared step in order. Step order is a correctness
    /// contract: ancestors must be submitted before their descendants.
    pub fn accession_steps(
        &mut self,
        document: &StepDocument,
    ) -> Result<Vec<Record>, AccessionError> {
        document.validate(&self.registry)?;
        let mut all = Vec::new();
        for step in &document.steps {
            all.extend(self.accession_step(step)?);
        }
        tracing::info!(
            accessioned = all.len(),
            new = self.new_records.len(),
            "accessioning complete"
        );
        Ok(all)
    }
}

fn remove_local_copy(path: &Utf8Path) {
    if let Err(err) = std::fs::remove_file(path.as_std_path()) {
        tracing::warn!(path = %path, %err, "failed to remove local copy");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lab_pi_from_resource_path() {
        let common = CommonMetadata::new("/labs/encode-processing-pipeline/", "U41HG007000");
        assert_eq!(common.lab_pi(), "encode-processing-pipeline");
    }

    #[test]
    fn lab_pi_falls_back_to_raw_value() {
        let common = CommonMetadata::new("some-lab", "A1");
        assert_eq!(common.lab_pi(), "some-lab");
    }

    #[test]
    fn common_metadata_stamps_payload() {
        let common = CommonMetadata::new("/labs/x/", "A1");
        let mut payload = Map::new();
        common.extend(&mut payload);
        assert_eq!(payload["lab"], json!("/labs/x/"));
        assert_eq!(payload["award"], json!("A1"));
    }
}
