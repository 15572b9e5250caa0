use std::collections::HashMap;

use serde_json::Value;

use crate::content::ContentProvider;
use crate::domain::RoleKey;
use crate::error::AccessionError;
use crate::metadata::{RunMetadata, extract_locations, short_task_name};

/// Stable handle into the run's task arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub usize);

/// Stable handle into the run's file arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId(pub usize);

/// One execution of a named pipeline task. `input_files`/`output_files` are
/// populated exactly once during the graph build and never mutated after.
#[derive(Debug, Clone)]
pub struct TaskInvocation {
    pub name: String,
    pub inputs: Value,
    pub outputs: Value,
    pub docker_image: Option<String>,
    pub input_files: Vec<FileId>,
    pub output_files: Vec<FileId>,
}

/// Deduplicated, content-addressed representation of one file location.
/// Identity is the location string; a missing producer marks a raw input
/// supplied before the run began.
#[derive(Debug, Clone)]
pub struct FileArtifact {
    pub location: String,
    pub md5sum: String,
    pub size: u64,
    pub role_keys: Vec<RoleKey>,
    pub producer: Option<TaskId>,
    pub consumers: Vec<TaskId>,
}

impl FileArtifact {
    pub fn has_role(&self, key: &RoleKey) -> bool {
        self.role_keys.contains(key)
    }
}

/// The provenance graph of one finished run: an arena of task invocations
/// and file artifacts linked by producer/consumer indices.
///
/// Built once from static metadata. Outputs are linked before inputs so that
/// a location appearing on both sides resolves to a single artifact with its
/// producer already assigned.
#[derive(Debug)]
pub struct WorkflowRun {
    metadata: RunMetadata,
    tasks: Vec<TaskInvocation>,
    files: Vec<FileArtifact>,
    by_location: HashMap<String, FileId>,
}

impl WorkflowRun {
    pub fn build<C: ContentProvider>(
        metadata: RunMetadata,
        content: &C,
    ) -> Result<Self, AccessionError> {
        let calls = metadata.calls.clone();
        let mut run = WorkflowRun {
            tasks: Vec::new(),
            files: Vec::new(),
            by_location: HashMap::new(),
            metadata,
        };

        for (qualified_name, calls) in &calls {
            for call in calls {
                run.tasks.push(TaskInvocation {
                    name: short_task_name(qualified_name).to_string(),
                    inputs: call.inputs.clone(),
                    outputs: call.outputs.clone(),
                    docker_image: call.docker_image.clone(),
                    input_files: Vec::new(),
                    output_files: Vec::new(),
                });
            }
        }

        // Outputs pass must complete for every task before any input is
        // linked, otherwise a file flowing from task A into task B would be
        // created without its producer.
        for index in 0..run.tasks.len() {
            let task = TaskId(index);
            let linked = run.link_section(task, Section::Outputs, content)?;
            run.tasks[index].output_files = linked;
        }
        for index in 0..run.tasks.len() {
            let task = TaskId(index);
            let linked = run.link_section(task, Section::Inputs, content)?;
            run.tasks[index].input_files = linked;
        }

        tracing::debug!(
            tasks = run.tasks.len(),
            files = run.files.len(),
            "provenance graph built"
        );
        Ok(run)
    }

    fn link_section<C: ContentProvider>(
        &mut self,
        task: TaskId,
        section: Section,
        content: &C,
    ) -> Result<Vec<FileId>, AccessionError> {
        let descriptor = match section {
            Section::Outputs => self.tasks[task.0].outputs.clone(),
            Section::Inputs => self.tasks[task.0].inputs.clone(),
        };
        let Value::Object(entries) = descriptor else {
            return Ok(Vec::new());
        };

        let mut linked = Vec::new();
        for (key, value) in entries {
            let Ok(role) = key.parse::<RoleKey>() else {
                // Descriptor keys that cannot serve as role keys carry no
                // file references worth tracking.
                continue;
            };
            for location in extract_locations(&value) {
                let file = self.obtain_or_create(&location, &role, content)?;
                match section {
                    Section::Outputs => {
                        let artifact = &mut self.files[file.0];
                        if artifact.producer.is_none() {
                            artifact.producer = Some(task);
                        }
                    }
                    Section::Inputs => {
                        let artifact = &mut self.files[file.0];
                        if !artifact.consumers.contains(&task) {
                            artifact.consumers.push(task);
                        }
                    }
                }
                if !linked.contains(&file) {
                    linked.push(file);
                }
            }
        }
        Ok(linked)
    }

    /// One artifact per distinct location. On a miss the content identity is
    /// fetched synchronously, exactly once for the lifetime of the run; a
    /// failed lookup aborts the build.
    fn obtain_or_create<C: ContentProvider>(
        &mut self,
        location: &str,
        role: &RoleKey,
        content: &C,
    ) -> Result<FileId, AccessionError> {
        if let Some(&file) = self.by_location.get(location) {
            let artifact = &mut self.files[file.0];
            if !artifact.role_keys.contains(role) {
                artifact.role_keys.push(role.clone());
            }
            return Ok(file);
        }

        let md5sum = content.hash(location)?;
        let size = content.size(location)?;
        let file = FileId(self.files.len());
        self.files.push(FileArtifact {
            location: location.to_string(),
            md5sum,
            size,
            role_keys: vec![role.clone()],
            producer: None,
            consumers: Vec::new(),
        });
        self.by_location.insert(location.to_string(), file);
        Ok(file)
    }

    pub fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }

    pub fn workflow_id(&self) -> Option<&str> {
        self.metadata.workflow_id()
    }

    pub fn task(&self, id: TaskId) -> &TaskInvocation {
        &self.tasks[id.0]
    }

    pub fn file(&self, id: FileId) -> &FileArtifact {
        &self.files[id.0]
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn tasks(&self) -> impl Iterator<Item = (TaskId, &TaskInvocation)> {
        self.tasks
            .iter()
            .enumerate()
            .map(|(index, task)| (TaskId(index), task))
    }

    pub fn files(&self) -> impl Iterator<Item = (FileId, &FileArtifact)> {
        self.files
            .iter()
            .enumerate()
            .map(|(index, file)| (FileId(index), file))
    }

    pub fn tasks_named(&self, name: &str) -> Vec<TaskId> {
        self.tasks()
            .filter(|(_, task)| task.name == name)
            .map(|(id, _)| id)
            .collect()
    }

    pub fn file_by_location(&self, location: &str) -> Option<FileId> {
        self.by_location.get(location).copied()
    }

    pub fn files_with_role(&self, role: &RoleKey) -> Vec<FileId> {
        self.files()
            .filter(|(_, file)| file.has_role(role))
            .map(|(id, _)| id)
            .collect()
    }

    /// Raw inputs: artifacts referenced under the given role that no task in
    /// the run produced.
    pub fn raw_inputs_with_role(&self, role: &RoleKey) -> Vec<FileId> {
        self.files()
            .filter(|(_, file)| file.producer.is_none() && file.has_role(role))
            .map(|(id, _)| id)
            .collect()
    }
}

#[derive(Clone, Copy)]
enum Section {
    Outputs,
    Inputs,
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use camino::Utf8PathBuf;
    use serde_json::json;

    use super::*;

    struct MapContentProvider {
        objects: HashMap<String, (String, u64)>,
        hash_calls: Mutex<HashMap<String, usize>>,
    }

    impl MapContentProvider {
        fn new(objects: &[(&str, &str, u64)]) -> Self {
            Self {
                objects: objects
                    .iter()
                    .map(|(location, md5, size)| {
                        (location.to_string(), (md5.to_string(), *size))
                    })
                    .collect(),
                hash_calls: Mutex::new(HashMap::new()),
            }
        }

        fn hash_calls(&self, location: &str) -> usize {
            *self
                .hash_calls
                .lock()
                .unwrap()
                .get(location)
                .unwrap_or(&0)
        }

        fn lookup(&self, location: &str) -> Result<&(String, u64), AccessionError> {
            self.objects
                .get(location)
                .ok_or_else(|| AccessionError::ContentLookup {
                    location: location.to_string(),
                    message: "object not found".to_string(),
                })
        }
    }

    impl ContentProvider for MapContentProvider {
        fn hash(&self, location: &str) -> Result<String, AccessionError> {
            *self
                .hash_calls
                .lock()
                .unwrap()
                .entry(location.to_string())
                .or_insert(0) += 1;
            Ok(self.lookup(location)?.0.clone())
        }

        fn size(&self, location: &str) -> Result<u64, AccessionError> {
            Ok(self.lookup(location)?.1)
        }

        fn read(&self, location: &str) -> Result<Vec<u8>, AccessionError> {
            Err(AccessionError::ContentLookup {
                location: location.to_string(),
                message: "read not supported by mock".to_string(),
            })
        }

        fn download(&self, location: &str) -> Result<Utf8PathBuf, AccessionError> {
            Err(AccessionError::ContentLookup {
                location: location.to_string(),
                message: "download not supported by mock".to_string(),
            })
        }
    }

    fn two_task_metadata() -> RunMetadata {
        serde_json::from_value(json!({
            "calls": {
                "atac.align": [{
                    "inputs": {"fastqs": ["gs://b/a.fastq.gz"]},
                    "outputs": {"bam": "gs://b/x.bam"}
                }],
                "atac.dedup": [{
                    "inputs": {"bam": "gs://b/x.bam"},
                    "outputs": {"nodup_bam": "gs://b/y.bam"}
                }]
            }
        }))
        .unwrap()
    }

    fn provider() -> MapContentProvider {
        MapContentProvider::new(&[
            ("gs://b/a.fastq.gz", "aa11", 10),
            ("gs://b/x.bam", "bb22", 20),
            ("gs://b/y.bam", "cc33", 30),
        ])
    }

    #[test]
    fn one_artifact_per_distinct_location() {
        let run = WorkflowRun::build(two_task_metadata(), &provider()).unwrap();
        assert_eq!(run.file_count(), 3);
        assert_eq!(run.task_count(), 2);
    }

    #[test]
    fn shared_location_links_producer_and_consumer() {
        let run = WorkflowRun::build(two_task_metadata(), &provider()).unwrap();
        let bam = run.file_by_location("gs://b/x.bam").unwrap();
        let artifact = run.file(bam);

        let producer = artifact.producer.expect("bam must have a producer");
        assert_eq!(run.task(producer).name, "align");

        let consumers: Vec<&str> = artifact
            .consumers
            .iter()
            .map(|&task| run.task(task).name.as_str())
            .collect();
        assert_eq!(consumers, vec!["dedup"]);
    }

    #[test]
    fn producer_assigned_at_most_once() {
        // Two scattered invocations claiming the same output location: the
        // first one in build order wins, the second never reassigns.
        let metadata: RunMetadata = serde_json::from_value(json!({
            "calls": {
                "atac.merge": [
                    {"inputs": {}, "outputs": {"pooled": "gs://b/pooled.bed"}},
                    {"inputs": {}, "outputs": {"pooled": "gs://b/pooled.bed"}}
                ]
            }
        }))
        .unwrap();
        let content = MapContentProvider::new(&[("gs://b/pooled.bed", "dd44", 5)]);
        let run = WorkflowRun::build(metadata, &content).unwrap();

        assert_eq!(run.file_count(), 1);
        let file = run.file_by_location("gs://b/pooled.bed").unwrap();
        assert_eq!(run.file(file).producer, Some(TaskId(0)));
    }

    #[test]
    fn role_keys_accumulate_without_duplicates() {
        let metadata: RunMetadata = serde_json::from_value(json!({
            "calls": {
                "atac.filter": [{
                    "inputs": {},
                    "outputs": {"bam": "gs://b/x.bam", "nodup_bam": "gs://b/x.bam"}
                }],
                "atac.xcor": [{
                    "inputs": {"bam": "gs://b/x.bam"},
                    "outputs": {}
                }]
            }
        }))
        .unwrap();
        let content = MapContentProvider::new(&[("gs://b/x.bam", "bb22", 20)]);
        let run = WorkflowRun::build(metadata, &content).unwrap();

        let file = run.file_by_location("gs://b/x.bam").unwrap();
        let roles: Vec<&str> = run.file(file).role_keys.iter().map(RoleKey::as_str).collect();
        assert_eq!(roles.len(), 2);
        assert!(roles.contains(&"bam"));
        assert!(roles.contains(&"nodup_bam"));
    }

    #[test]
    fn raw_inputs_have_no_producer() {
        let run = WorkflowRun::build(two_task_metadata(), &provider()).unwrap();
        let fastqs = run.raw_inputs_with_role(&"fastqs".parse().unwrap());
        assert_eq!(fastqs.len(), 1);
        assert_eq!(run.file(fastqs[0]).location, "gs://b/a.fastq.gz");
    }

    #[test]
    fn content_lookup_failure_is_fatal() {
        let content = MapContentProvider::new(&[("gs://b/a.fastq.gz", "aa11", 10)]);
        let err = WorkflowRun::build(two_task_metadata(), &content).unwrap_err();
        assert!(matches!(err, AccessionError::ContentLookup { .. }));
    }

    #[test]
    fn one_content_lookup_per_location() {
        let content = provider();
        let _run = WorkflowRun::build(two_task_metadata(), &content).unwrap();
        // x.bam appears as output of align and input of dedup.
        assert_eq!(content.hash_calls("gs://b/x.bam"), 1);
    }
}
