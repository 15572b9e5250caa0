use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum AccessionError {
    #[error("invalid role key: {0:?}")]
    InvalidRoleKey(String),

    #[error("invalid output type: {0:?}")]
    InvalidOutputType(String),

    #[error("invalid object location: {0}")]
    InvalidLocation(String),

    #[error("failed to read run metadata at {0}")]
    MetadataRead(String),

    #[error("failed to parse run metadata: {0}")]
    MetadataParse(String),

    #[error("failed to read accessioning steps at {0}")]
    StepsRead(String),

    #[error("failed to parse accessioning steps: {0}")]
    StepsParse(String),

    #[error("unknown quality metric in step spec: {0}")]
    UnknownQcMetric(String),

    #[error("content lookup failed for {location}: {message}")]
    ContentLookup { location: String, message: String },

    #[error("content store request failed: {0}")]
    ContentHttp(String),

    #[error("catalog request failed: {0}")]
    CatalogHttp(String),

    #[error("catalog returned status {status}: {message}")]
    CatalogStatus { status: u16, message: String },

    #[error("catalog rejected {identifier} as a conflicting duplicate")]
    CatalogConflict { identifier: String },

    #[error("cannot establish submitting identity: {0}")]
    Authentication(String),

    #[error("missing all of the derived_from files on the catalog (task {task}, key {role_key})")]
    MissingAllDerivedFrom { task: String, role_key: String },

    #[error("missing some of the derived_from files on the catalog (task {task}, key {role_key})")]
    MissingSomeDerivedFrom { task: String, role_key: String },

    #[error("task graph contains a cycle through task {0}")]
    CyclicLineage(String),

    #[error("no task named {0} in the run")]
    NoSuchTask(String),

    #[error("task {0} has no execution image recorded")]
    MissingExecutionImage(String),

    #[error("raw input {0} has no catalog record")]
    RawInputNotCatalogued(String),

    #[error("run has no raw {0} inputs")]
    NoRawInputs(String),

    #[error("{0} has no producing task in the run")]
    NoProducingTask(String),

    #[error("malformed catalog record: {0}")]
    MalformedRecord(String),

    #[error("quality metric payload: {0}")]
    QcPayload(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}
