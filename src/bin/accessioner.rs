use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::Parser;
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use accessioner::catalog::CatalogHttpClient;
use accessioner::content::GcsContentProvider;
use accessioner::engine::{AccessionEngine, CommonMetadata};
use accessioner::error::AccessionError;
use accessioner::graph::WorkflowRun;
use accessioner::metadata::RunMetadata;
use accessioner::qc::QcRegistry;
use accessioner::steps::StepDocument;

#[derive(Parser)]
#[command(name = "accessioner")]
#[command(about = "Accession finished pipeline outputs to a metadata catalog")]
#[command(version, author)]
struct Cli {
    /// Path to the run metadata JSON emitted by the workflow engine.
    #[arg(long)]
    metadata: Utf8PathBuf,

    /// Path to the accessioning step document.
    #[arg(long)]
    steps: Utf8PathBuf,

    /// Catalog server: "dev", "prod", or a full base URL.
    #[arg(long, default_value = "dev")]
    server: String,

    /// Submitting lab, as a catalog resource path.
    #[arg(long)]
    lab: String,

    /// Award the submission is attributed to.
    #[arg(long)]
    award: String,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<AccessionError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &AccessionError) -> u8 {
    match error {
        AccessionError::MetadataRead(_)
        | AccessionError::MetadataParse(_)
        | AccessionError::StepsRead(_)
        | AccessionError::StepsParse(_)
        | AccessionError::UnknownQcMetric(_) => 2,
        AccessionError::ContentHttp(_)
        | AccessionError::ContentLookup { .. }
        | AccessionError::CatalogHttp(_)
        | AccessionError::CatalogStatus { .. }
        | AccessionError::Authentication(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let metadata = RunMetadata::load(&cli.metadata).into_diagnostic()?;
    tracing::debug!(
        declared_inputs = metadata.input_whitelist().len(),
        declared_outputs = metadata.output_whitelist().len(),
        "declared workflow locations"
    );
    let document = StepDocument::load(&cli.steps).into_diagnostic()?;
    let registry = QcRegistry::standard();
    document.validate(&registry).into_diagnostic()?;

    let content = GcsContentProvider::new().into_diagnostic()?;
    let key = std::env::var("CATALOG_KEY").unwrap_or_default();
    let secret = std::env::var("CATALOG_SECRET").unwrap_or_default();
    let catalog = CatalogHttpClient::new(&cli.server, key, secret).into_diagnostic()?;

    let run = WorkflowRun::build(metadata, &content).into_diagnostic()?;
    tracing::info!(
        workflow = run.workflow_id().unwrap_or("unknown"),
        tasks = run.task_count(),
        files = run.file_count(),
        "loaded run"
    );

    let common = CommonMetadata::new(cli.lab, cli.award);
    let mut engine =
        AccessionEngine::new(run, content, catalog, common, registry).into_diagnostic()?;

    // Accessioning outputs before their raw inputs exist would leave
    // dangling lineage.
    if !engine.raw_files_accessioned().into_diagnostic()? {
        tracing::warn!("raw sequencing inputs lack catalog records");
        miette::bail!("raw sequencing inputs must be accessioned before pipeline outputs");
    }

    let accessioned = engine.accession_steps(&document).into_diagnostic()?;

    let summary = serde_json::json!({
        "accessioned": accessioned.len(),
        "new_records": engine
            .new_records()
            .iter()
            .filter_map(|record| record.id().ok())
            .collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&summary).into_diagnostic()?);
    Ok(())
}
