//! pgextract - export PostgreSQL tables and queries to CSV.
//!
//! Reads a JSON job file, runs its exports one after another on a single connection,
//! and prints one JSON outcome per export on stdout.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use pgextract_core::logging::{init_logging, log_dir, LogConfig};
use pgextract_core::{
    ConnectionManager, CsvFileSink, ExportCoordinator, ExtractError, JobConfig, Result, StateStore,
};

#[derive(Debug, Parser)]
#[command(name = "pgextract", version, about = "Export PostgreSQL tables and queries to CSV")]
struct Cli {
    /// Job file (JSON)
    #[arg(env = "PGEXTRACT_JOB")]
    job: PathBuf,

    /// State file, overriding the one named in the job
    #[arg(long, env = "PGEXTRACT_STATE_FILE")]
    state_file: Option<PathBuf>,

    /// Skip the bulk strategy for every export
    #[arg(long)]
    force_fallback: bool,

    /// Log filter, overriding PGEXTRACT_LOG
    #[arg(long)]
    log_filter: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut log_config = LogConfig::new(log_dir());
    if let Some(filter) = &cli.log_filter {
        log_config = log_config.with_filter(filter);
    }
    let _logging_guard = init_logging(log_config);

    tracing::info!(job = %cli.job.display(), "Starting pgextract");

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(category = e.category(), error = %e, "Export job failed");
            eprintln!("{}", e.format_detailed());
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let job = JobConfig::load(&cli.job)?;
    let mut exports = job.export_configs()?;
    if cli.force_fallback {
        for export in &mut exports {
            export.force_fallback = true;
        }
    }

    let mut state = match cli.state_file.or_else(|| job.state_file.clone()) {
        Some(path) => StateStore::load(path)?,
        None => StateStore::in_memory(),
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| ExtractError::internal(format!("Failed to create tokio runtime: {e}")))?;

    runtime.block_on(async {
        let mut conn = ConnectionManager::connect(job.connection.clone()).await?;
        let mut coordinator = ExportCoordinator::new(&mut conn);

        for export in &exports {
            let path = job.output_dir.join(artifact_file_name(&export.output_table));
            let mut sink = CsvFileSink::new(path);
            let prior = state.get(&export.output_table).cloned();

            let outcome = coordinator.export(export, prior.as_ref(), &mut sink).await?;

            state.set(&export.output_table, outcome.state.clone());
            state.save()?;
            println!("{}", serde_json::to_string(&outcome)?);
        }

        tracing::info!(exports = exports.len(), "Export job finished");
        Ok::<(), ExtractError>(())
    })
}

/// File name for an output table's artifact.
///
/// Characters outside `[A-Za-z0-9._-]` are replaced so the identifier is a safe
/// file name.
fn artifact_file_name(output_table: &str) -> String {
    let stem: String = output_table
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect();
    format!("{stem}.csv")
}
