//! Job file model.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{ExtractError, Result};
use crate::models::connection::ConnectionConfig;
use crate::models::export::{ExportConfig, ExportDefinition};

/// A job file: one source database and the exports to run against it.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobConfig {
    /// Source database
    #[serde(rename = "db")]
    pub connection: ConnectionConfig,
    /// Directory receiving the CSV artifacts
    pub output_dir: PathBuf,
    /// Where watermark state is kept between runs
    pub state_file: Option<PathBuf>,
    /// Exports, run in order
    pub exports: Vec<ExportDefinition>,
}

impl JobConfig {
    /// Load a job file from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ExtractError::config(format!("Failed to read job file {}: {e}", path.display()))
        })?;
        Self::parse(&content)
    }

    /// Parse a job from JSON.
    pub fn parse(content: &str) -> Result<Self> {
        let job: JobConfig = serde_json::from_str(content)
            .map_err(|e| ExtractError::config(format!("Invalid job file: {e}")))?;
        job.connection.validate().map_err(ExtractError::config)?;
        if job.exports.is_empty() {
            return Err(ExtractError::config("Job has no exports"));
        }
        Ok(job)
    }

    /// Validated export configurations, in order.
    pub fn export_configs(&self) -> Result<Vec<ExportConfig>> {
        self.exports.iter().cloned().map(ExportConfig::try_from).collect()
    }
}
