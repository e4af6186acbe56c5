//! Incremental state persistence.
//!
//! Watermarks are kept in one JSON file keyed by output table, so each export picks up
//! where its previous run stopped.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{ExtractError, Result};
use crate::models::ExportState;

/// Watermark state of every export in a job.
#[derive(Debug, Clone, Default)]
pub struct StateStore {
    path: Option<PathBuf>,
    states: BTreeMap<String, ExportState>,
}

impl StateStore {
    /// State that is never written to disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load state from `path`. A missing file is an empty state.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let states = match std::fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => BTreeMap::new(),
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                ExtractError::config(format!("Invalid state file {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(ExtractError::storage_with_source(
                    format!("Failed to read state file {}", path.display()),
                    e,
                ))
            }
        };

        tracing::debug!(path = %path.display(), exports = states.len(), "State loaded");
        Ok(Self { path: Some(path), states })
    }

    /// State of an export.
    pub fn get(&self, output_table: &str) -> Option<&ExportState> {
        self.states.get(output_table)
    }

    /// Replace the state of an export; `None` forgets it.
    pub fn set(&mut self, output_table: impl Into<String>, state: Option<ExportState>) {
        let output_table = output_table.into();
        match state {
            Some(state) => {
                self.states.insert(output_table, state);
            }
            None => {
                self.states.remove(&output_table);
            }
        }
    }

    /// Path the state is saved to, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write the state file atomically.
    ///
    /// The new content goes to a temporary file in the same directory which then
    /// replaces the old file, so a crash never leaves a truncated state behind.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        std::fs::create_dir_all(dir)?;

        let json = serde_json::to_string_pretty(&self.states)?;
        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        file.write_all(json.as_bytes())?;
        file.as_file().sync_all()?;
        file.persist(path).map_err(|e| {
            ExtractError::storage_with_source(
                format!("Failed to replace state file {}", path.display()),
                e.error,
            )
        })?;

        tracing::debug!(path = %path.display(), exports = self.states.len(), "State saved");
        Ok(())
    }
}
