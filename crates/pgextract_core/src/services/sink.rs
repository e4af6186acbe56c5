//! Artifact sinks.
//!
//! A sink receives the rows of one export and owns the file they end up in. The bulk
//! strategy writes that file directly through [`ExportSink::path`]; the cursor strategy
//! goes through [`ExportSink::write_header`] and [`ExportSink::write_row`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::error::{ExtractError, Result};

/// Receives exported rows.
pub trait ExportSink: Send {
    /// Path of the artifact being produced.
    fn path(&self) -> &Path;

    /// Write the header row.
    fn write_header(&mut self, names: &[String]) -> Result<()>;

    /// Write one data row. `None` is SQL NULL.
    fn write_row(&mut self, fields: &[Option<&str>]) -> Result<()>;

    /// Flush everything written so far and return the artifact path.
    fn finalize(&mut self) -> Result<PathBuf>;

    /// Throw away partial output so another attempt can start from scratch.
    fn reset(&mut self) -> Result<()>;

    /// Remove the artifact; the export produced nothing to import.
    fn discard(&mut self) -> Result<()>;

    /// Write the manifest next to the artifact.
    fn write_manifest(&mut self, manifest: &Manifest) -> Result<PathBuf>;
}

/// Sidecar describing a finished artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Destination table identifier
    pub destination: String,
    /// Append instead of replace
    pub incremental: bool,
    /// Column names, for artifacts written without a header row
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<String>,
    /// Data rows in the artifact
    pub rows: u64,
    /// When the artifact was finished
    pub created_at: DateTime<Utc>,
}

/// Writes rows to a CSV file in the same dialect as `COPY ... FORCE_QUOTE *`.
///
/// Every value is double-quoted; NULL is an empty unquoted field. The file is created
/// on the first write, so a bulk run can own it until then.
pub struct CsvFileSink {
    path: PathBuf,
    writer: Option<csv::Writer<File>>,
}

impl CsvFileSink {
    /// Create a sink writing to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), writer: None }
    }

    /// Path of the manifest sidecar.
    pub fn manifest_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".manifest");
        PathBuf::from(name)
    }

    fn writer(&mut self) -> Result<&mut csv::Writer<File>> {
        if self.writer.is_none() {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| {
                    ExtractError::storage_with_source(
                        format!("Failed to create directory {}", parent.display()),
                        e,
                    )
                })?;
            }
            let writer = csv::WriterBuilder::new()
                .quote_style(csv::QuoteStyle::Never)
                .terminator(csv::Terminator::Any(b'\n'))
                .from_path(&self.path)?;
            self.writer = Some(writer);
        }
        self.writer.as_mut().ok_or_else(|| ExtractError::internal("CSV writer missing"))
    }

    fn remove(path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ExtractError::storage_with_source(
                format!("Failed to remove {}", path.display()),
                e,
            )),
        }
    }
}

/// Quote a value the way COPY does with `FORCE_QUOTE *`.
fn quote_field(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

/// Quote a column name the way `COPY ... HEADER` does.
///
/// Names are left bare unless they contain the delimiter, a quote or a line break.
/// A lone `\.` column is quoted so it cannot read as an end-of-data marker.
fn quote_header_field(name: &str, single_column: bool) -> String {
    let needs_quotes = (single_column && name == "\\.")
        || name.contains([',', '"', '\n', '\r']);
    if needs_quotes {
        quote_field(name)
    } else {
        name.to_string()
    }
}

impl ExportSink for CsvFileSink {
    fn path(&self) -> &Path {
        &self.path
    }

    fn write_header(&mut self, names: &[String]) -> Result<()> {
        let single_column = names.len() == 1;
        let record: Vec<String> =
            names.iter().map(|n| quote_header_field(n, single_column)).collect();
        self.writer()?.write_record(&record)?;
        Ok(())
    }

    fn write_row(&mut self, fields: &[Option<&str>]) -> Result<()> {
        let record: Vec<String> =
            fields.iter().map(|f| f.map(quote_field).unwrap_or_default()).collect();
        self.writer()?.write_record(&record)?;
        Ok(())
    }

    fn finalize(&mut self) -> Result<PathBuf> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        } else if !self.path.exists() {
            self.writer()?;
            self.writer = None;
        }
        Ok(self.path.clone())
    }

    fn reset(&mut self) -> Result<()> {
        self.writer = None;
        Self::remove(&self.path)
    }

    fn discard(&mut self) -> Result<()> {
        self.reset()?;
        Self::remove(&self.manifest_path())
    }

    fn write_manifest(&mut self, manifest: &Manifest) -> Result<PathBuf> {
        let path = self.manifest_path();
        let json = serde_json::to_string_pretty(manifest)?;
        std::fs::write(&path, json).map_err(|e| {
            ExtractError::storage_with_source(format!("Failed to write {}", path.display()), e)
        })?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> Manifest {
        Manifest {
            destination: "in.c-main.orders".into(),
            incremental: true,
            columns: vec!["id".into(), "v".into()],
            rows: 2,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_rows_match_copy_dialect() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvFileSink::new(dir.path().join("out.csv"));

        sink.write_header(&["id".to_string(), "note".to_string()]).unwrap();
        sink.write_row(&[Some("1"), Some("say \"hi\", ok")]).unwrap();
        sink.write_row(&[Some("2"), None]).unwrap();
        sink.write_row(&[Some("3"), Some("")]).unwrap();
        let path = sink.finalize().unwrap();

        assert_eq!(
            std::fs::read_to_string(path).unwrap(),
            "id,note\n\"1\",\"say \"\"hi\"\", ok\"\n\"2\",\n\"3\",\"\"\n"
        );
    }

    #[test]
    fn test_header_quoted_only_when_needed() {
        assert_eq!(quote_header_field("id", false), "id");
        assert_eq!(quote_header_field("?column?", false), "?column?");
        assert_eq!(quote_header_field("a,b", false), "\"a,b\"");
        assert_eq!(quote_header_field("say \"hi\"", false), "\"say \"\"hi\"\"\"");
        assert_eq!(quote_header_field("two\nlines", false), "\"two\nlines\"");
        assert_eq!(quote_header_field("\\.", true), "\"\\.\"");
        assert_eq!(quote_header_field("\\.", false), "\\.");
    }

    #[test]
    fn test_header_with_special_names() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvFileSink::new(dir.path().join("out.csv"));

        sink.write_header(&["id".to_string(), "total, net".to_string()]).unwrap();
        sink.write_row(&[Some("1"), Some("9.50")]).unwrap();
        let path = sink.finalize().unwrap();

        assert_eq!(
            std::fs::read_to_string(path).unwrap(),
            "id,\"total, net\"\n\"1\",\"9.50\"\n"
        );
    }

    #[test]
    fn test_reset_removes_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvFileSink::new(dir.path().join("out.csv"));

        sink.write_row(&[Some("partial")]).unwrap();
        sink.reset().unwrap();
        assert!(!sink.path().exists());

        sink.write_row(&[Some("fresh")]).unwrap();
        let path = sink.finalize().unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "\"fresh\"\n");
    }

    #[test]
    fn test_finalize_keeps_externally_written_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvFileSink::new(dir.path().join("out.csv"));
        std::fs::write(sink.path(), "\"1\"\n").unwrap();

        let path = sink.finalize().unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "\"1\"\n");
    }

    #[test]
    fn test_manifest_written_and_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvFileSink::new(dir.path().join("orders.csv"));
        sink.write_row(&[Some("1"), Some("a")]).unwrap();
        sink.finalize().unwrap();

        let path = sink.write_manifest(&manifest()).unwrap();
        assert_eq!(path, dir.path().join("orders.csv.manifest"));
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["destination"], "in.c-main.orders");
        assert_eq!(json["incremental"], true);
        assert_eq!(json["rows"], 2);
        assert!(json["createdAt"].is_string());

        sink.discard().unwrap();
        assert!(!path.exists());
        assert!(!sink.path().exists());
    }

    #[test]
    fn test_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvFileSink::new(dir.path().join("nested/deeper/out.csv"));
        sink.write_row(&[Some("1")]).unwrap();
        assert!(sink.finalize().unwrap().exists());
    }
}
