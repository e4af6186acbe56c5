//! Bulk export strategy.
//!
//! Hands a `COPY ... TO STDOUT` statement to the `psql` client with its standard output
//! redirected into the artifact file, then re-reads the file to check its structure and
//! pick up the watermark. Every failure past the connectivity check is reported as
//! [`StrategyOutcome::Inapplicable`] so the caller can fall back to the cursor strategy.

use std::fs::File;
use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;

use crate::error::Result;
use crate::models::{
    ConnectionConfig, ExportConfig, ExportResult, InapplicableReason, StrategyOutcome,
    TableMetadata, Watermark,
};
use crate::services::connection::{ConnectionManager, TlsMaterials};
use crate::services::sink::ExportSink;
use crate::services::sql::{build_copy_statement, quote_identifier};

/// A fully specified `psql` invocation.
///
/// Every value is a separate argument or environment variable; no shell is involved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsqlInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl PsqlInvocation {
    /// Build the invocation running `statement` after the session setup statements.
    pub fn new(config: &ConnectionConfig, tls: Option<&TlsMaterials>, statement: &str) -> Self {
        let mut args = vec![
            "--no-psqlrc".to_string(),
            "--quiet".to_string(),
            "-v".to_string(),
            "ON_ERROR_STOP=1".to_string(),
            "--host".to_string(),
            config.host.clone(),
            "--port".to_string(),
            config.port.to_string(),
            "--username".to_string(),
            config.username.clone(),
            "--dbname".to_string(),
            config.database.clone(),
        ];

        let mut commands = Vec::new();
        if let Some(schema) = &config.schema {
            commands.push(format!("SET search_path TO {}", quote_identifier(schema)));
        }
        commands.extend(config.init_statements.iter().cloned());
        commands.push(statement.to_string());
        for command in commands {
            args.push("-c".to_string());
            args.push(command);
        }

        let mut env = vec![
            ("PGCLIENTENCODING".to_string(), "UTF8".to_string()),
            ("PGAPPNAME".to_string(), config.options.application_name.clone()),
            ("PGCONNECT_TIMEOUT".to_string(), config.options.connect_timeout_secs.to_string()),
            ("PGSSLMODE".to_string(), config.ssl_mode().as_str().to_string()),
        ];
        if !config.password.is_empty() {
            env.push(("PGPASSWORD".to_string(), config.password.expose().to_string()));
        }
        if let Some(secs) = config.options.statement_timeout_secs {
            env.push(("PGOPTIONS".to_string(), format!("-c statement_timeout={secs}s")));
        }
        if let Some(tls) = tls {
            let paths = [
                ("PGSSLROOTCERT", tls.ca_path()),
                ("PGSSLCERT", tls.cert_path()),
                ("PGSSLKEY", tls.key_path()),
            ];
            for (name, path) in paths {
                if let Some(path) = path {
                    env.push((name.to_string(), path.display().to_string()));
                }
            }
        }

        Self { program: config.options.psql_path.clone(), args, env }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).envs(self.env.iter().map(|(k, v)| (k, v)));
        command
    }
}

/// What re-reading a bulk artifact found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSummary {
    /// Data rows (header excluded)
    pub rows: u64,
    /// Header row, if one was written
    pub header: Option<Vec<String>>,
    /// Last non-NULL value at the watermark position
    pub last_watermark: Option<String>,
}

/// Re-read a bulk artifact and check that every row has the width of the first.
///
/// With `watermark` set, the last non-empty field at that position is kept. `NULL`s
/// sort last under `ORDER BY`, so the final row alone is not enough.
pub fn inspect_output(
    path: &Path,
    has_header: bool,
    watermark: Option<usize>,
) -> std::result::Result<OutputSummary, InapplicableReason> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|e| InapplicableReason::Io(format!("cannot read {}: {e}", path.display())))?;

    let mut expected = None;
    let mut records = 0u64;
    let mut header = None;
    let mut last_watermark = None;

    for record in reader.records() {
        let record = record.map_err(|e| InapplicableReason::Io(e.to_string()))?;
        records += 1;

        let width = *expected.get_or_insert(record.len());
        if record.len() != width {
            return Err(InapplicableReason::Integrity {
                row: records,
                expected: width,
                found: record.len(),
            });
        }

        if has_header && records == 1 {
            header = Some(record.iter().map(String::from).collect());
            continue;
        }
        if let Some(i) = watermark {
            match record.get(i) {
                Some("") => {}
                Some(value) => last_watermark = Some(value.to_string()),
                None => {
                    return Err(InapplicableReason::WatermarkUnresolvable(format!(
                        "row has no field at position {}",
                        i + 1
                    )))
                }
            }
        }
    }

    let rows = if has_header { records.saturating_sub(1) } else { records };
    Ok(OutputSummary { rows, header, last_watermark })
}

/// Run `invocation` with its standard output written to `path`.
///
/// A nonzero exit, or an `ERROR:` on standard error, makes the result unusable.
pub async fn execute_copy(
    invocation: &PsqlInvocation,
    path: &Path,
) -> std::result::Result<(), InapplicableReason> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| InapplicableReason::Io(e.to_string()))?;
    }
    let file = File::create(path)
        .map_err(|e| InapplicableReason::Io(format!("cannot create {}: {e}", path.display())))?;

    let child = invocation
        .command()
        .stdin(Stdio::null())
        .stdout(Stdio::from(file))
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| InapplicableReason::Io(format!("cannot run {}: {e}", invocation.program)))?;
    let output = child
        .wait_with_output()
        .await
        .map_err(|e| InapplicableReason::Io(format!("{} did not finish: {e}", invocation.program)))?;

    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    if !output.status.success() {
        return Err(InapplicableReason::ProcessFailed { status: output.status.code(), stderr });
    }
    if stderr.contains("ERROR:") {
        return Err(InapplicableReason::QueryFailed(stderr));
    }
    Ok(())
}

/// Find the field index of the watermark column in a bulk artifact.
///
/// Uses the explicit column list when there is one, otherwise catalog ordinal
/// positions. Positions with gaps cannot be trusted and are refused.
pub fn watermark_index(
    config: &ExportConfig,
    table: Option<&TableMetadata>,
) -> std::result::Result<Option<usize>, InapplicableReason> {
    let Some(column) = config.watermark_column() else {
        return Ok(None);
    };

    if !config.columns().is_empty() {
        return config.columns().iter().position(|c| c == column).map(Some).ok_or_else(|| {
            InapplicableReason::WatermarkUnresolvable(format!(
                "column \"{column}\" is not in the column list"
            ))
        });
    }

    let table = table.ok_or_else(|| {
        InapplicableReason::WatermarkUnresolvable("no table metadata".to_string())
    })?;
    if !table.has_contiguous_ordinals() {
        return Err(InapplicableReason::WatermarkUnresolvable(format!(
            "ordinal positions of {}.{} have gaps",
            table.schema, table.name
        )));
    }
    let meta = table.column(column).ok_or_else(|| {
        InapplicableReason::WatermarkUnresolvable(format!("column \"{column}\" not in catalog"))
    })?;
    Ok(Some((meta.ordinal_position - 1) as usize))
}

/// Exports with `COPY` through the `psql` client.
pub struct BulkExportAdapter;

impl BulkExportAdapter {
    /// Run the export.
    ///
    /// Returns `Err` only when the connectivity check fails; anything else that goes
    /// wrong is `Inapplicable`.
    pub async fn export(
        conn: &mut ConnectionManager,
        config: &ExportConfig,
        query: &str,
        table: Option<&TableMetadata>,
        sink: &mut dyn ExportSink,
    ) -> Result<StrategyOutcome> {
        conn.ping().await?;

        Ok(match Self::run(conn, config, query, table, sink).await {
            Ok(result) => StrategyOutcome::Success(result),
            Err(reason) => StrategyOutcome::Inapplicable(reason),
        })
    }

    async fn run(
        conn: &ConnectionManager,
        config: &ExportConfig,
        query: &str,
        table: Option<&TableMetadata>,
        sink: &mut dyn ExportSink,
    ) -> std::result::Result<ExportResult, InapplicableReason> {
        let has_header = config.source.is_query();
        let index = watermark_index(config, table).inspect_err(|reason| {
            tracing::warn!(output_table = %config.output_table, %reason, "Watermark position unusable");
        })?;

        let statement = build_copy_statement(query, has_header);
        let invocation = PsqlInvocation::new(conn.config(), conn.tls_materials(), &statement);
        let path = sink.path().to_path_buf();

        tracing::debug!(
            output_table = %config.output_table,
            program = %invocation.program,
            path = %path.display(),
            "Starting bulk copy"
        );

        execute_copy(&invocation, &path).await?;
        let summary = inspect_output(&path, has_header, index)?;

        let columns = summary
            .header
            .or_else(|| (!config.columns().is_empty()).then(|| config.columns().to_vec()))
            .or_else(|| table.map(TableMetadata::column_names))
            .unwrap_or_default();

        tracing::debug!(output_table = %config.output_table, rows = summary.rows, "Bulk copy finished");

        Ok(ExportResult {
            rows: summary.rows,
            last_value: summary.last_watermark.map(Watermark::new),
            columns,
        })
    }
}
