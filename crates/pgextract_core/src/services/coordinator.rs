//! Export orchestration.
//!
//! Runs the bulk strategy first and falls back to the cursor strategy when the bulk
//! strategy is inapplicable, then settles the artifact and the incremental state.

use chrono::Utc;
use tracing::Instrument;
use uuid::Uuid;

use crate::error::{ExtractError, Result};
use crate::models::{
    ExportConfig, ExportOutcome, ExportResult, ExportState, StrategyOutcome, TableMetadata,
};
use crate::services::bulk::BulkExportAdapter;
use crate::services::connection::ConnectionManager;
use crate::services::cursor::CursorExportAdapter;
use crate::services::retry::RetryPolicy;
use crate::services::schema::MetadataProvider;
use crate::services::sink::{ExportSink, Manifest};
use crate::services::sql::build_export_query;

/// Runs exports on one connection.
pub struct ExportCoordinator<'a> {
    conn: &'a mut ConnectionManager,
}

impl<'a> ExportCoordinator<'a> {
    /// Create a coordinator on an open connection.
    pub fn new(conn: &'a mut ConnectionManager) -> Self {
        Self { conn }
    }

    /// Export one configuration into `sink`.
    ///
    /// Fails only once both strategies are exhausted, or earlier on a configuration
    /// error.
    pub async fn export(
        &mut self,
        config: &ExportConfig,
        prior: Option<&ExportState>,
        sink: &mut dyn ExportSink,
    ) -> Result<ExportOutcome> {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("export", %run_id, output_table = %config.output_table);
        self.run(config, prior, sink).instrument(span).await
    }

    async fn run(
        &mut self,
        config: &ExportConfig,
        prior: Option<&ExportState>,
        sink: &mut dyn ExportSink,
    ) -> Result<ExportOutcome> {
        config.validate()?;
        self.conn.ensure_alive(&RetryPolicy::reconnect()).await?;

        let table = match config.source.table() {
            Some(table) => Some(MetadataProvider::get_table(self.conn, table).await?),
            None => None,
        };
        if let Some(table) = &table {
            check_watermark_column(config, table)?;
        }

        let query = build_export_query(config, prior);
        tracing::debug!(query = %query, "Export query built");

        let result = if config.force_fallback {
            tracing::info!("Bulk export disabled, using cursor export");
            None
        } else {
            let outcome =
                BulkExportAdapter::export(self.conn, config, &query, table.as_ref(), sink).await;
            settle_bulk(outcome, sink)?
        };

        let result = match result {
            Some(result) => result,
            None => CursorExportAdapter::export(self.conn, config, &query, sink).await?,
        };

        finish(config, prior, result, sink)
    }
}

/// Take a bulk result, or clear whatever the bulk strategy left in `sink`.
///
/// `None` means the cursor strategy has to run.
pub fn settle_bulk(
    outcome: Result<StrategyOutcome>,
    sink: &mut dyn ExportSink,
) -> Result<Option<ExportResult>> {
    match outcome {
        Ok(StrategyOutcome::Success(result)) => Ok(Some(result)),
        Ok(StrategyOutcome::Inapplicable(reason)) => {
            tracing::warn!(%reason, "Bulk export failed, falling back to cursor export");
            sink.reset()?;
            Ok(None)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Bulk export unavailable, falling back to cursor export");
            sink.reset()?;
            Ok(None)
        }
    }
}

/// Check that the watermark column exists and has an orderable type.
pub fn check_watermark_column(config: &ExportConfig, table: &TableMetadata) -> Result<()> {
    let Some(name) = config.watermark_column() else {
        return Ok(());
    };
    let column = table.column(name).ok_or_else(|| {
        ExtractError::config(format!(
            "Incremental fetching column \"{name}\" does not exist in table \"{}.{}\"",
            table.schema, table.name
        ))
    })?;
    if !column.is_watermark_compatible() {
        return Err(ExtractError::config(format!(
            "Column \"{name}\" of type \"{}\" cannot be used for incremental fetching; \
             use an integer, numeric, float or timestamp column",
            column.data_type
        )));
    }
    Ok(())
}

/// Settle the artifact and compute the outcome of a finished strategy run.
pub fn finish(
    config: &ExportConfig,
    prior: Option<&ExportState>,
    result: ExportResult,
    sink: &mut dyn ExportSink,
) -> Result<ExportOutcome> {
    let incremental_fetching = config.incremental_fetching.is_some();

    if result.rows == 0 {
        sink.discard()?;
        tracing::warn!(output_table = %config.output_table, "Export produced no rows, nothing to import");
        return Ok(ExportOutcome {
            output_table: config.output_table.clone(),
            rows: 0,
            state: if incremental_fetching { prior.cloned() } else { None },
        });
    }

    let path = sink.finalize()?;
    sink.write_manifest(&Manifest {
        destination: config.output_table.clone(),
        incremental: config.incremental,
        columns: if config.source.is_query() { Vec::new() } else { result.columns },
        rows: result.rows,
        created_at: Utc::now(),
    })?;

    let state = if incremental_fetching {
        result.last_value.map(|last_fetched_row| ExportState { last_fetched_row }).or_else(|| prior.cloned())
    } else {
        None
    };

    tracing::info!(
        output_table = %config.output_table,
        rows = result.rows,
        path = %path.display(),
        watermark = state.as_ref().map(|s| s.last_fetched_row.as_str()),
        "Export finished"
    );

    Ok(ExportOutcome { output_table: config.output_table.clone(), rows: result.rows, state })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::schema::{ColumnMetadataBuilder, TableKind, TableMetadataBuilder};
    use crate::models::{InapplicableReason, TableRef, Watermark};
    use crate::services::sink::CsvFileSink;

    fn orders() -> ExportConfig {
        ExportConfig::table(TableRef::new("public", "orders"), "in.c-main.orders")
    }

    fn table() -> TableMetadata {
        let mut builder =
            TableMetadataBuilder::new("orders").schema("public").kind(TableKind::Table).row_count(3);
        for (name, ty, position) in [("id", "integer", 1), ("v", "text", 2), ("at", "timestamp(3) without time zone", 3)] {
            builder.push_column(
                ColumnMetadataBuilder::new(name, ty)
                    .nullable(position != 1)
                    .ordinal_position(position)
                    .build()
                    .unwrap(),
            );
        }
        builder.build().unwrap()
    }

    fn result(rows: u64, last: Option<&str>) -> ExportResult {
        ExportResult {
            rows,
            last_value: last.map(Watermark::new),
            columns: vec!["id".into(), "v".into(), "at".into()],
        }
    }

    #[test]
    fn test_watermark_column_checks() {
        let meta = table();
        assert!(check_watermark_column(&orders(), &meta).is_ok());
        assert!(check_watermark_column(&orders().with_incremental_fetching("id", None), &meta).is_ok());
        assert!(check_watermark_column(&orders().with_incremental_fetching("at", None), &meta).is_ok());

        let err = check_watermark_column(&orders().with_incremental_fetching("v", None), &meta).unwrap_err();
        assert!(err.is_configuration());
        let err =
            check_watermark_column(&orders().with_incremental_fetching("missing", None), &meta).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_finish_writes_manifest_and_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvFileSink::new(dir.path().join("orders.csv"));
        sink.write_row(&[Some("1"), Some("a"), None]).unwrap();

        let config = orders().with_incremental_fetching("id", None);
        let outcome = finish(&config, None, result(1, Some("1")), &mut sink).unwrap();

        assert_eq!(outcome.rows, 1);
        assert_eq!(outcome.state, Some(ExportState::new("1")));
        assert!(sink.path().exists());
        assert!(sink.manifest_path().exists());
    }

    #[test]
    fn test_finish_without_incremental_has_no_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvFileSink::new(dir.path().join("orders.csv"));
        sink.write_row(&[Some("1"), Some("a"), None]).unwrap();

        let outcome = finish(&orders(), None, result(1, None), &mut sink).unwrap();
        assert_eq!(outcome.state, None);
    }

    #[test]
    fn test_zero_rows_discards_and_keeps_prior_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvFileSink::new(dir.path().join("orders.csv"));
        std::fs::write(sink.path(), "").unwrap();

        let config = orders().with_incremental_fetching("id", None);
        let prior = ExportState::new("3");
        let outcome = finish(&config, Some(&prior), result(0, None), &mut sink).unwrap();

        assert_eq!(outcome.rows, 0);
        assert_eq!(outcome.state, Some(prior));
        assert!(!sink.path().exists());
        assert!(!sink.manifest_path().exists());
    }

    #[test]
    fn test_zero_rows_without_prior_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvFileSink::new(dir.path().join("orders.csv"));

        let config = orders().with_incremental_fetching("id", None);
        let outcome = finish(&config, None, result(0, None), &mut sink).unwrap();
        assert_eq!(outcome.state, None);
    }

    #[test]
    fn test_settle_bulk_keeps_success() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvFileSink::new(dir.path().join("orders.csv"));
        std::fs::write(sink.path(), "\"1\",\"a\",\n").unwrap();

        let settled = settle_bulk(Ok(StrategyOutcome::Success(result(1, Some("1")))), &mut sink).unwrap();
        assert_eq!(settled.map(|r| r.rows), Some(1));
        assert!(sink.path().exists());
    }

    #[test]
    fn test_settle_bulk_removes_ragged_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvFileSink::new(dir.path().join("orders.csv"));
        std::fs::write(sink.path(), "\"1\",\"a\"\n\"2\"\n").unwrap();

        let reason = InapplicableReason::Integrity { row: 2, expected: 2, found: 1 };
        let settled = settle_bulk(Ok(StrategyOutcome::Inapplicable(reason)), &mut sink).unwrap();

        assert!(settled.is_none());
        assert!(!sink.path().exists());
    }

    #[test]
    fn test_settle_bulk_falls_back_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvFileSink::new(dir.path().join("orders.csv"));
        std::fs::write(sink.path(), "partial").unwrap();

        let settled = settle_bulk(Err(ExtractError::connectivity("Connection closed")), &mut sink).unwrap();
        assert!(settled.is_none());
        assert!(!sink.path().exists());
    }
}
