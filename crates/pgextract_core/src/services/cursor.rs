//! Cursor export strategy.
//!
//! Declares a server-side cursor inside a transaction and fetches it in batches, so
//! memory stays bounded regardless of result size. Rows travel over the text protocol
//! and therefore arrive in the same textual form `COPY` would write them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use deadpool_postgres::Transaction;
use tokio_postgres::types::Type;
use tokio_postgres::{SimpleQueryMessage, SimpleQueryRow};

use crate::error::{ExtractError, Result};
use crate::models::{ExportConfig, ExportResult, Watermark};
use crate::services::connection::ConnectionManager;
use crate::services::retry::{best_effort, RetryPolicy};
use crate::services::sink::ExportSink;

static LAST_CURSOR_ID: AtomicU64 = AtomicU64::new(0);

/// Generate a cursor name unique within this process.
///
/// Based on epoch microseconds, bumped when two names are requested in the same tick.
pub fn next_cursor_name() -> String {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_micros() as u64).unwrap_or(0);
    let mut last = LAST_CURSOR_ID.load(Ordering::Relaxed);
    let id = loop {
        let candidate = now.max(last + 1);
        match LAST_CURSOR_ID.compare_exchange(last, candidate, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => break candidate,
            Err(current) => last = current,
        }
    };
    format!("pgextract_cursor_{id}")
}

/// Lifecycle of one cursor run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    Idle,
    CursorOpen,
    Fetching,
    Success,
    Failed,
    Closed,
}

impl CursorState {
    /// Check if a cursor exists on the server and must be closed.
    pub fn holds_cursor(&self) -> bool {
        matches!(self, Self::CursorOpen | Self::Fetching | Self::Success | Self::Failed)
    }
}

/// How each result column is written.
#[derive(Debug, Clone)]
pub struct RowShape {
    /// Result column names
    pub names: Vec<String>,
    /// Which columns are boolean
    pub booleans: Vec<bool>,
    /// Index of the watermark column
    pub watermark: Option<usize>,
}

impl RowShape {
    /// Describe the result columns.
    ///
    /// A watermark column missing from the result is a configuration error.
    pub fn new(columns: &[(String, Type)], watermark_column: Option<&str>) -> Result<Self> {
        let names: Vec<String> = columns.iter().map(|(name, _)| name.clone()).collect();
        let booleans = columns.iter().map(|(_, ty)| *ty == Type::BOOL).collect();
        let watermark = watermark_column
            .map(|column| {
                names.iter().position(|n| n == column).ok_or_else(|| {
                    ExtractError::config(format!(
                        "Incremental fetching column \"{column}\" is not in the result set"
                    ))
                })
            })
            .transpose()?;
        Ok(Self { names, booleans, watermark })
    }
}

/// Rewrite a boolean text value.
///
/// The text protocol already yields `t`/`f`; without normalization they are spelled out.
pub fn normalize_boolean(value: &str, replace_booleans: bool) -> &str {
    match (value, replace_booleans) {
        (_, true) => value,
        ("t", false) => "true",
        ("f", false) => "false",
        (other, false) => other,
    }
}

/// Last non-NULL value of a watermark column.
///
/// `NULL`s sort last under `ORDER BY`, so they may trail the final real value.
fn last_non_null<'a>(values: impl DoubleEndedIterator<Item = Option<&'a str>>) -> Option<&'a str> {
    values.rev().flatten().next()
}

/// Exports through a server-side cursor, with retries and reconnects.
pub struct CursorExportAdapter;

impl CursorExportAdapter {
    /// Run the export, retrying failed attempts on a fresh session.
    pub async fn export(
        conn: &mut ConnectionManager,
        config: &ExportConfig,
        query: &str,
        sink: &mut dyn ExportSink,
    ) -> Result<ExportResult> {
        conn.ensure_alive(&RetryPolicy::reconnect()).await?;

        let policy = RetryPolicy::export(config.max_retries);
        let mut attempt = 1;

        loop {
            let result = Self::attempt(conn, config, query, sink).await;
            let error = match result {
                Ok(result) => return Ok(result),
                Err(e) => e,
            };

            if !error.is_retryable() {
                return Err(error);
            }
            if !policy.has_attempts_left(attempt) {
                return Err(ExtractError::retries_exhausted(&config.output_table, attempt, error));
            }

            let delay = policy.backoff(attempt);
            tracing::warn!(
                output_table = %config.output_table,
                attempt,
                max_attempts = policy.max_attempts,
                error = %error,
                "Cursor export failed, retrying in {delay:?}"
            );

            best_effort("Reconnect", conn.reconnect()).await;
            sink.reset()?;
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn attempt(
        conn: &mut ConnectionManager,
        config: &ExportConfig,
        query: &str,
        sink: &mut dyn ExportSink,
    ) -> Result<ExportResult> {
        let batch_size = conn.config().batch_size;
        let client = conn.client().await?;
        let txn = client.transaction().await?;

        let name = next_cursor_name();
        let mut state = CursorState::Idle;

        match Self::fetch_all(&txn, &name, &mut state, batch_size, config, query, sink).await {
            Ok(result) => {
                txn.batch_execute(&format!("CLOSE {name}")).await?;
                txn.commit().await?;
                state = CursorState::Closed;
                tracing::debug!(cursor = %name, ?state, rows = result.rows, "Cursor export finished");
                Ok(result)
            }
            Err(e) => {
                if state.holds_cursor() {
                    best_effort("Closing cursor", async {
                        txn.batch_execute(&format!("CLOSE {name}")).await.map_err(ExtractError::from)
                    })
                    .await;
                }
                best_effort("Rollback", async move { txn.rollback().await.map_err(ExtractError::from) })
                    .await;
                state = CursorState::Failed;
                tracing::debug!(cursor = %name, ?state, error = %e, "Cursor export failed");
                Err(e)
            }
        }
    }

    async fn fetch_all(
        txn: &Transaction<'_>,
        name: &str,
        state: &mut CursorState,
        batch_size: u32,
        config: &ExportConfig,
        query: &str,
        sink: &mut dyn ExportSink,
    ) -> Result<ExportResult> {
        let statement = txn.prepare(query).await?;
        let columns: Vec<(String, Type)> = statement
            .columns()
            .iter()
            .map(|c| (c.name().to_string(), c.type_().clone()))
            .collect();
        let shape = RowShape::new(&columns, config.watermark_column())?;

        txn.batch_execute(&format!("DECLARE {name} CURSOR FOR {query}")).await?;
        *state = CursorState::CursorOpen;
        tracing::debug!(cursor = %name, batch_size, "Cursor declared");

        let fetch = format!("FETCH {batch_size} FROM {name}");
        let mut rows = 0u64;
        let mut last_value = None;

        loop {
            let batch: Vec<SimpleQueryRow> = txn
                .simple_query(&fetch)
                .await?
                .into_iter()
                .filter_map(|message| match message {
                    SimpleQueryMessage::Row(row) => Some(row),
                    _ => None,
                })
                .collect();
            *state = CursorState::Fetching;

            if batch.is_empty() {
                break;
            }
            if rows == 0 && config.source.is_query() {
                sink.write_header(&shape.names)?;
            }

            for row in &batch {
                let fields: Vec<Option<&str>> = (0..row.len())
                    .map(|i| {
                        row.get(i).map(|value| {
                            if shape.booleans.get(i).copied().unwrap_or(false) {
                                normalize_boolean(value, config.replace_booleans)
                            } else {
                                value
                            }
                        })
                    })
                    .collect();
                sink.write_row(&fields)?;
            }

            rows += batch.len() as u64;
            if let Some(index) = shape.watermark {
                if let Some(value) = last_non_null(batch.iter().map(|row| row.get(index))) {
                    last_value = Some(Watermark::new(value));
                }
            }
            tracing::trace!(cursor = %name, rows, "Fetched batch");
        }

        *state = CursorState::Success;
        Ok(ExportResult { rows, last_value, columns: shape.names })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns() -> Vec<(String, Type)> {
        vec![
            ("id".to_string(), Type::INT4),
            ("active".to_string(), Type::BOOL),
            ("note".to_string(), Type::TEXT),
        ]
    }

    #[test]
    fn test_cursor_names_are_unique_and_increasing() {
        let a = next_cursor_name();
        let b = next_cursor_name();
        assert!(a.starts_with("pgextract_cursor_"));
        let id = |name: &str| name.trim_start_matches("pgextract_cursor_").parse::<u64>().unwrap();
        assert!(id(&b) > id(&a));
    }

    #[test]
    fn test_row_shape() {
        let shape = RowShape::new(&columns(), Some("id")).unwrap();
        assert_eq!(shape.names, ["id", "active", "note"]);
        assert_eq!(shape.booleans, [false, true, false]);
        assert_eq!(shape.watermark, Some(0));

        let shape = RowShape::new(&columns(), None).unwrap();
        assert_eq!(shape.watermark, None);
    }

    #[test]
    fn test_missing_watermark_column_is_config_error() {
        let err = RowShape::new(&columns(), Some("updated_at")).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_normalize_boolean() {
        assert_eq!(normalize_boolean("t", true), "t");
        assert_eq!(normalize_boolean("f", true), "f");
        assert_eq!(normalize_boolean("t", false), "true");
        assert_eq!(normalize_boolean("f", false), "false");
    }

    #[test]
    fn test_cursor_state_cleanup() {
        assert!(!CursorState::Idle.holds_cursor());
        assert!(CursorState::CursorOpen.holds_cursor());
        assert!(CursorState::Failed.holds_cursor());
        assert!(!CursorState::Closed.holds_cursor());
    }

    #[test]
    fn test_last_non_null_skips_trailing_nulls() {
        assert_eq!(last_non_null([Some("1"), Some("2"), None].into_iter()), Some("2"));
        assert_eq!(last_non_null([Some("1"), None, Some("3")].into_iter()), Some("3"));
        assert_eq!(last_non_null([None, None].into_iter()), None);
        assert_eq!(last_non_null(std::iter::empty()), None);
    }
}
