//! Export configuration, incremental state and outcome models.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::error::{ExtractError, Result};
use crate::services::sql::quote_identifier;

/// Default number of attempts for the cursor strategy.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// A schema-qualified table reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    /// Schema name
    pub schema: String,
    /// Table name
    #[serde(rename = "tableName")]
    pub name: String,
}

impl TableRef {
    /// Create a new table reference.
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self { schema: schema.into(), name: name.into() }
    }

    /// Quoted `"schema"."table"` form for use in SQL.
    pub fn quoted(&self) -> String {
        format!("{}.{}", quote_identifier(&self.schema), quote_identifier(&self.name))
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// What an export reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportSource {
    /// Ad-hoc SQL query; column names come from the result set
    Query(String),
    /// Table reference with an optional explicit projection
    Table {
        /// The table to export
        table: TableRef,
        /// Columns to select (empty = all, in catalog order)
        columns: Vec<String>,
    },
}

impl ExportSource {
    /// Check if this source is an ad-hoc query.
    pub fn is_query(&self) -> bool {
        matches!(self, Self::Query(_))
    }

    /// The table reference, if this is a table export.
    pub fn table(&self) -> Option<&TableRef> {
        match self {
            Self::Table { table, .. } => Some(table),
            Self::Query(_) => None,
        }
    }
}

/// Watermark-based incremental fetching settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncrementalFetching {
    /// Column whose last value is remembered between runs
    pub column: String,
    /// Maximum rows fetched per run
    pub limit: Option<u64>,
}

/// Configuration of a single export.
#[derive(Debug, Clone)]
pub struct ExportConfig {
    /// What to export
    pub source: ExportSource,
    /// Destination table identifier (also names the artifact)
    pub output_table: String,
    /// Platform hint: append to the destination instead of replacing it
    pub incremental: bool,
    /// Watermark settings
    pub incremental_fetching: Option<IncrementalFetching>,
    /// Attempts for the cursor strategy
    pub max_retries: u32,
    /// Write boolean columns as `t`/`f`
    pub replace_booleans: bool,
    /// Skip the bulk strategy
    pub force_fallback: bool,
}

impl ExportConfig {
    /// Create a configuration exporting a whole table.
    pub fn table(table: TableRef, output_table: impl Into<String>) -> Self {
        Self::new(ExportSource::Table { table, columns: Vec::new() }, output_table)
    }

    /// Create a configuration exporting an ad-hoc query.
    pub fn query(sql: impl Into<String>, output_table: impl Into<String>) -> Self {
        Self::new(ExportSource::Query(sql.into()), output_table)
    }

    fn new(source: ExportSource, output_table: impl Into<String>) -> Self {
        Self {
            source,
            output_table: output_table.into(),
            incremental: false,
            incremental_fetching: None,
            max_retries: DEFAULT_MAX_RETRIES,
            replace_booleans: true,
            force_fallback: false,
        }
    }

    /// Restrict a table export to the given columns.
    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let ExportSource::Table { columns: ref mut cols, .. } = self.source {
            *cols = columns.into_iter().map(Into::into).collect();
        }
        self
    }

    /// Enable watermark-based fetching on a column.
    pub fn with_incremental_fetching(mut self, column: impl Into<String>, limit: Option<u64>) -> Self {
        self.incremental_fetching = Some(IncrementalFetching { column: column.into(), limit });
        self
    }

    /// Set the maximum number of cursor attempts.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Skip the bulk strategy.
    pub fn with_force_fallback(mut self, force_fallback: bool) -> Self {
        self.force_fallback = force_fallback;
        self
    }

    /// The watermark column, if incremental fetching is enabled.
    pub fn watermark_column(&self) -> Option<&str> {
        self.incremental_fetching.as_ref().map(|f| f.column.as_str())
    }

    /// Explicit projection of a table export (empty = all columns).
    pub fn columns(&self) -> &[String] {
        match &self.source {
            ExportSource::Table { columns, .. } => columns,
            ExportSource::Query(_) => &[],
        }
    }

    /// Check invariants that need no database.
    ///
    /// Runs before any connection activity.
    pub fn validate(&self) -> Result<()> {
        if self.output_table.trim().is_empty() {
            return Err(ExtractError::config("Output table must not be empty"));
        }
        if self.max_retries == 0 {
            return Err(ExtractError::config("Max retries must be at least 1"));
        }
        match &self.source {
            ExportSource::Query(sql) => {
                if sql.trim().is_empty() {
                    return Err(ExtractError::config("Query must not be empty"));
                }
                if self.incremental_fetching.is_some() {
                    return Err(ExtractError::config(
                        "Incremental fetching is not supported with a custom query; \
                         configure a table instead",
                    ));
                }
            }
            ExportSource::Table { table, columns } => {
                if table.schema.is_empty() || table.name.is_empty() {
                    return Err(ExtractError::config("Table schema and name are required"));
                }
                if let Some(column) = self.watermark_column() {
                    if column.is_empty() {
                        return Err(ExtractError::config("Incremental fetching column is empty"));
                    }
                    if !columns.is_empty() && !columns.iter().any(|c| c == column) {
                        return Err(ExtractError::config(format!(
                            "Incremental fetching column \"{column}\" is not in the column list"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// The on-disk form of an export, as it appears in a job file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDefinition {
    /// Ad-hoc query
    pub query: Option<String>,
    /// Table reference
    pub table: Option<TableRef>,
    /// Explicit projection
    #[serde(default)]
    pub columns: Vec<String>,
    /// Destination table identifier
    pub output_table: String,
    /// Platform append hint
    #[serde(default)]
    pub incremental: bool,
    /// Watermark column
    pub incremental_fetching_column: Option<String>,
    /// Rows per incremental run
    pub incremental_fetching_limit: Option<u64>,
    /// Attempts for the cursor strategy
    pub retries: Option<u32>,
    /// Boolean normalization
    pub replace_booleans: Option<bool>,
    /// Skip the bulk strategy
    #[serde(default)]
    pub force_fallback: bool,
}

impl TryFrom<ExportDefinition> for ExportConfig {
    type Error = ExtractError;

    fn try_from(def: ExportDefinition) -> Result<Self> {
        let source = match (def.query, def.table) {
            (Some(_), Some(_)) => {
                return Err(ExtractError::config(format!(
                    "Export \"{}\": specify either a query or a table, not both",
                    def.output_table
                )))
            }
            (None, None) => {
                return Err(ExtractError::config(format!(
                    "Export \"{}\": a query or a table is required",
                    def.output_table
                )))
            }
            (Some(sql), None) => ExportSource::Query(sql),
            (None, Some(table)) => ExportSource::Table { table, columns: def.columns },
        };

        let config = ExportConfig {
            source,
            output_table: def.output_table,
            incremental: def.incremental,
            incremental_fetching: def
                .incremental_fetching_column
                .map(|column| IncrementalFetching { column, limit: def.incremental_fetching_limit }),
            max_retries: def.retries.unwrap_or(DEFAULT_MAX_RETRIES),
            replace_booleans: def.replace_booleans.unwrap_or(true),
            force_fallback: def.force_fallback,
        };
        config.validate()?;
        Ok(config)
    }
}

/// A watermark value as text.
///
/// Values are kept in their textual database form so the next run can bind
/// them back into SQL unchanged. Accepts JSON strings and numbers. Integers are
/// written back as JSON numbers; everything else stays a string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watermark(String);

impl Watermark {
    /// Create a watermark from its textual form.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Textual value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for Watermark {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self.0.parse::<i64>() {
            Ok(n) if n.to_string() == self.0 => serializer.serialize_i64(n),
            _ => serializer.serialize_str(&self.0),
        }
    }
}

impl<'de> Deserialize<'de> for Watermark {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Integer(i64),
            Float(f64),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(s) => Watermark(s),
            Raw::Integer(n) => Watermark(n.to_string()),
            Raw::Float(n) => Watermark(n.to_string()),
        })
    }
}

/// Incremental state carried from one run to the next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportState {
    /// Watermark column value of the last exported row
    pub last_fetched_row: Watermark,
}

impl ExportState {
    /// Create a state holding the given watermark.
    pub fn new(value: impl Into<String>) -> Self {
        Self { last_fetched_row: Watermark::new(value) }
    }
}

/// Rows produced by one strategy run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportResult {
    /// Data rows written (header excluded)
    pub rows: u64,
    /// Watermark of the last row, when incremental fetching is on and rows exist
    pub last_value: Option<Watermark>,
    /// Column names, when known
    pub columns: Vec<String>,
}

/// Why the bulk strategy could not be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InapplicableReason {
    /// The client process exited unsuccessfully
    ProcessFailed {
        /// Exit code (None if killed by a signal)
        status: Option<i32>,
        /// Captured standard error
        stderr: String,
    },
    /// The client reported an error for the executed query
    QueryFailed(String),
    /// The produced file has rows of inconsistent width
    Integrity {
        /// 1-based row number
        row: u64,
        /// Field count of the first row
        expected: usize,
        /// Field count of the offending row
        found: usize,
    },
    /// The watermark cannot be located by position
    WatermarkUnresolvable(String),
    /// The client could not be started or its output read
    Io(String),
}

impl fmt::Display for InapplicableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProcessFailed { status: Some(code), stderr } => {
                write!(f, "client exited with status {code}: {}", stderr.trim())
            }
            Self::ProcessFailed { status: None, stderr } => {
                write!(f, "client terminated by signal: {}", stderr.trim())
            }
            Self::QueryFailed(message) => write!(f, "query failed: {}", message.trim()),
            Self::Integrity { row, expected, found } => {
                write!(f, "row {row} has {found} fields, expected {expected}")
            }
            Self::WatermarkUnresolvable(message) => {
                write!(f, "cannot resolve watermark: {message}")
            }
            Self::Io(message) => write!(f, "I/O failure: {message}"),
        }
    }
}

impl From<InapplicableReason> for ExtractError {
    fn from(reason: InapplicableReason) -> Self {
        match reason {
            InapplicableReason::Integrity { row, expected, found } => {
                ExtractError::data_integrity(row, expected, found)
            }
            other => ExtractError::strategy(other.to_string()),
        }
    }
}

/// Result of attempting one export strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrategyOutcome {
    /// The strategy produced a complete artifact
    Success(ExportResult),
    /// The strategy cannot be used; try the other one
    Inapplicable(InapplicableReason),
}

/// Final result of an export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportOutcome {
    /// Destination table identifier
    pub output_table: String,
    /// Data rows exported
    pub rows: u64,
    /// State for the next run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<ExportState>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_with_incremental_fetching_rejected() {
        let config = ExportConfig::query("SELECT * FROM t", "out")
            .with_incremental_fetching("id", None);
        let err = config.validate().unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_watermark_column_must_be_projected() {
        let config = ExportConfig::table(TableRef::new("public", "t"), "out")
            .with_columns(["v"])
            .with_incremental_fetching("id", None);
        assert!(config.validate().is_err());

        let config = ExportConfig::table(TableRef::new("public", "t"), "out")
            .with_columns(["id", "v"])
            .with_incremental_fetching("id", Some(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_definition_requires_exactly_one_source() {
        let def: ExportDefinition = serde_json::from_str(
            r#"{"query": "SELECT 1", "table": {"schema": "public", "tableName": "t"}, "outputTable": "o"}"#,
        )
        .unwrap();
        assert!(ExportConfig::try_from(def).is_err());

        let def: ExportDefinition = serde_json::from_str(r#"{"outputTable": "o"}"#).unwrap();
        assert!(ExportConfig::try_from(def).is_err());
    }

    #[test]
    fn test_definition_to_config() {
        let def: ExportDefinition = serde_json::from_str(
            r#"{
                "table": {"schema": "public", "tableName": "orders"},
                "columns": ["id", "total"],
                "outputTable": "in.c-main.orders",
                "incrementalFetchingColumn": "id",
                "incrementalFetchingLimit": 500,
                "retries": 3
            }"#,
        )
        .unwrap();
        let config = ExportConfig::try_from(def).unwrap();

        assert_eq!(config.watermark_column(), Some("id"));
        assert_eq!(config.max_retries, 3);
        assert!(config.replace_booleans);
        assert_eq!(config.columns(), ["id".to_string(), "total".to_string()]);
    }

    #[test]
    fn test_state_accepts_numbers_and_strings() {
        let state: ExportState = serde_json::from_str(r#"{"lastFetchedRow": 3}"#).unwrap();
        assert_eq!(state.last_fetched_row.as_str(), "3");

        let state: ExportState =
            serde_json::from_str(r#"{"lastFetchedRow": "2024-01-01 10:00:00"}"#).unwrap();
        assert_eq!(state.last_fetched_row.as_str(), "2024-01-01 10:00:00");
    }

    #[test]
    fn test_outcome_omits_missing_state() {
        let outcome = ExportOutcome { output_table: "out".into(), rows: 2, state: None };
        assert_eq!(serde_json::to_string(&outcome).unwrap(), r#"{"outputTable":"out","rows":2}"#);

        let outcome = ExportOutcome {
            output_table: "out".into(),
            rows: 3,
            state: Some(ExportState::new("3")),
        };
        assert_eq!(
            serde_json::to_string(&outcome).unwrap(),
            r#"{"outputTable":"out","rows":3,"state":{"lastFetchedRow":3}}"#
        );
    }

    #[test]
    fn test_watermark_keeps_integers_numeric() {
        let json = |value: &str| serde_json::to_string(&Watermark::new(value)).unwrap();

        assert_eq!(json("3"), "3");
        assert_eq!(json("-42"), "-42");
        assert_eq!(json("1.50"), r#""1.50""#);
        assert_eq!(json("007"), r#""007""#);
        assert_eq!(json("99999999999999999999"), r#""99999999999999999999""#);
        assert_eq!(json("2024-01-01 10:00:00"), r#""2024-01-01 10:00:00""#);
    }

    #[test]
    fn test_integrity_reason_maps_to_integrity_error() {
        let err: ExtractError =
            InapplicableReason::Integrity { row: 4, expected: 2, found: 1 }.into();
        assert!(matches!(err, ExtractError::DataIntegrity { row: 4, .. }));
    }
}
