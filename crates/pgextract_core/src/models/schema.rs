//! Catalog metadata models.
//!
//! Immutable snapshots of tables and columns read from the PostgreSQL system catalogs.
//! Builders enforce that every required property was read from the catalog row.

use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

use crate::error::{ExtractError, Result};
use crate::models::export::TableRef;

/// `basetype(length)` or `basetype(precision,scale)`, optionally followed by a suffix
/// such as `with time zone`.
static TYPE_LENGTH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([^(]+)\((\d+(?:\s*,\s*\d+)?)\)(.*)$").expect("valid type length pattern")
});

/// Base types a watermark column may have.
const WATERMARK_TYPES: &[&str] = &[
    "smallint",
    "integer",
    "bigint",
    "int2",
    "int4",
    "int8",
    "numeric",
    "decimal",
    "real",
    "double precision",
    "float4",
    "float8",
    "timestamp without time zone",
    "timestamp with time zone",
    "timestamp",
    "timestamptz",
];

/// Kind of relation, from `pg_class.relkind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    /// Ordinary table
    Table,
    /// View
    View,
    /// Materialized view
    MaterializedView,
    /// Foreign table
    ForeignTable,
    /// Partitioned table
    PartitionedTable,
    /// Sequence
    Sequence,
    /// Any other relkind
    Other(char),
}

impl TableKind {
    /// Map a `relkind` code.
    pub fn from_relkind(relkind: char) -> Self {
        match relkind {
            'r' => Self::Table,
            'v' => Self::View,
            'm' => Self::MaterializedView,
            'f' => Self::ForeignTable,
            'p' => Self::PartitionedTable,
            'S' => Self::Sequence,
            other => Self::Other(other),
        }
    }
}

/// A column of a table or view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnMetadata {
    /// Column name
    pub name: String,
    /// Declared type without length (e.g. "character varying")
    pub data_type: String,
    /// Length or "precision,scale", if declared
    pub length: Option<String>,
    /// Whether the column allows NULL values
    pub nullable: bool,
    /// Whether the column is part of the primary key
    pub primary_key: bool,
    /// Default value, with string literals unwrapped
    pub default: Option<String>,
    /// Column position (1-based ordinal)
    pub ordinal_position: i32,
}

impl ColumnMetadata {
    /// Check if this column can drive incremental fetching.
    pub fn is_watermark_compatible(&self) -> bool {
        WATERMARK_TYPES.contains(&self.data_type.to_lowercase().as_str())
    }
}

/// A table, view or other relation with its columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableMetadata {
    /// Schema name
    pub schema: String,
    /// Relation name
    pub name: String,
    /// Relation kind
    pub kind: TableKind,
    /// Estimated row count from pg_class.reltuples (-1 = never analyzed)
    pub row_count: i64,
    /// Columns ordered by ordinal position
    pub columns: Vec<ColumnMetadata>,
}

impl TableMetadata {
    /// Reference to this table.
    pub fn table_ref(&self) -> TableRef {
        TableRef::new(&self.schema, &self.name)
    }

    /// Find a column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnMetadata> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Column names in ordinal order.
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Check if ordinal positions run 1..=n without gaps.
    ///
    /// A dropped column leaves a hole in `attnum`, so positions stop matching the
    /// field index of a `SELECT *` row.
    pub fn has_contiguous_ordinals(&self) -> bool {
        self.columns
            .iter()
            .enumerate()
            .all(|(index, column)| column.ordinal_position == index as i32 + 1)
    }
}

/// Builder for [`TableMetadata`]; schema, kind and row count are required.
#[derive(Debug, Default)]
pub struct TableMetadataBuilder {
    schema: Option<String>,
    name: String,
    kind: Option<TableKind>,
    row_count: Option<i64>,
    columns: Vec<ColumnMetadata>,
}

impl TableMetadataBuilder {
    /// Start a builder for the named relation.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    /// Set the schema.
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Set the kind.
    pub fn kind(mut self, kind: TableKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Set the estimated row count.
    pub fn row_count(mut self, row_count: i64) -> Self {
        self.row_count = Some(row_count);
        self
    }

    /// Append a column.
    pub fn push_column(&mut self, column: ColumnMetadata) {
        self.columns.push(column);
    }

    /// Build the table, rejecting incomplete catalog rows.
    pub fn build(mut self) -> Result<TableMetadata> {
        let missing = |property: &str| {
            ExtractError::internal(format!(
                "Catalog row for table \"{}\" is missing required property \"{property}\"",
                self.name
            ))
        };
        let schema = self.schema.clone().ok_or_else(|| missing("schema"))?;
        let kind = self.kind.ok_or_else(|| missing("kind"))?;
        let row_count = self.row_count.ok_or_else(|| missing("rowCount"))?;

        self.columns.sort_by_key(|c| c.ordinal_position);
        Ok(TableMetadata { schema, name: self.name, kind, row_count, columns: self.columns })
    }
}

/// Builder for [`ColumnMetadata`]; ordinal position and nullability are required.
#[derive(Debug, Default)]
pub struct ColumnMetadataBuilder {
    name: String,
    formatted_type: String,
    nullable: Option<bool>,
    primary_key: bool,
    raw_default: Option<String>,
    ordinal_position: Option<i32>,
}

impl ColumnMetadataBuilder {
    /// Start a builder from the column name and `format_type()` output.
    pub fn new(name: impl Into<String>, formatted_type: impl Into<String>) -> Self {
        Self { name: name.into(), formatted_type: formatted_type.into(), ..Default::default() }
    }

    /// Set nullability.
    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = Some(nullable);
        self
    }

    /// Mark the column as part of the primary key.
    pub fn primary_key(mut self, primary_key: bool) -> Self {
        self.primary_key = primary_key;
        self
    }

    /// Set the raw default expression.
    pub fn default_value(mut self, raw: Option<String>) -> Self {
        self.raw_default = raw;
        self
    }

    /// Set the ordinal position.
    pub fn ordinal_position(mut self, position: i32) -> Self {
        self.ordinal_position = Some(position);
        self
    }

    /// Build the column, rejecting incomplete catalog rows.
    pub fn build(self) -> Result<ColumnMetadata> {
        let missing = |property: &str| {
            ExtractError::internal(format!(
                "Catalog row for column \"{}\" is missing required property \"{property}\"",
                self.name
            ))
        };
        let ordinal_position = self.ordinal_position.ok_or_else(|| missing("ordinalPosition"))?;
        let nullable = self.nullable.ok_or_else(|| missing("nullable"))?;

        let (data_type, length) = split_type_length(&self.formatted_type);
        let default = self.raw_default.as_deref().map(|raw| unwrap_default(raw, &data_type));

        Ok(ColumnMetadata {
            name: self.name,
            data_type,
            length,
            nullable,
            primary_key: self.primary_key,
            default,
            ordinal_position,
        })
    }
}

/// Split `format_type()` output into base type and length.
///
/// `numeric(10,2)` becomes `("numeric", Some("10,2"))`, `timestamp(3) with time zone`
/// becomes `("timestamp with time zone", Some("3"))`, `text` has no length.
pub fn split_type_length(formatted: &str) -> (String, Option<String>) {
    match TYPE_LENGTH.captures(formatted.trim()) {
        Some(caps) => {
            let base = caps[1].trim();
            let suffix = caps[3].trim();
            let data_type =
                if suffix.is_empty() { base.to_string() } else { format!("{base} {suffix}") };
            let length = caps[2].split(',').map(str::trim).collect::<Vec<_>>().join(",");
            (data_type, Some(length))
        }
        None => (formatted.trim().to_string(), None),
    }
}

/// Unwrap `'value'::character varying` defaults to `value`.
///
/// Only character-varying columns are unwrapped; other defaults stay as written.
pub fn unwrap_default(raw: &str, data_type: &str) -> String {
    if !data_type.starts_with("character varying") {
        return raw.to_string();
    }
    let Some(cast) = raw.rfind("::") else {
        return raw.to_string();
    };
    let literal = raw[..cast].trim();
    match literal.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')) {
        Some(inner) => inner.replace("''", "'"),
        None => literal.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, ty: &str, position: i32) -> ColumnMetadata {
        ColumnMetadataBuilder::new(name, ty)
            .nullable(true)
            .ordinal_position(position)
            .build()
            .unwrap()
    }

    #[test]
    fn test_split_type_length() {
        assert_eq!(split_type_length("character varying(255)"), ("character varying".into(), Some("255".into())));
        assert_eq!(split_type_length("numeric(10, 2)"), ("numeric".into(), Some("10,2".into())));
        assert_eq!(
            split_type_length("timestamp(3) with time zone"),
            ("timestamp with time zone".into(), Some("3".into()))
        );
        assert_eq!(split_type_length("integer"), ("integer".into(), None));
        assert_eq!(split_type_length("text[]"), ("text[]".into(), None));
    }

    #[test]
    fn test_unwrap_default() {
        assert_eq!(unwrap_default("'hello'::character varying", "character varying"), "hello");
        assert_eq!(unwrap_default("'it''s'::character varying", "character varying"), "it's");
        assert_eq!(unwrap_default("nextval('t_id_seq'::regclass)", "integer"), "nextval('t_id_seq'::regclass)");
        assert_eq!(unwrap_default("'abc'::text", "text"), "'abc'::text");
        assert_eq!(unwrap_default("now()", "character varying"), "now()");
    }

    #[test]
    fn test_column_builder_requires_position_and_nullability() {
        let err = ColumnMetadataBuilder::new("id", "integer").nullable(false).build();
        assert!(err.is_err());

        let err = ColumnMetadataBuilder::new("id", "integer").ordinal_position(1).build();
        assert!(err.is_err());
    }

    #[test]
    fn test_table_builder_requires_properties() {
        assert!(TableMetadataBuilder::new("t").schema("public").row_count(0).build().is_err());
        assert!(TableMetadataBuilder::new("t").kind(TableKind::Table).row_count(0).build().is_err());
        assert!(TableMetadataBuilder::new("t").schema("public").kind(TableKind::View).build().is_err());
    }

    #[test]
    fn test_table_builder_orders_columns() {
        let mut builder = TableMetadataBuilder::new("t")
            .schema("public")
            .kind(TableKind::from_relkind('r'))
            .row_count(-1);
        builder.push_column(column("v", "text", 2));
        builder.push_column(column("id", "integer", 1));
        let table = builder.build().unwrap();

        assert_eq!(table.column_names(), vec!["id".to_string(), "v".to_string()]);
        assert!(table.has_contiguous_ordinals());
        assert_eq!(table.table_ref().to_string(), "public.t");
    }

    #[test]
    fn test_dropped_column_breaks_contiguity() {
        let mut builder =
            TableMetadataBuilder::new("t").schema("public").kind(TableKind::Table).row_count(3);
        builder.push_column(column("id", "integer", 1));
        builder.push_column(column("v", "text", 3));
        assert!(!builder.build().unwrap().has_contiguous_ordinals());
    }

    #[test]
    fn test_watermark_compatibility() {
        assert!(column("id", "bigint", 1).is_watermark_compatible());
        assert!(column("amount", "numeric(12,2)", 1).is_watermark_compatible());
        assert!(column("ts", "timestamp(6) without time zone", 1).is_watermark_compatible());
        assert!(column("f", "double precision", 1).is_watermark_compatible());
        assert!(!column("name", "character varying(20)", 1).is_watermark_compatible());
        assert!(!column("flag", "boolean", 1).is_watermark_compatible());
        assert!(!column("day", "date", 1).is_watermark_compatible());
    }

    #[test]
    fn test_relkind_mapping() {
        assert_eq!(TableKind::from_relkind('m'), TableKind::MaterializedView);
        assert_eq!(TableKind::from_relkind('f'), TableKind::ForeignTable);
        assert_eq!(TableKind::from_relkind('x'), TableKind::Other('x'));
    }
}
