//! Catalog introspection service.
//!
//! Queries PostgreSQL system catalogs for table and column metadata. One query covers
//! every requested table; a whitelist of tables is bound as array parameters so the
//! server does the filtering even with thousands of tables.

use std::ops::Range;

use crate::error::{ExtractError, Result};
use crate::models::schema::{
    ColumnMetadataBuilder, TableKind, TableMetadata, TableMetadataBuilder,
};
use crate::models::TableRef;
use crate::services::connection::ConnectionManager;

/// Default-value expressions by server version.
///
/// PostgreSQL 12 removed `pg_attrdef.adsrc`.
const DEFAULT_VALUE_EXPRESSIONS: &[(Range<i32>, &str)] = &[
    (0..120_000, "d.adsrc"),
    (120_000..i32::MAX, "pg_catalog.pg_get_expr(d.adbin, d.adrelid)"),
];

/// Relation kinds that can be exported.
const EXPORTABLE_RELKINDS: &str = "('r', 'v', 'm', 'f', 'p')";

const USER_NAMESPACES: &str = r#"n.nspname NOT IN ('pg_catalog', 'information_schema')
                  AND n.nspname NOT LIKE 'pg\_toast%'
                  AND n.nspname NOT LIKE 'pg\_temp\_%'"#;

const TABLE_FILTER: &str =
    "AND (n.nspname, c.relname) IN (SELECT * FROM unnest($1::text[], $2::text[]))";

/// Pick the default-value expression for a server version.
pub fn default_value_expression(server_version: i32) -> &'static str {
    DEFAULT_VALUE_EXPRESSIONS
        .iter()
        .find(|(versions, _)| versions.contains(&server_version))
        .map(|(_, expression)| *expression)
        .unwrap_or(DEFAULT_VALUE_EXPRESSIONS[DEFAULT_VALUE_EXPRESSIONS.len() - 1].1)
}

/// Build the catalog query returning one row per column.
pub fn columns_query(server_version: i32, filtered: bool) -> String {
    format!(
        r#"
                SELECT
                    n.nspname AS table_schema,
                    c.relname AS table_name,
                    c.relkind::text AS table_kind,
                    c.reltuples::bigint AS row_count,
                    a.attname::text AS column_name,
                    pg_catalog.format_type(a.atttypid, a.atttypmod) AS data_type,
                    NOT a.attnotnull AS nullable,
                    COALESCE(i.indisprimary, FALSE) AS primary_key,
                    {default_value} AS default_value,
                    a.attnum::integer AS ordinal_position
                FROM pg_catalog.pg_attribute a
                JOIN pg_catalog.pg_class c ON c.oid = a.attrelid
                JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
                LEFT JOIN pg_catalog.pg_index i
                    ON i.indrelid = a.attrelid AND i.indisprimary AND a.attnum = ANY(i.indkey)
                LEFT JOIN pg_catalog.pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum
                WHERE a.attnum > 0
                  AND NOT a.attisdropped
                  AND c.relkind IN {EXPORTABLE_RELKINDS}
                  AND {USER_NAMESPACES}
                  {filter}
                ORDER BY n.nspname, c.relname, a.attnum
                "#,
        default_value = default_value_expression(server_version),
        filter = if filtered { TABLE_FILTER } else { "" },
    )
}

/// Build the catalog query returning one row per table.
pub fn tables_query(filtered: bool) -> String {
    format!(
        r#"
                SELECT
                    n.nspname AS table_schema,
                    c.relname AS table_name,
                    c.relkind::text AS table_kind,
                    c.reltuples::bigint AS row_count
                FROM pg_catalog.pg_class c
                JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
                WHERE c.relkind IN {EXPORTABLE_RELKINDS}
                  AND {USER_NAMESPACES}
                  {filter}
                ORDER BY n.nspname, c.relname
                "#,
        filter = if filtered { TABLE_FILTER } else { "" },
    )
}

/// One catalog row, with every value read as nullable.
///
/// Required values are checked by the metadata builders, not here.
#[derive(Debug, Clone, Default)]
pub struct CatalogRow {
    pub table_schema: Option<String>,
    pub table_name: Option<String>,
    pub table_kind: Option<String>,
    pub row_count: Option<i64>,
    pub column: Option<CatalogColumn>,
}

/// Column part of a catalog row.
#[derive(Debug, Clone, Default)]
pub struct CatalogColumn {
    pub name: Option<String>,
    pub data_type: Option<String>,
    pub nullable: Option<bool>,
    pub primary_key: Option<bool>,
    pub default_value: Option<String>,
    pub ordinal_position: Option<i32>,
}

impl CatalogRow {
    fn from_pg(row: &tokio_postgres::Row, include_columns: bool) -> Result<Self> {
        let column = if include_columns {
            Some(CatalogColumn {
                name: row.try_get("column_name")?,
                data_type: row.try_get("data_type")?,
                nullable: row.try_get("nullable")?,
                primary_key: row.try_get("primary_key")?,
                default_value: row.try_get("default_value")?,
                ordinal_position: row.try_get("ordinal_position")?,
            })
        } else {
            None
        };

        Ok(Self {
            table_schema: row.try_get("table_schema")?,
            table_name: row.try_get("table_name")?,
            table_kind: row.try_get("table_kind")?,
            row_count: row.try_get("row_count")?,
            column,
        })
    }
}

/// Group ordered catalog rows into tables.
///
/// Rows must arrive ordered by schema and table, as both catalog queries return them.
pub fn assemble_tables(rows: Vec<CatalogRow>) -> Result<Vec<TableMetadata>> {
    let mut tables = Vec::new();
    let mut current: Option<((String, String), TableMetadataBuilder)> = None;

    for row in rows {
        let name = row
            .table_name
            .clone()
            .ok_or_else(|| ExtractError::internal("Catalog row without table name"))?;
        let key = (row.table_schema.clone().unwrap_or_default(), name.clone());

        let starts_new_table = current.as_ref().map_or(true, |(k, _)| *k != key);
        if starts_new_table {
            if let Some((_, builder)) = current.take() {
                tables.push(builder.build()?);
            }
            let mut builder = TableMetadataBuilder::new(name);
            if let Some(schema) = row.table_schema {
                builder = builder.schema(schema);
            }
            if let Some(kind) = row.table_kind.as_deref().and_then(|k| k.chars().next()) {
                builder = builder.kind(TableKind::from_relkind(kind));
            }
            if let Some(row_count) = row.row_count {
                builder = builder.row_count(row_count);
            }
            current = Some((key, builder));
        }

        if let (Some(column), Some((_, builder))) = (row.column, current.as_mut()) {
            builder.push_column(build_column(column)?);
        }
    }

    if let Some((_, builder)) = current {
        tables.push(builder.build()?);
    }

    Ok(tables)
}

fn build_column(column: CatalogColumn) -> Result<crate::models::ColumnMetadata> {
    let name =
        column.name.ok_or_else(|| ExtractError::internal("Catalog row without column name"))?;
    let data_type = column.data_type.unwrap_or_default();
    let mut builder = ColumnMetadataBuilder::new(name, data_type)
        .primary_key(column.primary_key.unwrap_or(false))
        .default_value(column.default_value);
    if let Some(nullable) = column.nullable {
        builder = builder.nullable(nullable);
    }
    if let Some(position) = column.ordinal_position {
        builder = builder.ordinal_position(position);
    }
    builder.build()
}

/// Catalog introspection service.
pub struct MetadataProvider;

impl MetadataProvider {
    /// List exportable tables, optionally restricted to a whitelist.
    ///
    /// An empty `filter` lists every table in user schemas. With `include_columns`
    /// false, one row per table is fetched and the tables have no columns.
    pub async fn list_tables(
        conn: &mut ConnectionManager,
        filter: &[TableRef],
        include_columns: bool,
    ) -> Result<Vec<TableMetadata>> {
        let server_version = conn.server_version();
        let filtered = !filter.is_empty();
        let sql = if include_columns {
            columns_query(server_version, filtered)
        } else {
            tables_query(filtered)
        };

        let schemas: Vec<String> = filter.iter().map(|t| t.schema.clone()).collect();
        let names: Vec<String> = filter.iter().map(|t| t.name.clone()).collect();

        let client = conn.client().await?;
        let rows = if filtered {
            client.query(&sql, &[&schemas, &names]).await?
        } else {
            client.query(&sql, &[]).await?
        };

        tracing::debug!(
            tables = filter.len(),
            include_columns,
            rows = rows.len(),
            "Catalog query completed"
        );

        let rows = rows
            .iter()
            .map(|row| CatalogRow::from_pg(row, include_columns))
            .collect::<Result<Vec<_>>>()?;
        assemble_tables(rows)
    }

    /// Load one table with its columns.
    pub async fn get_table(conn: &mut ConnectionManager, table: &TableRef) -> Result<TableMetadata> {
        Self::list_tables(conn, std::slice::from_ref(table), true)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ExtractError::config(format!("Table \"{table}\" not found")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(table: &str, column: &str, position: i32) -> CatalogRow {
        CatalogRow {
            table_schema: Some("public".into()),
            table_name: Some(table.into()),
            table_kind: Some("r".into()),
            row_count: Some(10),
            column: Some(CatalogColumn {
                name: Some(column.into()),
                data_type: Some("character varying(20)".into()),
                nullable: Some(true),
                primary_key: Some(position == 1),
                default_value: Some("'x'::character varying".into()),
                ordinal_position: Some(position),
            }),
        }
    }

    #[test]
    fn test_default_value_expression_by_version() {
        assert_eq!(default_value_expression(110_005), "d.adsrc");
        assert_eq!(default_value_expression(120_000), "pg_catalog.pg_get_expr(d.adbin, d.adrelid)");
        assert_eq!(default_value_expression(170_000), "pg_catalog.pg_get_expr(d.adbin, d.adrelid)");
    }

    #[test]
    fn test_filter_is_pushed_into_sql() {
        assert!(columns_query(160_000, true).contains("unnest($1::text[], $2::text[])"));
        assert!(!columns_query(160_000, false).contains("unnest"));
        assert!(tables_query(true).contains("unnest"));
        assert!(columns_query(90_600, false).contains("d.adsrc"));
    }

    #[test]
    fn test_assemble_groups_columns_by_table() {
        let tables = assemble_tables(vec![
            row("a", "id", 1),
            row("a", "name", 2),
            row("b", "id", 1),
        ])
        .unwrap();

        assert_eq!(tables.len(), 2);
        assert_eq!(tables[0].name, "a");
        assert_eq!(tables[0].columns.len(), 2);
        assert_eq!(tables[0].kind, TableKind::Table);
        assert_eq!(tables[0].columns[0].data_type, "character varying");
        assert_eq!(tables[0].columns[0].length.as_deref(), Some("20"));
        assert_eq!(tables[0].columns[0].default.as_deref(), Some("x"));
        assert!(tables[0].columns[0].primary_key);
        assert_eq!(tables[1].name, "b");
    }

    #[test]
    fn test_assemble_without_columns() {
        let mut r = row("a", "id", 1);
        r.column = None;
        let tables = assemble_tables(vec![r]).unwrap();
        assert_eq!(tables.len(), 1);
        assert!(tables[0].columns.is_empty());
    }

    #[test]
    fn test_assemble_rejects_incomplete_rows() {
        let mut r = row("a", "id", 1);
        r.table_kind = None;
        assert!(assemble_tables(vec![r]).is_err());

        let mut r = row("a", "id", 1);
        if let Some(column) = r.column.as_mut() {
            column.ordinal_position = None;
        }
        assert!(assemble_tables(vec![r]).is_err());

        let mut r = row("a", "id", 1);
        if let Some(column) = r.column.as_mut() {
            column.nullable = None;
        }
        assert!(assemble_tables(vec![r]).is_err());
    }

    #[test]
    fn test_assemble_empty() {
        assert!(assemble_tables(Vec::new()).unwrap().is_empty());
    }
}
