//! SQL text construction for exports.
//!
//! Identifiers and literals are quoted here; nothing else in the crate splices
//! configuration values into SQL.

use crate::models::{ExportConfig, ExportSource, ExportState};

/// Quote an identifier with double quotes.
pub fn quote_identifier(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// Quote a string literal with single quotes.
///
/// PostgreSQL coerces the untyped literal to the compared column's type.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Strip trailing whitespace and semicolons so the query can be wrapped.
pub fn trim_query(sql: &str) -> &str {
    sql.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace())
}

/// Build the SELECT statement an export runs.
///
/// Ad-hoc queries are used as given. Table exports project the explicit columns or
/// `*`; with incremental fetching they are ordered by the watermark column, filtered
/// with an inclusive `>=` on the prior watermark and optionally limited.
pub fn build_export_query(config: &ExportConfig, prior: Option<&ExportState>) -> String {
    let (table, columns) = match &config.source {
        ExportSource::Query(sql) => return trim_query(sql).to_string(),
        ExportSource::Table { table, columns } => (table, columns),
    };

    let projection = if columns.is_empty() {
        "*".to_string()
    } else {
        columns.iter().map(|c| quote_identifier(c)).collect::<Vec<_>>().join(", ")
    };

    let mut sql = format!("SELECT {projection} FROM {}", table.quoted());

    if let Some(fetching) = &config.incremental_fetching {
        let column = quote_identifier(&fetching.column);
        if let Some(state) = prior {
            sql.push_str(&format!(
                " WHERE {column} >= {}",
                quote_literal(state.last_fetched_row.as_str())
            ));
        }
        sql.push_str(&format!(" ORDER BY {column}"));
        if let Some(limit) = fetching.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
    }

    sql
}

/// Build the COPY statement the bulk strategy hands to the client.
///
/// Every field is force-quoted; the header is only written for ad-hoc queries.
pub fn build_copy_statement(query: &str, with_header: bool) -> String {
    let header = if with_header { ", HEADER" } else { "" };
    format!(
        "COPY ({}) TO STDOUT WITH (FORMAT csv{header}, DELIMITER ',', FORCE_QUOTE *)",
        trim_query(query)
    )
}
