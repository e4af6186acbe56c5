//! Data models for pgextract.
//!
//! This module contains all core data structures:
//! - `connection` - ConnectionConfig, TlsConfig, SslMode
//! - `export` - ExportConfig, ExportState, ExportOutcome, StrategyOutcome
//! - `job` - JobConfig, the on-disk job file
//! - `schema` - Catalog metadata models

pub mod connection;
pub mod export;
pub mod job;
pub mod schema;

pub use connection::{ConnectionConfig, ConnectionOptions, Password, SslMode, TlsConfig};
pub use export::{
    ExportConfig, ExportDefinition, ExportOutcome, ExportResult, ExportSource, ExportState,
    IncrementalFetching, InapplicableReason, StrategyOutcome, TableRef, Watermark,
};
pub use job::JobConfig;
pub use schema::{ColumnMetadata, TableKind, TableMetadata};
