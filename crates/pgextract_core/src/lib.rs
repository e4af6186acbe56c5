//! Core export engine for pgextract.
//!
//! Exports PostgreSQL tables and queries to CSV with two strategies:
//!
//! - **error**: Error classification shared by every layer
//! - **models**: Connection, export, job and catalog data structures
//! - **services**: Connection management, catalog introspection, bulk and cursor
//!   strategies, coordination and CSV sinks
//! - **state**: Watermark persistence between runs
//! - **logging**: Structured logging setup

pub mod error;
pub mod logging;
pub mod models;
pub mod services;
pub mod state;


pub use error::{ExtractError, Result};
pub use models::{
    ColumnMetadata, ConnectionConfig, ConnectionOptions, ExportConfig, ExportOutcome, ExportSource,
    ExportState, JobConfig, SslMode, TableMetadata, TableRef, TlsConfig,
};
pub use services::{
    BulkExportAdapter, ConnectionManager, CsvFileSink, CursorExportAdapter, ExportCoordinator,
    ExportSink, MetadataProvider,
};
pub use state::StateStore;
