//! Export engine services.
//!
//! This module contains the service layer:
//! - `connection` - Single-session connection management with deadpool-postgres
//! - `schema` - Catalog introspection
//! - `cursor` - Cursor export strategy
//! - `bulk` - COPY export strategy through `psql`
//! - `coordinator` - Strategy selection and outcome
//! - `sink` - CSV artifact output
//! - `retry` - Retry and reconnect policies
//! - `sql` - SQL text construction

pub mod bulk;
pub mod connection;
pub mod coordinator;
pub mod cursor;
pub mod retry;
pub mod schema;
pub mod sink;
pub mod sql;

pub use bulk::BulkExportAdapter;
pub use connection::{ConnectionManager, TlsMaterials};
pub use coordinator::ExportCoordinator;
pub use cursor::CursorExportAdapter;
pub use retry::RetryPolicy;
pub use schema::MetadataProvider;
pub use sink::{CsvFileSink, ExportSink, Manifest};
