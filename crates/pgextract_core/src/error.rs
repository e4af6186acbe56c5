//! Error types for pgextract.
//!
//! Errors are classified so the export engine can decide what to do with them:
//! - Connectivity and query errors are retried by the cursor strategy
//! - Configuration errors abort before any extraction starts
//! - Strategy and integrity errors make the coordinator fall back to the cursor strategy

use thiserror::Error;

/// Result type alias for pgextract operations.
pub type Result<T> = std::result::Result<T, ExtractError>;

/// Main error type for pgextract.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// The database cannot be reached or the connection died.
    #[error("Connection error: {message}")]
    Connectivity {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Authentication failed.
    #[error("Authentication error: {message}")]
    Authentication {
        /// Human-readable error message.
        message: String,
        /// Actionable hint for the user.
        hint: Option<String>,
    },

    /// TLS material could not be prepared or the handshake setup failed.
    #[error("SSL error: {message}")]
    Ssl {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Query execution error with PostgreSQL-specific details.
    #[error("{message}")]
    Query {
        /// PostgreSQL error message.
        message: String,
        /// Additional detail from PostgreSQL.
        detail: Option<String>,
        /// PostgreSQL hint.
        hint: Option<String>,
        /// Position in query (1-indexed).
        position: Option<usize>,
        /// PostgreSQL error code (e.g., "42P01").
        code: Option<String>,
    },

    /// Invalid export or connection configuration.
    #[error("Config error: {message}")]
    Configuration {
        /// Human-readable error message.
        message: String,
    },

    /// The bulk strategy could not produce a usable artifact.
    #[error("Export strategy failed: {message}")]
    Strategy {
        /// Human-readable error message.
        message: String,
    },

    /// A produced CSV file has rows of inconsistent width.
    #[error("Data integrity error at row {row}: expected {expected} fields, found {found}")]
    DataIntegrity {
        /// 1-based row number in the produced file.
        row: u64,
        /// Field count of the first row.
        expected: usize,
        /// Field count of the offending row.
        found: usize,
    },

    /// Every retry attempt failed.
    #[error("Export of {context} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Output table or query the export was for.
        context: String,
        /// Number of attempts made.
        attempts: u32,
        /// The error from the last attempt.
        #[source]
        source: Box<ExtractError>,
    },

    /// Artifact or state file error.
    #[error("Storage error: {message}")]
    Storage {
        /// Human-readable error message.
        message: String,
        /// Actionable hint for the user.
        hint: Option<String>,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Unexpected internal error.
    #[error("Internal error: {message}")]
    Internal {
        /// Human-readable error message.
        message: String,
    },
}

impl ExtractError {
    // ========== Constructors ==========

    /// Create a new connectivity error.
    pub fn connectivity(message: impl Into<String>) -> Self {
        Self::Connectivity { message: message.into(), source: None }
    }

    /// Create a new connectivity error with source.
    pub fn connectivity_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connectivity { message: message.into(), source: Some(Box::new(source)) }
    }

    /// Create a new SSL error.
    pub fn ssl(message: impl Into<String>) -> Self {
        Self::Ssl { message: message.into(), source: None }
    }

    /// Create a new SSL error with source.
    pub fn ssl_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Ssl { message: message.into(), source: Some(Box::new(source)) }
    }

    /// Create a query error carrying only a message.
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query { message: message.into(), detail: None, hint: None, position: None, code: None }
    }

    /// Create a new configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create a new strategy failure.
    pub fn strategy(message: impl Into<String>) -> Self {
        Self::Strategy { message: message.into() }
    }

    /// Create a data integrity error for a row of unexpected width.
    pub fn data_integrity(row: u64, expected: usize, found: usize) -> Self {
        Self::DataIntegrity { row, expected, found }
    }

    /// Wrap the last attempt's error once retries are used up.
    pub fn retries_exhausted(context: impl Into<String>, attempts: u32, last: ExtractError) -> Self {
        Self::RetriesExhausted { context: context.into(), attempts, source: Box::new(last) }
    }

    /// Create a new storage error.
    pub fn storage(message: impl Into<String>, hint: Option<&str>) -> Self {
        Self::Storage { message: message.into(), hint: hint.map(String::from), source: None }
    }

    /// Create a new storage error with source.
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage { message: message.into(), hint: None, source: Some(Box::new(source)) }
    }

    /// Create a new internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    // ========== Methods ==========

    /// Check if this error means the connection is gone.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity { .. })
    }

    /// Check if this error is a configuration problem.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }

    /// Check if another attempt after a reconnect could succeed.
    ///
    /// Configuration, storage and integrity errors never are.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connectivity { .. } | Self::Query { .. })
    }

    /// Get the error category name.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Connectivity { .. } => "Connection",
            Self::Authentication { .. } => "Authentication",
            Self::Ssl { .. } => "SSL",
            Self::Query { .. } => "Query",
            Self::Configuration { .. } => "Config",
            Self::Strategy { .. } => "Strategy",
            Self::DataIntegrity { .. } => "Integrity",
            Self::RetriesExhausted { source, .. } => source.category(),
            Self::Storage { .. } => "Storage",
            Self::Internal { .. } => "Internal",
        }
    }

    /// Get actionable hint for the user.
    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::Connectivity { .. } => Some("Check that the database server is running"),
            Self::Authentication { hint, .. } => hint.as_deref(),
            Self::Ssl { .. } => Some("Verify SSL certificate configuration"),
            Self::Query { hint, .. } => hint.as_deref(),
            Self::Configuration { .. } => None,
            Self::Strategy { .. } => None,
            Self::DataIntegrity { .. } => Some("The bulk export produced a malformed file"),
            Self::RetriesExhausted { source, .. } => source.hint(),
            Self::Storage { hint, .. } => hint.as_deref(),
            Self::Internal { .. } => Some("Please report this issue"),
        }
    }

    /// Get PostgreSQL error code (if applicable).
    pub fn pg_code(&self) -> Option<&str> {
        match self {
            Self::Query { code, .. } => code.as_deref(),
            Self::RetriesExhausted { source, .. } => source.pg_code(),
            _ => None,
        }
    }

    /// Format error with full details including error chain.
    pub fn format_detailed(&self) -> String {
        let mut output = format!("{} Error: {}", self.category(), self);

        if let Some(hint) = self.hint() {
            output.push_str(&format!("\n  Hint: {hint}"));
        }

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {depth}: {err}"));
            source = err.source();
            depth += 1;
        }

        output
    }
}

// ========== Error Conversions ==========

/// Convert from tokio_postgres::Error to ExtractError.
impl From<tokio_postgres::Error> for ExtractError {
    fn from(err: tokio_postgres::Error) -> Self {
        if let Some(db_err) = err.as_db_error() {
            let message = db_err.message().to_string();
            let detail = db_err.detail().map(String::from);
            let hint = db_err.hint().map(String::from);
            let position = db_err.position().and_then(|p| match p {
                tokio_postgres::error::ErrorPosition::Original(pos) => Some(*pos as usize),
                tokio_postgres::error::ErrorPosition::Internal { .. } => None,
            });
            let code = db_err.code().code();

            match code {
                "28P01" => {
                    return ExtractError::Authentication {
                        message,
                        hint: Some("Invalid password - check your credentials".to_string()),
                    }
                }
                "28000" => {
                    return ExtractError::Authentication {
                        message,
                        hint: Some(
                            "Authentication failed - check username and permissions".to_string(),
                        ),
                    }
                }
                // Connection exceptions (08xxx) and server shutdown (57P01-57P03)
                _ if code.starts_with("08") || code.starts_with("57P0") => {
                    return ExtractError::Connectivity { message, source: Some(Box::new(err)) }
                }
                _ => {
                    let code = Some(code.to_string());
                    return ExtractError::Query { message, detail, hint, position, code };
                }
            }
        }

        if err.is_closed() {
            return ExtractError::Connectivity {
                message: "Connection closed".to_string(),
                source: Some(Box::new(err)),
            };
        }

        ExtractError::Connectivity { message: err.to_string(), source: Some(Box::new(err)) }
    }
}

/// Convert from a deadpool pool error.
impl From<deadpool_postgres::PoolError> for ExtractError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        match err {
            deadpool_postgres::PoolError::Backend(e) => ExtractError::from(e),
            other => ExtractError::Connectivity {
                message: format!("Failed to acquire connection: {other}"),
                source: Some(Box::new(other)),
            },
        }
    }
}

/// Convert from std::io::Error to ExtractError.
impl From<std::io::Error> for ExtractError {
    fn from(err: std::io::Error) -> Self {
        ExtractError::Storage {
            message: err.to_string(),
            hint: Some("Check file permissions and disk space".to_string()),
            source: Some(Box::new(err)),
        }
    }
}

/// Convert from csv::Error to ExtractError.
impl From<csv::Error> for ExtractError {
    fn from(err: csv::Error) -> Self {
        ExtractError::Storage {
            message: format!("CSV error: {err}"),
            hint: None,
            source: Some(Box::new(err)),
        }
    }
}

/// Convert from serde_json::Error to ExtractError.
impl From<serde_json::Error> for ExtractError {
    fn from(err: serde_json::Error) -> Self {
        ExtractError::Storage {
            message: format!("JSON error: {err}"),
            hint: Some("Data may be corrupted".to_string()),
            source: Some(Box::new(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ExtractError::connectivity("gone").is_retryable());
        assert!(ExtractError::query("syntax error").is_retryable());
        assert!(!ExtractError::config("bad column").is_retryable());
        assert!(!ExtractError::data_integrity(3, 2, 3).is_retryable());
        assert!(!ExtractError::storage("disk full", None).is_retryable());
    }

    #[test]
    fn test_retries_exhausted_keeps_inner_category() {
        let err = ExtractError::retries_exhausted("public.orders", 3, ExtractError::query("boom"));
        assert_eq!(err.category(), "Query");
        assert!(err.to_string().contains("public.orders"));
        assert!(err.to_string().contains("3 attempts"));
    }

    #[test]
    fn test_format_detailed_includes_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "socket reset");
        let err = ExtractError::connectivity_with_source("Connection lost", io);
        let detailed = err.format_detailed();
        assert!(detailed.starts_with("Connection Error: Connection error: Connection lost"));
        assert!(detailed.contains("Caused by:\n  1: socket reset"));
    }

    #[test]
    fn test_data_integrity_message() {
        let err = ExtractError::data_integrity(7, 3, 4);
        assert_eq!(
            err.to_string(),
            "Data integrity error at row 7: expected 3 fields, found 4"
        );
    }
}
