//! Connection configuration models.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default PostgreSQL port.
pub const DEFAULT_PORT: u16 = 5432;

/// Default number of rows fetched per cursor round trip.
pub const DEFAULT_BATCH_SIZE: u32 = 10_000;

/// SSL mode for database connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    /// No SSL
    Disable,
    /// Use SSL if available (default)
    #[default]
    Prefer,
    /// Require SSL, accept any certificate
    Require,
    /// Require SSL, verify CA
    VerifyCa,
    /// Require SSL, verify CA and hostname
    VerifyFull,
}

impl SslMode {
    /// Convert to the libpq `sslmode` value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disable => "disable",
            Self::Prefer => "prefer",
            Self::Require => "require",
            Self::VerifyCa => "verify-ca",
            Self::VerifyFull => "verify-full",
        }
    }

    /// Parse from string representation.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "disable" => Self::Disable,
            "require" => Self::Require,
            "verify-ca" | "verify_ca" => Self::VerifyCa,
            "verify-full" | "verify_full" => Self::VerifyFull,
            _ => Self::Prefer,
        }
    }

    /// Check if the server certificate must be verified.
    pub fn verifies_certificate(&self) -> bool {
        matches!(self, Self::VerifyCa | Self::VerifyFull)
    }
}

/// A password that never shows up in `Debug` output or serialized config.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Password(String);

impl Password {
    /// Wrap a plain-text password.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the plain-text value to the driver or the client process.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Check if no password was configured.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(********)")
    }
}

/// TLS settings with PEM-encoded materials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    /// Verification mode
    #[serde(default)]
    pub mode: SslMode,
    /// CA certificate (PEM)
    pub ca: Option<String>,
    /// Client certificate (PEM)
    pub cert: Option<String>,
    /// Client private key (PEM)
    #[serde(skip_serializing)]
    pub key: Option<String>,
}

impl TlsConfig {
    /// Create TLS settings with the given mode and no materials.
    pub fn new(mode: SslMode) -> Self {
        Self { mode, ..Default::default() }
    }

    /// Check if a client certificate pair was supplied.
    pub fn has_client_identity(&self) -> bool {
        self.cert.is_some() && self.key.is_some()
    }
}

/// Additional connection options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionOptions {
    /// Connection timeout in seconds
    pub connect_timeout_secs: u32,
    /// Statement timeout in seconds (None = no timeout)
    pub statement_timeout_secs: Option<u32>,
    /// Application name sent to PostgreSQL
    pub application_name: String,
    /// Client binary used by the bulk strategy
    pub psql_path: String,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            statement_timeout_secs: None,
            application_name: "pgextract".to_string(),
            psql_path: "psql".to_string(),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_batch_size() -> u32 {
    DEFAULT_BATCH_SIZE
}

/// Configuration for the source database.
///
/// Constructed once per export run and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    /// Server hostname or IP
    pub host: String,
    /// Server port (default 5432)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Login username
    #[serde(rename = "user")]
    pub username: String,
    /// Login password
    #[serde(rename = "#password", default, skip_serializing)]
    pub password: Password,
    /// Database name
    pub database: String,
    /// Default schema, applied as search_path
    pub schema: Option<String>,
    /// Optional TLS settings
    pub tls: Option<TlsConfig>,
    /// Statements run on every new session
    #[serde(default)]
    pub init_statements: Vec<String>,
    /// Rows per cursor fetch
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Additional options
    #[serde(default)]
    pub options: ConnectionOptions,
}

impl ConnectionConfig {
    /// Create a builder for connection configurations.
    pub fn builder() -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.host.is_empty() {
            return Err("Host is required".to_string());
        }
        if self.database.is_empty() || self.database.len() > 63 {
            return Err("Database name must be 1-63 characters".to_string());
        }
        if self.username.is_empty() {
            return Err("Username is required".to_string());
        }
        if self.batch_size == 0 {
            return Err("Batch size must be greater than zero".to_string());
        }
        if let Some(ref tls) = self.tls {
            if tls.cert.is_some() != tls.key.is_some() {
                return Err("Client certificate and key must be given together".to_string());
            }
        }
        Ok(())
    }

    /// Effective SSL mode.
    pub fn ssl_mode(&self) -> SslMode {
        self.tls.as_ref().map(|t| t.mode).unwrap_or(SslMode::Disable)
    }

    /// Get the display connection string (without password).
    pub fn display_url(&self) -> String {
        format!("postgresql://{}@{}:{}/{}", self.username, self.host, self.port, self.database)
    }
}

/// Builder for ConnectionConfig.
#[derive(Debug, Default)]
pub struct ConnectionConfigBuilder {
    host: Option<String>,
    port: u16,
    username: Option<String>,
    password: Password,
    database: Option<String>,
    schema: Option<String>,
    tls: Option<TlsConfig>,
    init_statements: Vec<String>,
    batch_size: Option<u32>,
    options: ConnectionOptions,
}

impl ConnectionConfigBuilder {
    /// Set the host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Set the port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the username.
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Set the password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Password::new(password);
        self
    }

    /// Set the database name.
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Set the default schema.
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Set the TLS settings.
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Add a statement to run on every new session.
    pub fn init_statement(mut self, sql: impl Into<String>) -> Self {
        self.init_statements.push(sql.into());
        self
    }

    /// Set the cursor fetch batch size.
    pub fn batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Set connection options.
    pub fn options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the connection timeout.
    pub fn connect_timeout_secs(mut self, secs: u32) -> Self {
        self.options.connect_timeout_secs = secs;
        self
    }

    /// Set the statement timeout.
    pub fn statement_timeout_secs(mut self, secs: u32) -> Self {
        self.options.statement_timeout_secs = Some(secs);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> Result<ConnectionConfig, String> {
        let config = ConnectionConfig {
            host: self.host.ok_or("Host is required")?,
            port: if self.port == 0 { DEFAULT_PORT } else { self.port },
            username: self.username.ok_or("Username is required")?,
            password: self.password,
            database: self.database.ok_or("Database is required")?,
            schema: self.schema,
            tls: self.tls,
            init_statements: self.init_statements,
            batch_size: self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
            options: self.options,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = ConnectionConfig::builder()
            .host("db.internal")
            .username("reader")
            .password("s3cret")
            .database("sales")
            .build()
            .unwrap();

        assert_eq!(config.port, 5432);
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.ssl_mode(), SslMode::Disable);
        assert_eq!(config.display_url(), "postgresql://reader@db.internal:5432/sales");
    }

    #[test]
    fn test_builder_rejects_zero_batch() {
        let result = ConnectionConfig::builder()
            .host("localhost")
            .username("u")
            .database("d")
            .batch_size(0)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_cert_without_key_rejected() {
        let tls = TlsConfig { cert: Some("---".into()), ..TlsConfig::new(SslMode::VerifyFull) };
        let result = ConnectionConfig::builder()
            .host("localhost")
            .username("u")
            .database("d")
            .tls(tls)
            .build();
        assert_eq!(result.unwrap_err(), "Client certificate and key must be given together");
    }

    #[test]
    fn test_password_is_redacted() {
        let config = ConnectionConfig::builder()
            .host("localhost")
            .username("u")
            .password("hunter2")
            .database("d")
            .build()
            .unwrap();

        let debug = format!("{config:?}");
        assert!(!debug.contains("hunter2"));

        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("hunter2"));
    }

    #[test]
    fn test_deserialize_from_json() {
        let json = r##"{
            "host": "localhost",
            "user": "reader",
            "#password": "pw",
            "database": "app",
            "tls": { "mode": "verify-ca", "ca": "-----BEGIN CERTIFICATE-----" },
            "initStatements": ["SET work_mem = '64MB'"]
        }"##;
        let config: ConnectionConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.port, 5432);
        assert_eq!(config.password.expose(), "pw");
        assert_eq!(config.ssl_mode(), SslMode::VerifyCa);
        assert_eq!(config.init_statements.len(), 1);
        assert_eq!(config.options.psql_path, "psql");
    }

    #[test]
    fn test_ssl_mode_parse() {
        assert_eq!(SslMode::parse("verify_full"), SslMode::VerifyFull);
        assert_eq!(SslMode::parse("DISABLE"), SslMode::Disable);
        assert_eq!(SslMode::parse("bogus"), SslMode::Prefer);
        assert!(SslMode::VerifyCa.verifies_certificate());
        assert!(!SslMode::Require.verifies_certificate());
    }
}
