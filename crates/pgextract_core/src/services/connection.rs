//! Database connection management with deadpool-postgres.
//!
//! Provides the single connection an export runs on:
//! - Session setup (client encoding, search_path, init statements) on every new session
//! - Liveness probing that classifies failures as dead connections
//! - Reconnection that discards the broken session instead of recycling it
//! - TLS materials persisted to a private temp directory for the connection's lifetime

use crate::error::{ExtractError, Result};
use crate::models::{ConnectionConfig, SslMode, TlsConfig};
use crate::services::retry::RetryPolicy;
use crate::services::sql::quote_identifier;

use deadpool_postgres::{Client, Manager, ManagerConfig, Object, Pool, RecyclingMethod, Runtime};
use native_tls::{Certificate, Identity, TlsConnector};
use postgres_native_tls::MakeTlsConnector;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_postgres::{NoTls, SimpleQueryMessage};

/// PEM materials written to disk so both the driver and the client binary can use them.
///
/// The directory and its files are removed when this value is dropped.
#[derive(Debug)]
pub struct TlsMaterials {
    dir: TempDir,
    ca: Option<PathBuf>,
    cert: Option<PathBuf>,
    key: Option<PathBuf>,
}

impl TlsMaterials {
    /// Write the configured PEM blobs into a fresh private directory.
    pub fn write(tls: &TlsConfig) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("pgextract-tls-")
            .tempdir()
            .map_err(|e| ExtractError::ssl_with_source("Failed to create TLS directory", e))?;

        let ca = tls.ca.as_deref().map(|pem| write_pem(dir.path(), "ca.pem", pem)).transpose()?;
        let cert =
            tls.cert.as_deref().map(|pem| write_pem(dir.path(), "client.crt", pem)).transpose()?;
        let key =
            tls.key.as_deref().map(|pem| write_pem(dir.path(), "client.key", pem)).transpose()?;

        tracing::debug!(dir = %dir.path().display(), "TLS materials written");

        Ok(Self { dir, ca, cert, key })
    }

    /// Directory holding the materials.
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// CA certificate path.
    pub fn ca_path(&self) -> Option<&Path> {
        self.ca.as_deref()
    }

    /// Client certificate path.
    pub fn cert_path(&self) -> Option<&Path> {
        self.cert.as_deref()
    }

    /// Client key path.
    pub fn key_path(&self) -> Option<&Path> {
        self.key.as_deref()
    }
}

/// Write one PEM file readable and writable by the owner only.
fn write_pem(dir: &Path, name: &str, pem: &str) -> Result<PathBuf> {
    let path = dir.join(name);
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(&path)
        .map_err(|e| ExtractError::ssl_with_source(format!("Failed to create {name}"), e))?;
    file.write_all(pem.as_bytes())
        .map_err(|e| ExtractError::ssl_with_source(format!("Failed to write {name}"), e))?;
    Ok(path)
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| {
        ExtractError::ssl_with_source(format!("Failed to read {}", path.display()), e)
    })
}

/// Build a TLS connector for the configured verification mode.
fn build_tls_connector(mode: SslMode, materials: &TlsMaterials) -> Result<MakeTlsConnector> {
    let mut builder = TlsConnector::builder();

    match mode {
        SslMode::Disable => {}
        SslMode::Prefer | SslMode::Require => {
            builder.danger_accept_invalid_certs(true);
        }
        SslMode::VerifyCa | SslMode::VerifyFull => {
            if let Some(ca_path) = materials.ca_path() {
                let cert = Certificate::from_pem(&read_pem(ca_path)?).map_err(|e| {
                    ExtractError::ssl_with_source("Failed to parse CA certificate", e)
                })?;
                builder.add_root_certificate(cert);
            }
            if mode == SslMode::VerifyCa {
                builder.danger_accept_invalid_hostnames(true);
            }
        }
    }

    if let (Some(cert_path), Some(key_path)) = (materials.cert_path(), materials.key_path()) {
        let identity = Identity::from_pkcs8(&read_pem(cert_path)?, &read_pem(key_path)?)
            .map_err(|e| ExtractError::ssl_with_source("Failed to load client certificate", e))?;
        builder.identity(identity);
    }

    let connector = builder
        .build()
        .map_err(|e| ExtractError::ssl_with_source("Failed to create TLS connector", e))?;
    Ok(MakeTlsConnector::new(connector))
}

/// Owns the one live connection an export runs on.
///
/// Strategies borrow the connection for a single export call through
/// [`ConnectionManager::client`]; nothing else keeps a handle to it.
pub struct ConnectionManager {
    config: Arc<ConnectionConfig>,
    pool: Pool,
    client: Option<Client>,
    server_version: i32,
    tls_materials: Option<TlsMaterials>,
}

impl ConnectionManager {
    /// Connect to the configured database and prepare the session.
    pub async fn connect(config: ConnectionConfig) -> Result<Self> {
        config.validate().map_err(ExtractError::config)?;

        let tls_materials = config.tls.as_ref().map(TlsMaterials::write).transpose()?;
        let pool = Self::build_pool(&config, tls_materials.as_ref())?;

        let mut manager = Self {
            config: Arc::new(config),
            pool,
            client: None,
            server_version: 0,
            tls_materials,
        };

        let client = manager.acquire().await?;
        manager.server_version = query_server_version(&client).await?;
        manager.client = Some(client);

        tracing::info!(
            host = %manager.config.host,
            database = %manager.config.database,
            server_version = manager.server_version,
            "Connected to PostgreSQL"
        );

        Ok(manager)
    }

    fn build_pool(config: &ConnectionConfig, materials: Option<&TlsMaterials>) -> Result<Pool> {
        let connect_timeout = Duration::from_secs(config.options.connect_timeout_secs as u64);

        let mut pg_config = tokio_postgres::Config::new();
        pg_config.host(&config.host);
        pg_config.port(config.port);
        pg_config.dbname(&config.database);
        pg_config.user(&config.username);
        pg_config.password(config.password.expose());
        pg_config.application_name(&config.options.application_name);
        pg_config.connect_timeout(connect_timeout);
        pg_config.keepalives(true);
        pg_config.keepalives_idle(Duration::from_secs(60));

        if let Some(secs) = config.options.statement_timeout_secs {
            pg_config.options(&format!("-c statement_timeout={secs}s"));
        }

        let manager_config = ManagerConfig { recycling_method: RecyclingMethod::Verified };

        let mode = config.ssl_mode();
        let manager = match (mode, materials) {
            (SslMode::Disable, _) | (_, None) => {
                pg_config.ssl_mode(tokio_postgres::config::SslMode::Disable);
                Manager::from_config(pg_config, NoTls, manager_config)
            }
            (mode, Some(materials)) => {
                pg_config.ssl_mode(match mode {
                    SslMode::Prefer => tokio_postgres::config::SslMode::Prefer,
                    _ => tokio_postgres::config::SslMode::Require,
                });
                let tls = build_tls_connector(mode, materials)?;
                Manager::from_config(pg_config, tls, manager_config)
            }
        };

        Pool::builder(manager)
            .max_size(1)
            .wait_timeout(Some(connect_timeout))
            .create_timeout(Some(connect_timeout))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| ExtractError::connectivity(format!("Failed to create pool: {e}")))
    }

    /// Open a session and run the session setup statements.
    async fn acquire(&self) -> Result<Client> {
        let client = self.pool.get().await.map_err(|e| match ExtractError::from(e) {
            ExtractError::Query { message, .. } => {
                ExtractError::connectivity(format!("Failed to establish connection: {message}"))
            }
            other => other,
        })?;

        client
            .batch_execute("SET CLIENT_ENCODING TO 'UTF8'")
            .await
            .map_err(|e| ExtractError::connectivity_with_source("Failed to set client encoding", e))?;

        if let Some(schema) = &self.config.schema {
            client
                .batch_execute(&format!("SET search_path TO {}", quote_identifier(schema)))
                .await
                .map_err(|e| ExtractError::config(format!("Failed to set schema {schema}: {e}")))?;
        }

        for statement in &self.config.init_statements {
            client.batch_execute(statement).await.map_err(|e| {
                ExtractError::config(format!("Init statement \"{statement}\" failed: {e}"))
            })?;
        }

        Ok(client)
    }

    /// Get the connection configuration.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Server version as `server_version_num` (e.g. 160002).
    pub fn server_version(&self) -> i32 {
        self.server_version
    }

    /// TLS files backing this connection, if TLS is configured.
    pub fn tls_materials(&self) -> Option<&TlsMaterials> {
        self.tls_materials.as_ref()
    }

    /// Borrow the live client, opening a session if the last one was discarded.
    pub async fn client(&mut self) -> Result<&mut Client> {
        if self.client.is_none() {
            let client = self.acquire().await?;
            self.client = Some(client);
        }
        self.client.as_mut().ok_or_else(|| ExtractError::internal("Connection missing after acquire"))
    }

    /// Round-trip a trivial statement.
    ///
    /// Any failure means the session is dead, whatever the driver reported.
    pub async fn ping(&mut self) -> Result<()> {
        let client = self.client.as_ref().ok_or_else(|| ExtractError::connectivity("Not connected"))?;
        client
            .simple_query("SELECT 1")
            .await
            .map(|_| ())
            .map_err(|e| ExtractError::connectivity_with_source("Dead connection", e))
    }

    /// Check if the current session answers.
    pub async fn is_alive(&mut self) -> bool {
        self.ping().await.is_ok()
    }

    /// Drop the current session and open a new one.
    pub async fn reconnect(&mut self) -> Result<()> {
        if let Some(client) = self.client.take() {
            // Detached so the pool opens a fresh session instead of recycling this one.
            drop(Object::take(client));
        }
        let client = self.acquire().await?;
        self.client = Some(client);
        tracing::info!(host = %self.config.host, "Reconnected to PostgreSQL");
        Ok(())
    }

    /// Reconnect if the current session no longer answers.
    pub async fn ensure_alive(&mut self, policy: &RetryPolicy) -> Result<()> {
        if self.is_alive().await {
            return Ok(());
        }
        tracing::warn!(host = %self.config.host, "Connection is dead, reconnecting");
        self.reconnect_with(policy).await
    }

    /// Reconnect with bounded attempts.
    ///
    /// Failure after the last attempt is a connectivity error and is not retried further.
    pub async fn reconnect_with(&mut self, policy: &RetryPolicy) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.reconnect().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_configuration() => return Err(e),
                Err(e) if policy.has_attempts_left(attempt) => {
                    let delay = policy.backoff(attempt);
                    tracing::warn!(
                        attempt,
                        max_attempts = policy.max_attempts,
                        error = %e,
                        "Reconnect failed, retrying in {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(attempt, error = %e, "Giving up reconnecting");
                    return Err(ExtractError::connectivity_with_source(
                        format!("Unable to reconnect to {} after {attempt} attempts", self.config.display_url()),
                        e,
                    ));
                }
            }
        }
    }
}

async fn query_server_version(client: &Client) -> Result<i32> {
    let messages = client.simple_query("SHOW server_version_num").await?;
    messages
        .iter()
        .find_map(|message| match message {
            SimpleQueryMessage::Row(row) => row.get(0).and_then(|v| v.parse().ok()),
            _ => None,
        })
        .ok_or_else(|| ExtractError::internal("Server did not report server_version_num"))
}
