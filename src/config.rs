use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::db::{Dialect, StoreError};

/// Top-level application configuration, loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: AppConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }
}

/// Database connection settings for either engine.
///
/// `dialect` selects the engine; `path` is sqlite-only, the host/port block
/// is postgres-only. Unused fields for the selected dialect are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub dialect: String,
    /// Sqlite database file; `:memory:` opens a transient database.
    pub path: String,
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub ssl_mode: SslMode,
    /// Accept invalid/self-signed certificates. Ignored for verify-ca and
    /// verify-full, which always verify.
    pub accept_invalid_certs: bool,
    /// Optional path to a custom CA certificate file (PEM format).
    pub ca_cert_path: Option<String>,
    pub pool_size: usize,
    pub connect_timeout_secs: u64,
}

impl DatabaseConfig {
    pub fn dialect(&self) -> Result<Dialect, StoreError> {
        self.dialect.parse()
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dialect: String::from("sqlite"),
            path: String::from("flowgate.db"),
            host: String::from("localhost"),
            port: 5432,
            dbname: String::from("flowgate"),
            user: String::from("postgres"),
            password: String::new(),
            ssl_mode: SslMode::default(),
            accept_invalid_certs: false,
            ca_cert_path: None,
            pool_size: 8,
            connect_timeout_secs: 10,
        }
    }
}

/// TLS modes for PostgreSQL, mirroring libpq's `sslmode` values.
///
/// `Disable` connects unencrypted. `Prefer` (the default) tries TLS and
/// falls back to plaintext. `Require` encrypts without verifying the
/// certificate. `VerifyCa` additionally checks the certificate chain, and
/// `VerifyFull` also checks the hostname.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    Disable,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_select_sqlite() {
        let config = AppConfig::default();
        assert_eq!(config.database.dialect().unwrap(), Dialect::Sqlite);
        assert_eq!(config.database.path, "flowgate.db");
    }

    #[test]
    fn parses_postgres_section() {
        let config: AppConfig = toml::from_str(
            r#"
            [database]
            dialect = "postgres"
            host = "db.internal"
            port = 5433
            dbname = "tunnels"
            user = "admin"
            password = "hunter2"
            ssl_mode = "verify-full"
            pool_size = 4
            "#,
        )
        .unwrap();
        let db = &config.database;
        assert_eq!(db.dialect().unwrap(), Dialect::Postgres);
        assert_eq!(db.host, "db.internal");
        assert_eq!(db.port, 5433);
        assert_eq!(db.ssl_mode, SslMode::VerifyFull);
        assert_eq!(db.pool_size, 4);
        assert_eq!(db.connect_timeout_secs, 10);
    }

    #[test]
    fn unknown_dialect_is_rejected() {
        let config: AppConfig = toml::from_str("[database]\ndialect = \"mongodb\"\n").unwrap();
        assert!(config.database.dialect().is_err());
    }

    #[test]
    fn password_is_never_serialized() {
        let mut config = DatabaseConfig::default();
        config.password = String::from("secret");
        let out = toml::to_string(&config).unwrap();
        assert!(!out.contains("secret"));
    }

    #[test]
    fn empty_table_uses_defaults() {
        let config: AppConfig = toml::from_str("[database]\n").unwrap();
        assert_eq!(config.database.pool_size, 8);
        assert_eq!(config.database.ssl_mode, SslMode::Prefer);
    }
}
