use thiserror::Error;

/// Errors surfaced by the storage layer.
///
/// Driver errors pass through unchanged; the store never masks or
/// reinterprets them. `Scan` is distinct so callers can tell a failed
/// returning-id or row decode apart from an engine rejection.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Bad construction input: unsupported dialect, pool/TLS setup failure.
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Postgres(#[from] tokio_postgres::Error),

    #[error(transparent)]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("tls setup failed: {0}")]
    Tls(#[from] native_tls::Error),

    /// Row decoding failed: missing column, wrong type, or an empty
    /// `RETURNING` result. Never substituted with a default value.
    #[error("scan error: {0}")]
    Scan(String),
}

impl StoreError {
    pub(crate) fn scan(msg: impl Into<String>) -> Self {
        StoreError::Scan(msg.into())
    }
}
