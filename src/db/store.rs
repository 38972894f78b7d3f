//! Dialect-aware execution facade over rusqlite and tokio-postgres.
//!
//! `Db` wraps whichever driver the configured dialect selects and exposes one
//! contract: `exec`, `query`, `query_row`, `exec_returning_id`, `begin`.
//! Every statement is written in the canonical dialect and passed through
//! [`rewrite`] before it reaches the driver; the argument list is forwarded
//! untouched. Driver errors bubble up unchanged; no retry or reinterpretation
//! happens on the execution path.

use std::sync::Arc;
use std::time::Duration;

use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use postgres_native_tls::MakeTlsConnector;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_postgres::NoTls;
use tracing::info;

use super::rewrite::{rewrite, trim_statement_end};
use super::value::{row_from_postgres, row_from_sqlite};
use super::{Dialect, Row, StoreError, Value};
use crate::config::{DatabaseConfig, SslMode};

/// A dialect-bound connection handle.
///
/// Cheap to clone; safe for concurrent use. The sqlite backend serializes
/// calls on one connection behind an async mutex, the postgres backend draws
/// clients from a deadpool pool per call.
#[derive(Clone, Debug)]
pub struct Db {
    dialect: Dialect,
    backend: Backend,
}

#[derive(Clone, Debug)]
enum Backend {
    Sqlite(Arc<Mutex<rusqlite::Connection>>),
    Postgres(Pool),
}

impl Db {
    /// Open a store for the configured dialect.
    ///
    /// Sqlite opens (and creates) the database file immediately; postgres
    /// builds a lazy connection pool, so a bad address surfaces on first use.
    pub async fn open(config: &DatabaseConfig) -> Result<Db, StoreError> {
        let dialect = config.dialect()?;
        let backend = match dialect {
            Dialect::Sqlite => {
                let conn = rusqlite::Connection::open(&config.path)?;
                conn.busy_timeout(Duration::from_secs(5))?;
                conn.pragma_update(None, "foreign_keys", true)?;
                Backend::Sqlite(Arc::new(Mutex::new(conn)))
            }
            Dialect::Postgres => Backend::Postgres(pg_pool(config)?),
        };
        info!(%dialect, "database store opened");
        Ok(Db { dialect, backend })
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Execute a statement, returning the number of affected rows.
    pub async fn exec(&self, sql: &str, args: &[Value]) -> Result<u64, StoreError> {
        let sql = rewrite(self.dialect, sql);
        match &self.backend {
            Backend::Sqlite(conn) => {
                let conn = conn.lock().await;
                sqlite_exec(&conn, &sql, args)
            }
            Backend::Postgres(pool) => {
                let client = pool.get().await?;
                Ok(client.execute(sql.as_ref(), &pg_params(args)).await?)
            }
        }
    }

    /// Run a query, returning all rows.
    pub async fn query(&self, sql: &str, args: &[Value]) -> Result<Vec<Row>, StoreError> {
        let sql = rewrite(self.dialect, sql);
        match &self.backend {
            Backend::Sqlite(conn) => {
                let conn = conn.lock().await;
                sqlite_query(&conn, &sql, args)
            }
            Backend::Postgres(pool) => {
                let client = pool.get().await?;
                let rows = client.query(sql.as_ref(), &pg_params(args)).await?;
                Ok(rows.iter().map(row_from_postgres).collect())
            }
        }
    }

    /// Run a query expected to yield at most one row.
    pub async fn query_row(&self, sql: &str, args: &[Value]) -> Result<Option<Row>, StoreError> {
        let sql = rewrite(self.dialect, sql);
        match &self.backend {
            Backend::Sqlite(conn) => {
                let conn = conn.lock().await;
                sqlite_query_row(&conn, &sql, args)
            }
            Backend::Postgres(pool) => {
                let client = pool.get().await?;
                let rows = client.query(sql.as_ref(), &pg_params(args)).await?;
                Ok(rows.first().map(row_from_postgres))
            }
        }
    }

    /// Execute an INSERT and return the auto-generated id in one round trip.
    ///
    /// Sqlite reads the driver's last-insert-rowid; postgres appends
    /// ` RETURNING id` and scans the single returned row. An empty result or
    /// a non-integer `id` is a [`StoreError::Scan`], never a silent zero.
    pub async fn exec_returning_id(&self, sql: &str, args: &[Value]) -> Result<i64, StoreError> {
        let sql = rewrite(self.dialect, sql);
        match &self.backend {
            Backend::Sqlite(conn) => {
                let conn = conn.lock().await;
                sqlite_exec_returning_id(&conn, &sql, args)
            }
            Backend::Postgres(pool) => {
                let client = pool.get().await?;
                pg_exec_returning_id(&client, &sql, args).await
            }
        }
    }

    /// Start a transaction. The returned handle carries the same dialect and
    /// must be finished with exactly one of `commit`/`rollback`.
    pub async fn begin(&self) -> Result<Tx, StoreError> {
        match &self.backend {
            Backend::Sqlite(conn) => {
                let guard = Arc::clone(conn).lock_owned().await;
                guard.execute_batch("BEGIN")?;
                Ok(Tx {
                    dialect: self.dialect,
                    inner: Some(TxInner::Sqlite(guard)),
                })
            }
            Backend::Postgres(pool) => {
                let client = pool.get().await?;
                client.batch_execute("BEGIN").await?;
                Ok(Tx {
                    dialect: self.dialect,
                    inner: Some(TxInner::Postgres(client)),
                })
            }
        }
    }

    /// Verify the store is reachable.
    pub async fn ping(&self) -> Result<(), StoreError> {
        match &self.backend {
            Backend::Sqlite(conn) => {
                let conn = conn.lock().await;
                conn.query_row("SELECT 1", [], |_| Ok(()))?;
                Ok(())
            }
            Backend::Postgres(pool) => {
                let client = pool.get().await?;
                client.simple_query("SELECT 1").await?;
                Ok(())
            }
        }
    }

    /// Release pooled resources. Idempotent; the sqlite connection closes
    /// when the last clone of this handle drops.
    pub fn close(&self) {
        if let Backend::Postgres(pool) = &self.backend {
            pool.close();
        }
        info!(dialect = %self.dialect, "database store closed");
    }
}

/// A transaction handle bound to one underlying connection.
///
/// Not safe for concurrent use: a transaction is a single logical sequence of
/// operations and the caller owns it exclusively from `begin` to
/// `commit`/`rollback`. Dropping an unfinished handle rolls the work back:
/// sqlite issues a ROLLBACK, postgres detaches the pooled client so the
/// server aborts the transaction when the session closes.
pub struct Tx {
    dialect: Dialect,
    inner: Option<TxInner>,
}

enum TxInner {
    Sqlite(OwnedMutexGuard<rusqlite::Connection>),
    Postgres(Object),
}

impl Tx {
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn inner(&self) -> Result<&TxInner, StoreError> {
        self.inner
            .as_ref()
            .ok_or_else(|| StoreError::Config("transaction handle already finished".into()))
    }

    pub async fn exec(&self, sql: &str, args: &[Value]) -> Result<u64, StoreError> {
        let sql = rewrite(self.dialect, sql);
        match self.inner()? {
            TxInner::Sqlite(conn) => sqlite_exec(conn, &sql, args),
            TxInner::Postgres(client) => {
                Ok(client.execute(sql.as_ref(), &pg_params(args)).await?)
            }
        }
    }

    pub async fn query(&self, sql: &str, args: &[Value]) -> Result<Vec<Row>, StoreError> {
        let sql = rewrite(self.dialect, sql);
        match self.inner()? {
            TxInner::Sqlite(conn) => sqlite_query(conn, &sql, args),
            TxInner::Postgres(client) => {
                let rows = client.query(sql.as_ref(), &pg_params(args)).await?;
                Ok(rows.iter().map(row_from_postgres).collect())
            }
        }
    }

    pub async fn query_row(&self, sql: &str, args: &[Value]) -> Result<Option<Row>, StoreError> {
        let sql = rewrite(self.dialect, sql);
        match self.inner()? {
            TxInner::Sqlite(conn) => sqlite_query_row(conn, &sql, args),
            TxInner::Postgres(client) => {
                let rows = client.query(sql.as_ref(), &pg_params(args)).await?;
                Ok(rows.first().map(row_from_postgres))
            }
        }
    }

    pub async fn exec_returning_id(&self, sql: &str, args: &[Value]) -> Result<i64, StoreError> {
        let sql = rewrite(self.dialect, sql);
        match self.inner()? {
            TxInner::Sqlite(conn) => sqlite_exec_returning_id(conn, &sql, args),
            TxInner::Postgres(client) => pg_exec_returning_id(client, &sql, args).await,
        }
    }

    pub async fn commit(mut self) -> Result<(), StoreError> {
        self.finish("COMMIT").await
    }

    pub async fn rollback(mut self) -> Result<(), StoreError> {
        self.finish("ROLLBACK").await
    }

    async fn finish(&mut self, stmt: &str) -> Result<(), StoreError> {
        match self.inner.take() {
            None => Ok(()),
            Some(TxInner::Sqlite(conn)) => {
                if let Err(err) = conn.execute_batch(stmt) {
                    let _ = conn.execute_batch("ROLLBACK");
                    return Err(err.into());
                }
                Ok(())
            }
            Some(TxInner::Postgres(client)) => {
                if let Err(err) = client.batch_execute(stmt).await {
                    // The session state is unknown; close it instead of
                    // returning a client with an open transaction to the pool.
                    drop(Object::take(client));
                    return Err(err.into());
                }
                Ok(())
            }
        }
    }
}

impl Drop for Tx {
    fn drop(&mut self) {
        match self.inner.take() {
            None => {}
            Some(TxInner::Sqlite(conn)) => {
                let _ = conn.execute_batch("ROLLBACK");
            }
            Some(TxInner::Postgres(client)) => {
                drop(Object::take(client));
            }
        }
    }
}

fn pg_params(args: &[Value]) -> Vec<&(dyn tokio_postgres::types::ToSql + Sync)> {
    args.iter()
        .map(|v| v as &(dyn tokio_postgres::types::ToSql + Sync))
        .collect()
}

fn sqlite_exec(conn: &rusqlite::Connection, sql: &str, args: &[Value]) -> Result<u64, StoreError> {
    let affected = conn.execute(sql, rusqlite::params_from_iter(args.iter()))?;
    Ok(affected as u64)
}

fn sqlite_query(
    conn: &rusqlite::Connection,
    sql: &str,
    args: &[Value],
) -> Result<Vec<Row>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Arc<[String]> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let mut rows = stmt.query(rusqlite::params_from_iter(args.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(row_from_sqlite(row, &columns)?);
    }
    Ok(out)
}

fn sqlite_query_row(
    conn: &rusqlite::Connection,
    sql: &str,
    args: &[Value],
) -> Result<Option<Row>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Arc<[String]> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let mut rows = stmt.query(rusqlite::params_from_iter(args.iter()))?;
    match rows.next()? {
        Some(row) => Ok(Some(row_from_sqlite(row, &columns)?)),
        None => Ok(None),
    }
}

fn sqlite_exec_returning_id(
    conn: &rusqlite::Connection,
    sql: &str,
    args: &[Value],
) -> Result<i64, StoreError> {
    conn.execute(sql, rusqlite::params_from_iter(args.iter()))?;
    Ok(conn.last_insert_rowid())
}

async fn pg_exec_returning_id(
    client: &tokio_postgres::Client,
    sql: &str,
    args: &[Value],
) -> Result<i64, StoreError> {
    let sql = format!("{} RETURNING id", trim_statement_end(sql));
    let rows = client.query(sql.as_str(), &pg_params(args)).await?;
    let row = rows
        .first()
        .ok_or_else(|| StoreError::scan("RETURNING id yielded no rows"))?;
    row.try_get::<_, i64>("id")
        .map_err(|err| StoreError::scan(format!("RETURNING id: {err}")))
}

fn pg_pool(config: &DatabaseConfig) -> Result<Pool, StoreError> {
    let mut pg = tokio_postgres::Config::new();
    pg.host(&config.host)
        .port(config.port)
        .dbname(&config.dbname)
        .user(&config.user)
        .password(&config.password)
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs));

    let manager_config = ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    };
    let manager = match config.ssl_mode {
        SslMode::Disable => {
            pg.ssl_mode(tokio_postgres::config::SslMode::Disable);
            Manager::from_config(pg, NoTls, manager_config)
        }
        mode => {
            pg.ssl_mode(match mode {
                SslMode::Prefer => tokio_postgres::config::SslMode::Prefer,
                _ => tokio_postgres::config::SslMode::Require,
            });
            let strict_verify = matches!(mode, SslMode::VerifyCa | SslMode::VerifyFull);
            let tls = build_tls_connector(config, strict_verify)?;
            Manager::from_config(pg, tls, manager_config)
        }
    };

    Pool::builder(manager)
        .max_size(config.pool_size)
        .build()
        .map_err(|err| StoreError::Config(format!("postgres pool: {err}")))
}

/// Build a TLS connector with the configured certificate policy.
/// `strict_verify` is set for verify-ca/verify-full so those modes never skip
/// certificate checks, regardless of `accept_invalid_certs`.
fn build_tls_connector(
    config: &DatabaseConfig,
    strict_verify: bool,
) -> Result<MakeTlsConnector, StoreError> {
    let mut builder = native_tls::TlsConnector::builder();
    if config.accept_invalid_certs && !strict_verify {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    } else if let Some(path) = &config.ca_cert_path {
        let pem = std::fs::read(path)
            .map_err(|err| StoreError::Config(format!("read CA certificate {path:?}: {err}")))?;
        let cert = native_tls::Certificate::from_pem(&pem)?;
        builder.add_root_certificate(cert);
    }
    Ok(MakeTlsConnector::new(builder.build()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn mem_db() -> Db {
        let config = DatabaseConfig {
            dialect: "sqlite".into(),
            path: ":memory:".into(),
            ..DatabaseConfig::default()
        };
        Db::open(&config).await.expect("open in-memory sqlite")
    }

    async fn node_db() -> Db {
        let db = mem_db().await;
        db.exec(
            "CREATE TABLE node (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL UNIQUE, status INTEGER NOT NULL DEFAULT 1)",
            &[],
        )
        .await
        .expect("create node table");
        db
    }

    #[tokio::test]
    async fn exec_and_query_round_trip() {
        let db = node_db().await;
        let affected = db
            .exec(
                "INSERT INTO node(name, status) VALUES(?, ?)",
                &["edge-1".into(), 1i64.into()],
            )
            .await
            .unwrap();
        assert_eq!(affected, 1);

        let rows = db
            .query("SELECT id, name, status FROM node WHERE status = ?", &[1i64.into()])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].try_text("name").unwrap(), "edge-1");
    }

    #[tokio::test]
    async fn query_row_none_and_some() {
        let db = node_db().await;
        let missing = db
            .query_row("SELECT id FROM node WHERE id = ?", &[99i64.into()])
            .await
            .unwrap();
        assert!(missing.is_none());

        db.exec("INSERT INTO node(name) VALUES(?)", &["edge-2".into()])
            .await
            .unwrap();
        let row = db
            .query_row("SELECT id, name FROM node WHERE name = ?", &["edge-2".into()])
            .await
            .unwrap()
            .expect("row present");
        assert_eq!(row.try_i64("id").unwrap(), 1);
    }

    #[tokio::test]
    async fn exec_returning_id_uses_last_insert_rowid() {
        let db = node_db().await;
        let first = db
            .exec_returning_id("INSERT INTO node(name) VALUES(?)", &["a".into()])
            .await
            .unwrap();
        let second = db
            .exec_returning_id("INSERT INTO node(name) VALUES(?)", &["b".into()])
            .await
            .unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }

    #[tokio::test]
    async fn insert_or_ignore_passes_through_on_sqlite() {
        let db = node_db().await;
        db.exec("INSERT OR IGNORE INTO node(name) VALUES(?)", &["dup".into()])
            .await
            .unwrap();
        let affected = db
            .exec("INSERT OR IGNORE INTO node(name) VALUES(?)", &["dup".into()])
            .await
            .unwrap();
        assert_eq!(affected, 0);
    }

    #[tokio::test]
    async fn committed_transaction_is_visible() {
        let db = node_db().await;
        let tx = db.begin().await.unwrap();
        let id = tx
            .exec_returning_id("INSERT INTO node(name) VALUES(?)", &["tx-node".into()])
            .await
            .unwrap();
        assert_eq!(id, 1);
        tx.commit().await.unwrap();

        let row = db
            .query_row("SELECT name FROM node WHERE id = ?", &[id.into()])
            .await
            .unwrap();
        assert!(row.is_some());
    }

    #[tokio::test]
    async fn rolled_back_transaction_is_invisible() {
        let db = node_db().await;
        let tx = db.begin().await.unwrap();
        tx.exec("INSERT INTO node(name) VALUES(?)", &["ghost".into()])
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        let rows = db.query("SELECT id FROM node", &[]).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let db = node_db().await;
        {
            let tx = db.begin().await.unwrap();
            tx.exec("INSERT INTO node(name) VALUES(?)", &["orphan".into()])
                .await
                .unwrap();
            // dropped without commit
        }
        let rows = db.query("SELECT id FROM node", &[]).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn transaction_inherits_dialect() {
        let db = node_db().await;
        let tx = db.begin().await.unwrap();
        assert_eq!(tx.dialect(), db.dialect());
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn ping_and_close_are_harmless() {
        let db = mem_db().await;
        db.ping().await.unwrap();
        db.close();
        db.close();
    }

    #[tokio::test]
    async fn unknown_dialect_fails_at_open() {
        let config = DatabaseConfig {
            dialect: "mysql".into(),
            ..DatabaseConfig::default()
        };
        let err = Db::open(&config).await.unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
    }
}
