//! libSQL connection handle shared by the task queue and the catalog.
//!
//! Opens a local database file (or `:memory:` for tests) and runs migrations.
//! Several OS processes open the same file, so every connection waits on
//! locks (`busy_timeout`) and file databases use WAL journaling.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase};
use rand::Rng;
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::store::migrations;

/// Milliseconds SQLite waits on a locked database before reporting busy.
const BUSY_TIMEOUT_MS: u64 = 5_000;

/// Extra attempts made by [`retry_busy`] after the busy timeout is exhausted.
const MAX_BUSY_RETRIES: u32 = 20;

/// libSQL database handle.
///
/// Holds one connection reused for all operations; `libsql::Connection` is
/// `Send + Sync` and safe for concurrent async use.
pub struct Db {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl Db {
    /// Open (or create) a local database file and run migrations.
    pub async fn open_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let handle = Self {
            db: Arc::new(db),
            conn,
        };
        // busy_timeout first so the WAL switch waits out a lock held by another process.
        handle.configure().await?;
        handle.pragma("PRAGMA journal_mode = WAL").await?;
        migrations::run_migrations(handle.conn()).await?;
        info!(path = %path.display(), "Database opened");
        Ok(handle)
    }

    /// Create an in-memory database (for tests).
    pub async fn open_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let handle = Self {
            db: Arc::new(db),
            conn,
        };
        handle.configure().await?;
        migrations::run_migrations(handle.conn()).await?;
        Ok(handle)
    }

    /// Get the connection.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn configure(&self) -> Result<(), DatabaseError> {
        self.pragma(&format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}"))
            .await
    }

    /// Run a pragma, draining whatever row it reports.
    async fn pragma(&self, sql: &str) -> Result<(), DatabaseError> {
        let mut rows = self
            .conn
            .query(sql, ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("{sql}: {e}")))?;
        while let Ok(Some(_)) = rows.next().await {}
        Ok(())
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Current time in the fixed-width RFC 3339 form stored in timestamp columns.
///
/// Fixed width keeps lexical comparison in SQL equal to time order.
pub(crate) fn stamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn now_stamp() -> String {
    stamp(Utc::now())
}

/// Read a numeric column as `f64`, accepting integer storage.
pub(crate) fn real(row: &libsql::Row, idx: i32) -> Result<f64, libsql::Error> {
    match row.get_value(idx)? {
        libsql::Value::Real(v) => Ok(v),
        libsql::Value::Integer(v) => Ok(v as f64),
        _ => Err(libsql::Error::InvalidColumnType),
    }
}

/// Read a nullable numeric column.
pub(crate) fn opt_real(row: &libsql::Row, idx: i32) -> Result<Option<f64>, libsql::Error> {
    match row.get_value(idx)? {
        libsql::Value::Null => Ok(None),
        libsql::Value::Real(v) => Ok(Some(v)),
        libsql::Value::Integer(v) => Ok(Some(v as f64)),
        _ => Err(libsql::Error::InvalidColumnType),
    }
}

/// Read a nullable integer column.
pub(crate) fn opt_integer(row: &libsql::Row, idx: i32) -> Result<Option<i64>, libsql::Error> {
    match row.get_value(idx)? {
        libsql::Value::Null => Ok(None),
        libsql::Value::Integer(v) => Ok(Some(v)),
        libsql::Value::Real(v) => Ok(Some(v as i64)),
        _ => Err(libsql::Error::InvalidColumnType),
    }
}

/// Read a nullable text column.
pub(crate) fn opt_text(row: &libsql::Row, idx: i32) -> Result<Option<String>, libsql::Error> {
    match row.get_value(idx)? {
        libsql::Value::Null => Ok(None),
        libsql::Value::Text(s) => Ok(Some(s)),
        _ => Err(libsql::Error::InvalidColumnType),
    }
}

/// Convert `Option<f64>` to a libsql value.
pub(crate) fn real_or_null(v: Option<f64>) -> libsql::Value {
    match v {
        Some(v) if v.is_finite() => libsql::Value::Real(v),
        _ => libsql::Value::Null,
    }
}

/// Convert `Option<&str>` to a libsql value.
pub(crate) fn text_or_null(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Snap a coordinate to micro-degrees so equal cells compare equal in SQL.
pub(crate) fn snap(coord: f64) -> f64 {
    (coord * 1e6).round() / 1e6
}

fn is_busy(e: &libsql::Error) -> bool {
    let msg = e.to_string().to_lowercase();
    msg.contains("database is locked") || msg.contains("busy")
}

/// Run a store operation, retrying with jittered backoff while the database
/// is locked by another process. Any other failure maps to
/// [`DatabaseError::Query`].
pub(crate) async fn retry_busy<T, F, Fut>(op: &'static str, mut attempt: F) -> Result<T, DatabaseError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, libsql::Error>>,
{
    let mut tries = 0u32;
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) if is_busy(&e) && tries < MAX_BUSY_RETRIES => {
                tries += 1;
                let jitter: u64 = rand::thread_rng().gen_range(5..=25);
                let backoff = Duration::from_millis((jitter * tries as u64).min(500));
                debug!(op, tries, backoff_ms = backoff.as_millis() as u64, "Store busy, retrying");
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(DatabaseError::Query(format!("{op}: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_memory_runs_migrations() {
        let db = Db::open_memory().await.unwrap();
        let mut rows = db
            .conn()
            .query(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='tasklist'",
                (),
            )
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        let count: i64 = row.get(0).unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn open_local_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("dir").join("tasks.db");
        let db = Db::open_local(&path).await.unwrap();
        assert!(path.exists());
        drop(db);
    }

    // SQLite's busy handler sleeps on the calling thread, so the lock holder
    // needs a worker of its own.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn open_local_waits_for_a_locked_database() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("tasks.db");
        let holder = libsql::Builder::new_local(&path).build().await.unwrap();
        let conn = holder.connect().unwrap();
        conn.execute("CREATE TABLE held_lock (x INTEGER)", ()).await.unwrap();
        conn.execute("BEGIN EXCLUSIVE", ()).await.unwrap();

        let release = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            conn.execute("COMMIT", ()).await.unwrap();
            drop(holder);
        });
        let db = Db::open_local(&path).await.unwrap();
        release.await.unwrap();

        let mut rows = db.conn().query("PRAGMA journal_mode", ()).await.unwrap();
        let mode: String = rows.next().await.unwrap().unwrap().get(0).unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[test]
    fn stamps_sort_lexically() {
        let early = Utc::now();
        let late = early + chrono::Duration::milliseconds(1500);
        assert!(stamp(early) < stamp(late));
        assert_eq!(stamp(early).len(), stamp(late).len());
    }

    #[test]
    fn snapping_removes_float_noise() {
        assert_eq!(snap(0.1 + 0.2), snap(0.3));
        assert_eq!(snap(-179.75), -179.75);
    }
}
