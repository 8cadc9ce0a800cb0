//! Version-tracked schema migrations for the shared task database.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially, so every
//! worker process may call it on startup.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "tasklist_and_crops",
        sql: r#"
            CREATE TABLE IF NOT EXISTS tasklist (
                task_id INTEGER PRIMARY KEY,
                status TEXT NOT NULL DEFAULT 'Pending',
                hostname TEXT,
                crop_no INTEGER NOT NULL,
                longitude REAL NOT NULL,
                latitude REAL NOT NULL,
                tsum1 REAL,
                tsum2 REAL,
                process_id INTEGER,
                comment TEXT,
                claimed_at TEXT,
                updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );
            CREATE INDEX IF NOT EXISTS idx_tasklist_status ON tasklist(status, task_id);
            CREATE INDEX IF NOT EXISTS idx_tasklist_crop ON tasklist(crop_no, status);

            CREATE TABLE IF NOT EXISTS crop (
                crop_no INTEGER PRIMARY KEY,
                crop_name TEXT NOT NULL,
                mgmt_code TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS cropinfo (
                crop_no INTEGER PRIMARY KEY,
                label TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tsum (
                crop_no INTEGER NOT NULL,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                average REAL,
                stdev REAL,
                minimum REAL,
                maximum REAL,
                numobs INTEGER NOT NULL,
                PRIMARY KEY (crop_no, latitude, longitude)
            );
        "#,
    },
    Migration {
        version: 2,
        name: "crop_calendar",
        sql: r#"
            CREATE TABLE IF NOT EXISTS crop_calendar (
                crop_no INTEGER NOT NULL,
                longitude REAL NOT NULL,
                latitude REAL NOT NULL,
                start_doy INTEGER NOT NULL,
                end_doy INTEGER NOT NULL,
                PRIMARY KEY (crop_no, longitude, latitude)
            );
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    tracing::debug!(
        version = get_current_version(conn).await?,
        "Database migrations complete"
    );
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row.get::<i64>(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
///
/// `INSERT OR IGNORE` lets two processes race through startup safely.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
