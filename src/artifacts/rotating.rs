//! Rotating keyed artifact store.
//!
//! Each backing store is a libSQL file with one `artifacts(key, value)`
//! table. Writes go to the open store inside a transaction; after `max_keys`
//! puts the store is committed, closed for good, and the next put opens a
//! fresh file named by the current timestamp.

use std::path::{Path, PathBuf};

use chrono::Utc;
use libsql::{Connection, Database as LibSqlDatabase};
use tracing::{debug, info};

use crate::artifacts::model::SimulationResult;
use crate::error::ArtifactError;
use crate::naming::artifact_key;

/// Prefix and extension of backing store file names.
pub const STORE_PREFIX: &str = "results_";
pub const STORE_EXTENSION: &str = "store";

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS artifacts (key TEXT PRIMARY KEY, value BLOB NOT NULL)";

/// One backing file open for writing.
struct OpenStore {
    path: PathBuf,
    #[allow(dead_code)]
    db: LibSqlDatabase,
    conn: Connection,
    in_tx: bool,
}

/// Append-only keyed store that rotates to a new file every `max_keys` puts.
pub struct ArtifactStore {
    dir: PathBuf,
    max_keys: usize,
    current: Option<OpenStore>,
    key_count: usize,
    closed_paths: Vec<PathBuf>,
    closed: bool,
}

impl ArtifactStore {
    /// Store writing into `dir`; the first backing file is created on the first put.
    pub async fn open(dir: &Path, max_keys: usize) -> Result<Self, ArtifactError> {
        tokio::fs::create_dir_all(dir).await?;
        Ok(Self {
            dir: dir.to_path_buf(),
            max_keys: max_keys.max(1),
            current: None,
            key_count: 0,
            closed_paths: Vec::new(),
            closed: false,
        })
    }

    /// Write a value into the currently open backing store.
    pub async fn put(&mut self, key: &str, value: &[u8]) -> Result<(), ArtifactError> {
        if self.closed {
            return Err(ArtifactError::Closed);
        }
        if self.current.is_none() {
            self.current = Some(self.create_store().await?);
            self.key_count = 0;
        }
        let Some(store) = self.current.as_mut() else {
            return Err(ArtifactError::Closed);
        };
        if !store.in_tx {
            store
                .conn
                .execute("BEGIN", ())
                .await
                .map_err(|e| ArtifactError::Write(format!("begin: {e}")))?;
            store.in_tx = true;
        }
        store
            .conn
            .execute(
                "INSERT OR REPLACE INTO artifacts (key, value) VALUES (?1, ?2)",
                libsql::params![key, value.to_vec()],
            )
            .await
            .map_err(|e| ArtifactError::Write(format!("put {key}: {e}")))?;
        self.key_count += 1;

        if self.key_count >= self.max_keys {
            self.rotate().await?;
        }
        Ok(())
    }

    /// Put a result under its task key.
    pub async fn put_result(&mut self, result: &SimulationResult) -> Result<(), ArtifactError> {
        let bytes = result.encode()?;
        self.put(&artifact_key(result.task_id), &bytes).await
    }

    /// Commit pending writes without rotating.
    pub async fn flush(&mut self) -> Result<(), ArtifactError> {
        if let Some(store) = self.current.as_mut() {
            commit(store).await?;
        }
        Ok(())
    }

    /// Commit and release the open store. Further puts fail.
    pub async fn close(&mut self) -> Result<(), ArtifactError> {
        if let Some(store) = self.current.take() {
            self.finish(store).await?;
        }
        self.closed = true;
        Ok(())
    }

    /// Puts into the currently open store.
    pub fn key_count(&self) -> usize {
        self.key_count
    }

    /// Stores rotated or closed by this instance, oldest first.
    pub fn closed_paths(&self) -> &[PathBuf] {
        &self.closed_paths
    }

    async fn rotate(&mut self) -> Result<(), ArtifactError> {
        if let Some(store) = self.current.take() {
            info!(path = %store.path.display(), keys = self.key_count, "Rotating artifact store");
            self.finish(store).await?;
        }
        self.key_count = 0;
        Ok(())
    }

    async fn finish(&mut self, mut store: OpenStore) -> Result<(), ArtifactError> {
        commit(&mut store).await?;
        self.closed_paths.push(store.path.clone());
        debug!(path = %store.path.display(), "Artifact store closed");
        Ok(())
    }

    async fn create_store(&self) -> Result<OpenStore, ArtifactError> {
        let path = unique_store_path(&self.dir);
        let open_err = |reason: String| ArtifactError::Open {
            path: path.clone(),
            reason,
        };
        let db = libsql::Builder::new_local(&path)
            .build()
            .await
            .map_err(|e| open_err(e.to_string()))?;
        let conn = db.connect().map_err(|e| open_err(e.to_string()))?;
        conn.execute(SCHEMA, ())
            .await
            .map_err(|e| open_err(e.to_string()))?;
        info!(path = %path.display(), "Opened new artifact store");
        Ok(OpenStore {
            path,
            db,
            conn,
            in_tx: false,
        })
    }
}

async fn commit(store: &mut OpenStore) -> Result<(), ArtifactError> {
    if store.in_tx {
        store
            .conn
            .execute("COMMIT", ())
            .await
            .map_err(|e| ArtifactError::Write(format!("commit {}: {e}", store.path.display())))?;
        store.in_tx = false;
    }
    Ok(())
}

/// Timestamped store path, suffixed `_N` if the name is taken.
fn unique_store_path(dir: &Path) -> PathBuf {
    let stem = format!("{STORE_PREFIX}{}", Utc::now().format("%Y%m%d_%H%M%S_%6f"));
    let mut path = dir.join(format!("{stem}.{STORE_EXTENSION}"));
    let mut n = 1;
    while path.exists() {
        path = dir.join(format!("{stem}_{n}.{STORE_EXTENSION}"));
        n += 1;
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::multi::MultiStore;

    fn store_files(dir: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.extension().is_some_and(|e| e == STORE_EXTENSION))
            .collect();
        files.sort();
        files
    }

    #[tokio::test]
    async fn rotates_after_max_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = ArtifactStore::open(tmp.path(), 3).await.unwrap();
        for i in 0..4 {
            store.put(&artifact_key(i), format!("v{i}").as_bytes()).await.unwrap();
        }
        assert_eq!(store.closed_paths().len(), 1);
        assert_eq!(store.key_count(), 1);
        store.close().await.unwrap();

        assert_eq!(store_files(tmp.path()).len(), 2);
        let mut multi = MultiStore::open(tmp.path(), None).await.unwrap();
        for i in 0..4 {
            let value = multi.get(&artifact_key(i)).await.unwrap().unwrap();
            assert_eq!(value, format!("v{i}").into_bytes());
        }
    }

    #[tokio::test]
    async fn nothing_written_means_no_files() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = ArtifactStore::open(tmp.path(), 10).await.unwrap();
        store.close().await.unwrap();
        assert!(store_files(tmp.path()).is_empty());
    }

    #[tokio::test]
    async fn closed_store_rejects_writes() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = ArtifactStore::open(tmp.path(), 10).await.unwrap();
        store.put("0000000001", b"a").await.unwrap();
        store.close().await.unwrap();
        assert!(matches!(
            store.put("0000000002", b"b").await,
            Err(ArtifactError::Closed)
        ));
    }

    #[tokio::test]
    async fn flushed_writes_are_visible_to_readers() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = ArtifactStore::open(tmp.path(), 10).await.unwrap();
        store.put("0000000001", b"a").await.unwrap();
        store.flush().await.unwrap();

        let mut multi = MultiStore::open(tmp.path(), None).await.unwrap();
        assert_eq!(multi.get("0000000001").await.unwrap(), Some(b"a".to_vec()));
        store.close().await.unwrap();
    }

    #[test]
    fn store_names_are_unique() {
        let tmp = tempfile::tempdir().unwrap();
        let first = unique_store_path(tmp.path());
        std::fs::write(&first, b"").unwrap();
        let second = unique_store_path(tmp.path());
        assert_ne!(first, second);
        let name = first.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(STORE_PREFIX));
        assert!(name.ends_with(".store"));
    }
}
