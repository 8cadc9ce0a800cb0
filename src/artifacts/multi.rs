//! Read-only merged view over several artifact stores.
//!
//! Stores are searched in a fixed order and the first match wins; values
//! are never merged. Directory scans order files by name descending, so
//! the newest timestamped store is consulted first.

use std::path::{Path, PathBuf};

use libsql::{Connection, Database as LibSqlDatabase};
use regex::Regex;
use tracing::{debug, info};

use crate::artifacts::model::SimulationResult;
use crate::artifacts::rotating::{STORE_EXTENSION, STORE_PREFIX};
use crate::error::ArtifactError;
use crate::naming::artifact_key;

struct ReadStore {
    path: PathBuf,
    #[allow(dead_code)]
    db: LibSqlDatabase,
    conn: Connection,
}

/// Merged lookup across stores.
pub struct MultiStore {
    stores: Vec<ReadStore>,
    /// Last key found and the index of the store that held it.
    ///
    /// Only a repeat lookup of that same key skips the scan. Trying the
    /// last answering store first for other keys would let an older store
    /// shadow a newer one holding the same key.
    last_hit: Option<(String, usize)>,
}

impl MultiStore {
    /// Open every file in `dir` whose name matches `pattern`
    /// (default: rotating store names), newest name first.
    pub async fn open(dir: &Path, pattern: Option<&str>) -> Result<Self, ArtifactError> {
        let default_pattern = format!(
            r"^{}.*\.{}$",
            regex::escape(STORE_PREFIX),
            regex::escape(STORE_EXTENSION)
        );
        let pattern = pattern.unwrap_or(&default_pattern);
        let re = Regex::new(pattern).map_err(|e| ArtifactError::Pattern(format!("{pattern}: {e}")))?;

        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if re.is_match(&name) {
                names.push(name);
            }
        }
        names.sort_unstable_by(|a, b| b.cmp(a));

        let paths: Vec<PathBuf> = names.into_iter().map(|n| dir.join(n)).collect();
        Self::open_paths(&paths).await
    }

    /// Open stores in exactly the given order.
    pub async fn open_paths(paths: &[PathBuf]) -> Result<Self, ArtifactError> {
        let mut stores = Vec::with_capacity(paths.len());
        for path in paths {
            let open_err = |reason: String| ArtifactError::Open {
                path: path.clone(),
                reason,
            };
            let db = libsql::Builder::new_local(path)
                .build()
                .await
                .map_err(|e| open_err(e.to_string()))?;
            let conn = db.connect().map_err(|e| open_err(e.to_string()))?;
            stores.push(ReadStore {
                path: path.clone(),
                db,
                conn,
            });
        }
        info!(stores = stores.len(), "Opened artifact stores for reading");
        Ok(Self {
            stores,
            last_hit: None,
        })
    }

    /// Number of stores in the view.
    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    /// Store paths in lookup order.
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.stores.iter().map(|s| s.path.as_path())
    }

    /// Value of `key` from the first store holding it, `None` if none does.
    ///
    /// Every lookup other than a repeat of the previous key scans the
    /// stores in order.
    pub async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, ArtifactError> {
        if let Some((cached_key, idx)) = &self.last_hit
            && cached_key == key
            && let Some(value) = lookup(&self.stores[*idx], key).await?
        {
            return Ok(Some(value));
        }

        for (idx, store) in self.stores.iter().enumerate() {
            if let Some(value) = lookup(store, key).await? {
                self.last_hit = Some((key.to_string(), idx));
                return Ok(Some(value));
            }
        }
        debug!(key, "Key not found in any artifact store");
        Ok(None)
    }

    /// Decoded result of a task, `None` if no store holds it.
    pub async fn get_result(&mut self, task_id: i64) -> Result<Option<SimulationResult>, ArtifactError> {
        match self.get(&artifact_key(task_id)).await? {
            Some(bytes) => SimulationResult::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }
}

async fn lookup(store: &ReadStore, key: &str) -> Result<Option<Vec<u8>>, ArtifactError> {
    let read_err = |e: libsql::Error| ArtifactError::Read(format!("{}: {e}", store.path.display()));
    let mut rows = store
        .conn
        .query(
            "SELECT value FROM artifacts WHERE key = ?1",
            libsql::params![key],
        )
        .await
        .map_err(read_err)?;
    match rows.next().await.map_err(read_err)? {
        Some(row) => Ok(Some(row.get::<Vec<u8>>(0).map_err(read_err)?)),
        None => Ok(None),
    }
}
