//! Where workers put finished results.
//!
//! A single process can write straight into an [`ArtifactStore`]. Many
//! worker processes instead drop one file per task into a [`StagingDir`]
//! and a single ingest process moves them into the rotating store.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::artifacts::model::SimulationResult;
use crate::artifacts::rotating::ArtifactStore;
use crate::error::ArtifactError;
use crate::naming::artifact_key;

/// Destination for finished results.
///
/// `write` must be durable when it returns: the task is marked finished
/// right after.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    async fn write(&self, result: &SimulationResult) -> Result<(), ArtifactError>;
}

#[async_trait]
impl ArtifactSink for Mutex<ArtifactStore> {
    async fn write(&self, result: &SimulationResult) -> Result<(), ArtifactError> {
        let mut store = self.lock().await;
        store.put_result(result).await?;
        store.flush().await
    }
}

/// Directory of one JSON file per finished task.
#[derive(Debug, Clone)]
pub struct StagingDir {
    dir: PathBuf,
}

const STAGED_EXTENSION: &str = "json";
const REJECTED_SUFFIX: &str = ".rejected";
const INGESTED_SUFFIX: &str = ".ingested";

impl StagingDir {
    pub async fn open(dir: &Path) -> Result<Self, ArtifactError> {
        tokio::fs::create_dir_all(dir).await?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Final path of a task's staged file.
    pub fn file_for(&self, task_id: i64) -> PathBuf {
        self.dir
            .join(format!("task_{}.{STAGED_EXTENSION}", artifact_key(task_id)))
    }

    /// Staged files ready for ingest, sorted by name.
    pub async fn staged_files(&self) -> Result<Vec<PathBuf>, ArtifactError> {
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == STAGED_EXTENSION) && entry.file_type().await?.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl ArtifactSink for StagingDir {
    /// Write to a `.tmp` file, sync, then rename into place so the ingest
    /// never sees a partial file.
    async fn write(&self, result: &SimulationResult) -> Result<(), ArtifactError> {
        let bytes = result.encode()?;
        let final_path = self.file_for(result.task_id);
        let mut tmp_name = final_path.clone().into_os_string();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        tokio::fs::write(&tmp_path, &bytes).await?;
        let file = tokio::fs::File::open(&tmp_path).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, &final_path).await?;
        debug!(task_id = result.task_id, path = %final_path.display(), "Result staged");
        Ok(())
    }
}

/// Move every staged result into the store.
///
/// Files are loaded in name order and the store is flushed. Only then are
/// the files deleted, or with `cleanup` unset renamed with an `.ingested`
/// suffix so a later call does not store them again. Undecodable files are
/// renamed with a `.rejected` suffix and skipped. Returns the number ingested.
pub async fn ingest(staging: &StagingDir, store: &mut ArtifactStore, cleanup: bool) -> Result<usize, ArtifactError> {
    let files = staging.staged_files().await?;
    let mut loaded = Vec::with_capacity(files.len());

    for path in files {
        let bytes = tokio::fs::read(&path).await?;
        match SimulationResult::decode(&bytes) {
            Ok(result) => {
                store.put(&artifact_key(result.task_id), &bytes).await?;
                loaded.push(path);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Rejecting staged artifact");
                tokio::fs::rename(&path, with_suffix(&path, REJECTED_SUFFIX)).await?;
            }
        }
    }
    store.flush().await?;

    for path in &loaded {
        if cleanup {
            tokio::fs::remove_file(path).await?;
        } else {
            tokio::fs::rename(path, with_suffix(path, INGESTED_SUFFIX)).await?;
        }
    }
    if !loaded.is_empty() {
        info!(count = loaded.len(), cleanup, "Ingested staged artifacts");
    }
    Ok(loaded.len())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}
