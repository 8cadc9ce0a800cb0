//! Task leasing on top of the shared `tasklist` table.
//!
//! Worker processes coordinate only through this table. A claim is a single
//! conditional `UPDATE ... RETURNING`, so two workers can never lease the
//! same task id.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use libsql::params;
use tracing::{debug, info, warn};

use crate::error::{DatabaseError, Result, TaskError};
use crate::store::db::{
    Db, now_stamp, opt_integer, opt_real, opt_text, real, real_or_null, retry_busy, snap, stamp,
    text_or_null,
};
use crate::store::model::{NewTask, Task};
use crate::worker::state::TaskStatus;

/// Width of the `comment` column; longer diagnostics are cut.
pub const COMMENT_WIDTH: usize = 70;

/// Rows inserted per transaction by [`TaskQueue::enqueue`].
const ENQUEUE_BATCH: usize = 1000;

/// Claim attempts that found a `Pending` row but lost it to another worker.
const MAX_CLAIM_ATTEMPTS: usize = 16;

const TASK_COLUMNS: &str =
    "task_id, status, hostname, crop_no, longitude, latitude, tsum1, tsum2, process_id, comment";

/// Leasing protocol over the `tasklist` table.
#[derive(Clone)]
pub struct TaskQueue {
    db: Arc<Db>,
    hostname: String,
    process_id: i64,
}

impl TaskQueue {
    /// Queue stamping claims with this host and process.
    pub fn new(db: Arc<Db>) -> Self {
        Self::with_identity(db, local_hostname(), std::process::id() as i64)
    }

    /// Queue stamping claims with an explicit identity.
    pub fn with_identity(db: Arc<Db>, hostname: impl Into<String>, process_id: i64) -> Self {
        Self {
            db,
            hostname: hostname.into(),
            process_id,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn process_id(&self) -> i64 {
        self.process_id
    }

    /// Atomically lease the lowest-numbered `Pending` task.
    ///
    /// Returns `None` when no `Pending` task remains.
    pub async fn get_task(&self) -> std::result::Result<Option<Task>, DatabaseError> {
        let conn = self.db.conn();
        let sql = format!(
            "UPDATE tasklist
             SET status = 'Running', hostname = ?1, process_id = ?2,
                 claimed_at = ?3, updated_at = ?3, comment = NULL
             WHERE task_id = (
                 SELECT task_id FROM tasklist WHERE status = 'Pending'
                 ORDER BY task_id LIMIT 1
             ) AND status = 'Pending'
             RETURNING {TASK_COLUMNS}"
        );

        for _ in 0..MAX_CLAIM_ATTEMPTS {
            let claimed = retry_busy("get_task", || {
                let sql = sql.as_str();
                let args = params![self.hostname.clone(), self.process_id, now_stamp()];
                async move {
                    let mut rows = conn.query(sql, args).await?;
                    match rows.next().await? {
                        Some(row) => row_to_task(&row).map(Some),
                        None => Ok(None),
                    }
                }
            })
            .await?;

            if let Some(task) = claimed {
                debug!(
                    task_id = task.task_id,
                    crop_no = task.crop_no,
                    lon = task.longitude,
                    lat = task.latitude,
                    "Task claimed"
                );
                return Ok(Some(task));
            }
            if self.count_by_status(TaskStatus::Pending).await? == 0 {
                return Ok(None);
            }
        }
        warn!("Pending tasks remain but every claim attempt lost the race");
        Ok(None)
    }

    /// Running → Finished. A task that is already Finished is left alone.
    pub async fn set_task_finished(&self, task: &Task) -> Result<()> {
        self.complete(task.task_id, TaskStatus::Finished, None).await
    }

    /// Running → Error with a diagnostic comment (cut to [`COMMENT_WIDTH`]).
    pub async fn set_task_error(&self, task: &Task, comment: &str) -> Result<()> {
        let comment = truncate_comment(comment);
        self.complete(task.task_id, TaskStatus::Error, Some(comment))
            .await
    }

    async fn complete(&self, task_id: i64, target: TaskStatus, comment: Option<String>) -> Result<()> {
        let conn = self.db.conn();
        let sql = format!(
            "UPDATE tasklist SET status = ?2, comment = COALESCE(?3, comment), updated_at = ?4
             WHERE task_id = ?1 AND status IN ({})",
            status_list(target)
        );
        let changed = retry_busy("complete_task", || {
            conn.execute(
                &sql,
                params![
                    task_id,
                    target.as_str(),
                    text_or_null(comment.as_deref()),
                    now_stamp()
                ],
            )
        })
        .await?;

        if changed > 0 {
            info!(task_id, status = %target, comment = comment.as_deref().unwrap_or(""), "Task completed");
            return Ok(());
        }

        match self.get_task_by_id(task_id).await? {
            None => Err(TaskError::NotFound { task_id }.into()),
            Some(current) if current.status == TaskStatus::Finished && target == TaskStatus::Finished => {
                debug!(task_id, "Task already finished");
                Ok(())
            }
            Some(current) => Err(TaskError::InvalidTransition {
                task_id,
                state: current.status.to_string(),
                target: target.to_string(),
            }
            .into()),
        }
    }

    /// Insert new `Pending` tasks, one transaction per batch.
    pub async fn enqueue(&self, tasks: &[NewTask]) -> std::result::Result<usize, DatabaseError> {
        let conn = self.db.conn();
        let mut inserted = 0;
        for chunk in tasks.chunks(ENQUEUE_BATCH) {
            let tx = conn
                .transaction()
                .await
                .map_err(|e| DatabaseError::Query(format!("enqueue begin: {e}")))?;
            let now = now_stamp();
            for task in chunk {
                tx.execute(
                    "INSERT INTO tasklist
                       (task_id, status, crop_no, longitude, latitude, tsum1, tsum2, updated_at)
                     VALUES (?1, 'Pending', ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        task.task_id,
                        task.crop_no,
                        snap(task.longitude),
                        snap(task.latitude),
                        real_or_null(task.tsum1),
                        real_or_null(task.tsum2),
                        now.clone()
                    ],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("enqueue task {}: {e}", task.task_id)))?;
            }
            tx.commit()
                .await
                .map_err(|e| DatabaseError::Query(format!("enqueue commit: {e}")))?;
            inserted += chunk.len();
            debug!(batch = chunk.len(), total = inserted, "Enqueued task batch");
        }
        Ok(inserted)
    }

    /// Operator action: move an Error or Running task back to `Pending`.
    pub async fn requeue(&self, task_id: i64) -> Result<()> {
        let conn = self.db.conn();
        let sql = format!(
            "UPDATE tasklist
             SET status = 'Pending', hostname = NULL, process_id = NULL,
                 comment = NULL, claimed_at = NULL, updated_at = ?2
             WHERE task_id = ?1 AND status IN ({})",
            status_list(TaskStatus::Pending)
        );
        let changed = retry_busy("requeue", || {
            conn.execute(&sql, params![task_id, now_stamp()])
        })
        .await?;

        if changed > 0 {
            info!(task_id, "Task requeued");
            return Ok(());
        }
        match self.get_task_by_id(task_id).await? {
            None => Err(TaskError::NotFound { task_id }.into()),
            Some(task) if task.status == TaskStatus::Pending => Ok(()),
            Some(task) => Err(TaskError::InvalidTransition {
                task_id,
                state: task.status.to_string(),
                target: TaskStatus::Pending.to_string(),
            }
            .into()),
        }
    }

    /// Operator action: requeue Running tasks claimed longer than `max_age` ago.
    ///
    /// Recovers leases orphaned by a worker that died between writing its
    /// artifact and marking the task finished. Returns the number requeued.
    pub async fn requeue_stale(&self, max_age: Duration) -> std::result::Result<u64, DatabaseError> {
        let cutoff = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .map(stamp);
        let Some(cutoff) = cutoff else {
            return Ok(0);
        };

        let conn = self.db.conn();
        let changed = retry_busy("requeue_stale", || {
            conn.execute(
                "UPDATE tasklist
                 SET status = 'Pending', hostname = NULL, process_id = NULL,
                     comment = NULL, claimed_at = NULL, updated_at = ?2
                 WHERE status = 'Running' AND claimed_at IS NOT NULL AND claimed_at < ?1",
                params![cutoff.clone(), now_stamp()],
            )
        })
        .await?;
        info!(requeued = changed, max_age_secs = max_age.as_secs(), "Stale leases requeued");
        Ok(changed)
    }

    /// Fetch a task without claiming it.
    pub async fn get_task_by_id(&self, task_id: i64) -> std::result::Result<Option<Task>, DatabaseError> {
        let conn = self.db.conn();
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasklist WHERE task_id = ?1");
        retry_busy("get_task_by_id", || {
            let sql = sql.as_str();
            async move {
                let mut rows = conn.query(sql, params![task_id]).await?;
                match rows.next().await? {
                    Some(row) => row_to_task(&row).map(Some),
                    None => Ok(None),
                }
            }
        })
        .await
    }

    /// Number of tasks in a status.
    pub async fn count_by_status(&self, status: TaskStatus) -> std::result::Result<i64, DatabaseError> {
        let conn = self.db.conn();
        retry_busy("count_by_status", || async move {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM tasklist WHERE status = ?1",
                    params![status.as_str()],
                )
                .await?;
            match rows.next().await? {
                Some(row) => row.get::<i64>(0),
                None => Ok(0),
            }
        })
        .await
    }

    /// Ids of the finished tasks of a crop, ascending.
    pub async fn finished_task_ids(&self, crop_no: i64) -> std::result::Result<Vec<i64>, DatabaseError> {
        let conn = self.db.conn();
        retry_busy("finished_task_ids", || async move {
            let mut rows = conn
                .query(
                    "SELECT task_id FROM tasklist WHERE crop_no = ?1 AND status = 'Finished'
                     ORDER BY task_id",
                    params![crop_no],
                )
                .await?;
            let mut ids = Vec::new();
            while let Some(row) = rows.next().await? {
                ids.push(row.get::<i64>(0)?);
            }
            Ok(ids)
        })
        .await
    }

    /// Smallest id above every existing task.
    pub async fn next_task_id(&self) -> std::result::Result<i64, DatabaseError> {
        let conn = self.db.conn();
        retry_busy("next_task_id", || async move {
            let mut rows = conn
                .query("SELECT COALESCE(MAX(task_id), 0) + 1 FROM tasklist", ())
                .await?;
            match rows.next().await? {
                Some(row) => row.get::<i64>(0),
                None => Ok(1),
            }
        })
        .await
    }

    /// Cells that already have a task for the crop, as [`cell_key`]s.
    pub async fn task_cells(&self, crop_no: i64) -> std::result::Result<HashSet<(i64, i64)>, DatabaseError> {
        let conn = self.db.conn();
        retry_busy("task_cells", || async move {
            let mut rows = conn
                .query(
                    "SELECT longitude, latitude FROM tasklist WHERE crop_no = ?1",
                    params![crop_no],
                )
                .await?;
            let mut cells = HashSet::new();
            while let Some(row) = rows.next().await? {
                cells.insert(cell_key(real(&row, 0)?, real(&row, 1)?));
            }
            Ok(cells)
        })
        .await
    }
}

/// Integer micro-degree key identifying a cell.
pub fn cell_key(longitude: f64, latitude: f64) -> (i64, i64) {
    (
        (longitude * 1e6).round() as i64,
        (latitude * 1e6).round() as i64,
    )
}

/// Quoted SQL list of the statuses that may move to `target`.
fn status_list(target: TaskStatus) -> String {
    TaskStatus::sources_of(target)
        .map(|s| format!("'{s}'"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Cut a diagnostic to the comment column width on a char boundary.
pub fn truncate_comment(comment: &str) -> String {
    comment.chars().take(COMMENT_WIDTH).collect()
}

/// Host name stamped on claimed tasks.
pub fn local_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "localhost".to_string())
}

fn row_to_task(row: &libsql::Row) -> std::result::Result<Task, libsql::Error> {
    let status: String = row.get(1)?;
    Ok(Task {
        task_id: row.get(0)?,
        status: status
            .parse()
            .map_err(|_| libsql::Error::InvalidColumnType)?,
        hostname: opt_text(row, 2)?,
        crop_no: row.get(3)?,
        longitude: real(row, 4)?,
        latitude: real(row, 5)?,
        tsum1: opt_real(row, 6)?,
        tsum2: opt_real(row, 7)?,
        process_id: opt_integer(row, 8)?,
        comment: opt_text(row, 9)?,
    })
}
