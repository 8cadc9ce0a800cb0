//! Process supervision for worker slots.

use std::future::Future;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use futures::future::join_all;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use crate::config::SupervisorConfig;
use crate::error::{Error, Result};
use crate::store::TaskQueue;
use crate::worker::state::TaskStatus;

/// How long children get to exit on their own after a shutdown before
/// they are killed.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Floor for the liveness poll; `tokio::time::interval` rejects zero.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Number of worker slots for a signed CPU request.
///
/// `None` uses every core, `0` means one, a positive value is capped at
/// `available`, a negative value leaves that many cores free (at least one
/// slot remains).
pub fn worker_count(requested: Option<i64>, available: usize) -> usize {
    let available = available.max(1);
    match requested {
        None => available,
        Some(0) => 1,
        Some(n) if n > 0 => available.min(usize::try_from(n).unwrap_or(usize::MAX)),
        Some(n) => {
            let free = usize::try_from(n.unsigned_abs()).unwrap_or(usize::MAX);
            available.saturating_sub(free).max(1)
        }
    }
}

/// Cores the process may use, 1 if unknown.
pub fn available_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Command line of one child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// This executable with the given subcommand arguments.
    pub fn current_exe(args: impl IntoIterator<Item = impl Into<String>>) -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?, args))
    }

    fn spawn(&self) -> Result<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Supervisor(format!("failed to spawn {}: {e}", self.program.display())))
    }
}

/// Outcome of a supervisor run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupervisorReport {
    pub spawned: usize,
    pub restarts: usize,
    pub retired: usize,
    pub shutdown: bool,
}

struct Slot {
    command: WorkerCommand,
    child: Option<Child>,
}

/// Keeps one child process alive per slot.
///
/// A slot whose child exits successfully is retired once there is no
/// Pending work left; any other exit gets a fresh child on the next poll.
pub struct Supervisor {
    slots: Vec<WorkerCommand>,
    poll_interval: Duration,
    grace: Duration,
    queue: Option<TaskQueue>,
}

impl Supervisor {
    pub fn new(slots: Vec<WorkerCommand>, config: &SupervisorConfig) -> Self {
        Self {
            slots,
            poll_interval: config.poll_interval.max(MIN_POLL_INTERVAL),
            grace: DEFAULT_SHUTDOWN_GRACE,
            queue: None,
        }
    }

    /// Consult the task list before retiring a slot.
    pub fn with_queue(mut self, queue: TaskQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Run until every slot retired or `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F) -> Result<SupervisorReport>
    where
        F: Future<Output = ()>,
    {
        let mut report = SupervisorReport::default();
        let mut slots = Vec::with_capacity(self.slots.len());
        for command in &self.slots {
            let child = command.spawn()?;
            report.spawned += 1;
            debug!(pid = child.id(), args = ?command.args, "Worker spawned");
            slots.push(Slot {
                command: command.clone(),
                child: Some(child),
            });
        }
        info!(slots = slots.len(), poll = ?self.poll_interval, "Supervisor started");

        let mut ticker = tokio::time::interval(self.poll_interval);
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutting down workers");
                    self.terminate(&mut slots).await;
                    report.shutdown = true;
                    break;
                }
                _ = ticker.tick() => {
                    self.poll(&mut slots, &mut report).await?;
                    if slots.iter().all(|s| s.child.is_none()) {
                        info!("All worker slots retired");
                        break;
                    }
                }
            }
        }
        info!(?report, "Supervisor stopped");
        Ok(report)
    }

    async fn poll(&self, slots: &mut [Slot], report: &mut SupervisorReport) -> Result<()> {
        for (index, slot) in slots.iter_mut().enumerate() {
            let Some(child) = slot.child.as_mut() else {
                continue;
            };
            let status = match child.try_wait() {
                Ok(Some(status)) => status,
                Ok(None) => continue,
                Err(e) => {
                    warn!(slot = index, error = %e, "Could not poll worker");
                    continue;
                }
            };
            if status.success() && !self.work_remaining().await {
                info!(slot = index, "Worker finished, slot retired");
                slot.child = None;
                report.retired += 1;
                continue;
            }
            log_exit(index, status);
            slot.child = Some(slot.command.spawn()?);
            report.restarts += 1;
        }
        Ok(())
    }

    async fn work_remaining(&self) -> bool {
        let Some(queue) = &self.queue else {
            return false;
        };
        match queue.count_by_status(TaskStatus::Pending).await {
            Ok(pending) => pending > 0,
            Err(e) => {
                warn!(error = %e, "Could not count pending tasks");
                true
            }
        }
    }

    /// Ask every child to stop, give it the grace period, then kill what is left.
    async fn terminate(&self, slots: &mut [Slot]) {
        let grace = self.grace;
        let children = slots.iter_mut().filter_map(|slot| slot.child.take());
        join_all(children.map(|mut child| async move {
            request_stop(&child);
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => debug!(?status, "Worker exited"),
                Ok(Err(e)) => warn!(error = %e, "Could not wait for worker"),
                Err(_) => {
                    if let Err(e) = child.kill().await {
                        error!(pid = child.id(), error = %e, "Failed to kill worker");
                    }
                }
            }
        }))
        .await;
    }
}

/// Send SIGTERM so the worker can mark its running task before exiting.
#[cfg(unix)]
fn request_stop(child: &Child) {
    let Some(pid) = child.id() else {
        return;
    };
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        warn!(pid, "Worker pid out of range, not signalled");
        return;
    };
    // SAFETY: kill(2) only delivers a signal to a child we spawned and have not reaped.
    if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
        warn!(pid, error = %std::io::Error::last_os_error(), "Failed to signal worker");
    }
}

#[cfg(not(unix))]
fn request_stop(_child: &Child) {}

fn log_exit(slot: usize, status: ExitStatus) {
    match status.code() {
        Some(0) => info!(slot, "Worker exited with work left, replacing"),
        Some(code) => warn!(slot, code, "Worker exited, replacing"),
        None => warn!(slot, "Worker killed by signal, replacing"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::store::{Db, NewTask};

    fn config() -> SupervisorConfig {
        SupervisorConfig {
            cpus: None,
            poll_interval: Duration::from_millis(20),
        }
    }

    fn sh(script: &str) -> WorkerCommand {
        WorkerCommand::new("sh", ["-c", script])
    }

    #[test]
    fn worker_count_rules() {
        assert_eq!(worker_count(None, 8), 8);
        assert_eq!(worker_count(Some(0), 8), 1);
        assert_eq!(worker_count(Some(3), 8), 3);
        assert_eq!(worker_count(Some(16), 8), 8);
        assert_eq!(worker_count(Some(-2), 8), 6);
        assert_eq!(worker_count(Some(-8), 8), 1);
        assert_eq!(worker_count(Some(-20), 8), 1);
        assert_eq!(worker_count(None, 1), 1);
        assert_eq!(worker_count(Some(4), 1), 1);
        assert_eq!(worker_count(None, 0), 1);
    }

    #[tokio::test]
    async fn retires_slots_after_clean_exit() {
        let sup = Supervisor::new(vec![sh("exit 0"), sh("exit 0")], &config());
        let report = sup.run(std::future::pending()).await.unwrap();
        assert_eq!(report.spawned, 2);
        assert_eq!(report.retired, 2);
        assert_eq!(report.restarts, 0);
        assert!(!report.shutdown);
    }

    #[tokio::test]
    async fn replaces_failed_workers() {
        let sup = Supervisor::new(vec![sh("exit 1")], &config());
        let report = sup
            .run(tokio::time::sleep(Duration::from_millis(300)))
            .await
            .unwrap();
        assert!(report.restarts >= 2, "{report:?}");
        assert!(report.shutdown);
        assert_eq!(report.retired, 0);
    }

    #[tokio::test]
    async fn clean_exit_with_pending_work_is_replaced() {
        let db = Arc::new(Db::open_memory().await.unwrap());
        let queue = TaskQueue::with_identity(db, "h", 1);
        queue
            .enqueue(&[NewTask {
                task_id: 1,
                crop_no: 1,
                longitude: 0.0,
                latitude: 0.0,
                tsum1: None,
                tsum2: None,
            }])
            .await
            .unwrap();
        let sup = Supervisor::new(vec![sh("exit 0")], &config()).with_queue(queue);
        let report = sup
            .run(tokio::time::sleep(Duration::from_millis(200)))
            .await
            .unwrap();
        assert!(report.restarts >= 1);
        assert_eq!(report.retired, 0);
    }

    #[tokio::test]
    async fn zero_poll_interval_is_clamped() {
        let config = SupervisorConfig {
            cpus: None,
            poll_interval: Duration::ZERO,
        };
        let report = Supervisor::new(vec![sh("exit 0")], &config)
            .run(std::future::pending())
            .await
            .unwrap();
        assert_eq!(report.retired, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn children_get_sigterm_before_kill() {
        let tmp = tempfile::tempdir().unwrap();
        let marker = tmp.path().join("stopped");
        let script = format!(
            "trap 'echo term > {}; exit 130' TERM; while true; do sleep 0.05; done",
            marker.display()
        );
        let sup = Supervisor::new(vec![sh(&script)], &config()).with_grace(Duration::from_secs(3));
        let started = std::time::Instant::now();
        let report = sup
            .run(tokio::time::sleep(Duration::from_millis(300)))
            .await
            .unwrap();
        assert!(report.shutdown);
        assert_eq!(std::fs::read_to_string(&marker).unwrap().trim(), "term");
        // Exited on its own well inside the grace period.
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn kills_children_on_shutdown() {
        // Ignores SIGTERM, so only the kill after the grace period stops it.
        let sup = Supervisor::new(vec![sh("trap '' TERM; sleep 30")], &config())
            .with_grace(Duration::from_millis(50));
        let started = std::time::Instant::now();
        let report = sup
            .run(tokio::time::sleep(Duration::from_millis(100)))
            .await
            .unwrap();
        assert!(report.shutdown);
        assert_eq!(report.restarts, 0);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
