//! The per-process task loop.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::artifacts::{ArtifactSink, SimulationResult};
use crate::config::WorkerConfig;
use crate::error::{Error, Result, TaskError};
use crate::store::{Task, TaskQueue};
use crate::worker::runner::TaskRunner;

pub const COMMENT_GENERAL: &str = "General error, see log.";
pub const COMMENT_INTERRUPTED: &str = "Terminating on user request!";
pub const COMMENT_DEADLINE: &str = "Task exceeded deadline";

/// Why a worker loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// No Pending task left.
    QueueDrained,
    /// `max_tasks_per_worker` reached; a fresh process should take over.
    TaskLimitReached,
    Interrupted,
    /// A task ran past its deadline; its simulator thread is still busy.
    DeadlineExceeded,
}

impl WorkerExit {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::QueueDrained | Self::TaskLimitReached => 0,
            Self::Interrupted => 130,
            Self::DeadlineExceeded => 3,
        }
    }
}

/// Counters from one worker run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerReport {
    pub exit: WorkerExit,
    pub claimed: usize,
    pub finished: usize,
    pub failed: usize,
}

enum Outcome {
    Done(Result<SimulationResult>),
    Interrupted,
    Deadline,
}

/// Claims tasks until the queue is drained, the task limit is hit or the
/// process is asked to stop.
pub struct WorkerLoop {
    queue: TaskQueue,
    runner: Arc<TaskRunner>,
    sink: Arc<dyn ArtifactSink>,
    config: WorkerConfig,
    shutdown: watch::Receiver<bool>,
}

impl WorkerLoop {
    pub fn new(
        queue: TaskQueue,
        runner: Arc<TaskRunner>,
        sink: Arc<dyn ArtifactSink>,
        config: WorkerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            queue,
            runner,
            sink,
            config,
            shutdown,
        }
    }

    /// Run until an exit reason is reached.
    ///
    /// Store failures that make the queue unusable are returned as `Err`
    /// and leave the current task `Running`.
    pub async fn run(self) -> Result<WorkerReport> {
        let mut report = WorkerReport {
            exit: WorkerExit::QueueDrained,
            claimed: 0,
            finished: 0,
            failed: 0,
        };
        info!(
            host = self.queue.hostname(),
            pid = self.queue.process_id(),
            max_tasks = self.config.max_tasks_per_worker,
            "Worker started"
        );

        loop {
            if report.claimed >= self.config.max_tasks_per_worker {
                report.exit = WorkerExit::TaskLimitReached;
                break;
            }
            if *self.shutdown.borrow() {
                report.exit = WorkerExit::Interrupted;
                break;
            }
            let Some(task) = self.queue.get_task().await? else {
                report.exit = WorkerExit::QueueDrained;
                break;
            };
            report.claimed += 1;

            match self.execute(&task).await {
                Outcome::Done(Ok(result)) => match self.sink.write(&result).await {
                    Ok(()) => {
                        if self.settle(self.queue.set_task_finished(&task).await)? {
                            report.finished += 1;
                            info!(task_id = task.task_id, years = result.years.len(), "Task finished");
                        }
                    }
                    Err(e) => {
                        error!(task_id = task.task_id, error = %e, "Artifact write failed");
                        self.fail(&task, COMMENT_GENERAL).await?;
                        report.failed += 1;
                    }
                },
                Outcome::Done(Err(Error::Simulation(e))) => {
                    warn!(task_id = task.task_id, error = %e, "Simulation failed");
                    self.fail(&task, e.comment()).await?;
                    report.failed += 1;
                }
                Outcome::Done(Err(Error::Database(e))) if e.is_fatal() => {
                    error!(task_id = task.task_id, error = %e, "Task store unusable, stopping worker");
                    return Err(e.into());
                }
                Outcome::Done(Err(e)) => {
                    error!(task_id = task.task_id, error = %e, "Task failed");
                    self.fail(&task, COMMENT_GENERAL).await?;
                    report.failed += 1;
                }
                Outcome::Interrupted => {
                    warn!(task_id = task.task_id, "Interrupted while running task");
                    self.fail(&task, COMMENT_INTERRUPTED).await?;
                    report.failed += 1;
                    report.exit = WorkerExit::Interrupted;
                    break;
                }
                Outcome::Deadline => {
                    let timeout = self.config.task_timeout.unwrap_or_default();
                    error!(
                        "{}",
                        TaskError::DeadlineExceeded {
                            task_id: task.task_id,
                            timeout
                        }
                    );
                    self.fail(&task, COMMENT_DEADLINE).await?;
                    report.failed += 1;
                    report.exit = WorkerExit::DeadlineExceeded;
                    break;
                }
            }
        }

        info!(
            exit = ?report.exit,
            claimed = report.claimed,
            finished = report.finished,
            failed = report.failed,
            "Worker stopped"
        );
        Ok(report)
    }

    /// Run one task, racing it against shutdown and the deadline.
    async fn execute(&self, task: &Task) -> Outcome {
        let mut shutdown = self.shutdown.clone();
        let run = async {
            match self.config.task_timeout {
                Some(limit) => match tokio::time::timeout(limit, self.runner.run(task)).await {
                    Ok(result) => Outcome::Done(result),
                    Err(_) => Outcome::Deadline,
                },
                None => Outcome::Done(self.runner.run(task).await),
            }
        };
        tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown) => Outcome::Interrupted,
            outcome = run => outcome,
        }
    }

    async fn fail(&self, task: &Task, comment: &str) -> Result<()> {
        self.settle(self.queue.set_task_error(task, comment).await)
            .map(|_| ())
    }

    /// Interpret a lease update. Returns whether the update applied.
    ///
    /// A task moved out of `Running` behind our back (an operator requeue)
    /// is logged and skipped.
    fn settle(&self, outcome: Result<()>) -> Result<bool> {
        match outcome {
            Ok(()) => Ok(true),
            Err(Error::Task(e @ (TaskError::InvalidTransition { .. } | TaskError::NotFound { .. }))) => {
                warn!(error = %e, "Lease changed while the task was running");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

/// Resolves once the flag flips to `true`; never if the sender goes away.
pub async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use super::*;
    use crate::artifacts::{ArtifactStore, MultiStore};
    use crate::error::{ArtifactError, SimulationError};
    use crate::sim::{CropSeason, SimulationInput, SimulationOutput, Simulator, UniformSoil};
    use crate::sim::weather::CsvWeatherSource;
    use crate::store::SqlCropCalendar;
    use crate::worker::runner::Collaborators;
    use crate::worker::runner::tests::{Fixture, add_cell, fixture};
    use crate::worker::state::TaskStatus;

    fn config(max: usize) -> WorkerConfig {
        WorkerConfig {
            max_tasks_per_worker: max,
            ..WorkerConfig::default()
        }
    }

    /// Sink that keeps results in memory.
    #[derive(Default)]
    struct MemorySink(Mutex<Vec<SimulationResult>>);

    #[async_trait]
    impl ArtifactSink for MemorySink {
        async fn write(&self, result: &SimulationResult) -> std::result::Result<(), ArtifactError> {
            self.0.lock().await.push(result.clone());
            Ok(())
        }
    }

    /// Simulator that sleeps long enough to trip deadlines and interrupts.
    struct SlowSimulator;

    impl Simulator for SlowSimulator {
        fn run(&self, _input: &SimulationInput) -> std::result::Result<SimulationOutput, SimulationError> {
            std::thread::sleep(Duration::from_millis(500));
            Err(SimulationError::Model("too slow".into()))
        }
    }

    fn slow_runner(fx: &Fixture) -> Arc<TaskRunner> {
        let catalog = fx.runner.catalog().clone();
        Arc::new(TaskRunner::new(
            catalog.clone(),
            Collaborators {
                calendar: Arc::new(SqlCropCalendar::new(catalog)),
                weather: Arc::new(CsvWeatherSource::new(fx.weather_dir.path())),
                soil: Arc::new(UniformSoil::default()),
                simulator: Arc::new(SlowSimulator),
            },
        ))
    }

    #[tokio::test]
    async fn drains_queue_and_classifies_failures() {
        let fx = fixture().await;
        add_cell(&fx, 1, 0.25, 10.25, true).await;
        add_cell(&fx, 2, 0.75, 10.25, false).await;
        add_cell(&fx, 3, 1.25, 10.25, true).await;
        let sink = Arc::new(MemorySink::default());
        let (_tx, rx) = watch::channel(false);

        let report = WorkerLoop::new(
            fx.queue.clone(),
            Arc::new(fx.runner.clone()),
            sink.clone(),
            config(10),
            rx,
        )
        .run()
        .await
        .unwrap();

        assert_eq!(report.exit, WorkerExit::QueueDrained);
        assert_eq!((report.claimed, report.finished, report.failed), (3, 2, 1));
        let written: Vec<i64> = sink.0.lock().await.iter().map(|r| r.task_id).collect();
        assert_eq!(written, vec![1, 3]);

        let failed = fx.queue.get_task_by_id(2).await.unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Error);
        assert_eq!(failed.comment.as_deref(), Some("No weather data"));
        let done = fx.queue.get_task_by_id(3).await.unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Finished);
    }

    #[tokio::test]
    async fn stops_at_task_limit() {
        let fx = fixture().await;
        for id in 1..=3 {
            add_cell(&fx, id, id as f64 + 0.25, 10.25, false).await;
        }
        let (_tx, rx) = watch::channel(false);
        let report = WorkerLoop::new(
            fx.queue.clone(),
            Arc::new(fx.runner.clone()),
            Arc::new(MemorySink::default()),
            config(2),
            rx,
        )
        .run()
        .await
        .unwrap();

        assert_eq!(report.exit, WorkerExit::TaskLimitReached);
        assert_eq!(report.claimed, 2);
        assert_eq!(fx.queue.count_by_status(TaskStatus::Pending).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn writes_into_rotating_store() {
        let fx = fixture().await;
        add_cell(&fx, 7, 0.25, 10.25, true).await;
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Mutex::new(ArtifactStore::open(dir.path(), 100).await.unwrap()));
        let (_tx, rx) = watch::channel(false);

        WorkerLoop::new(
            fx.queue.clone(),
            Arc::new(fx.runner.clone()),
            store.clone(),
            config(10),
            rx,
        )
        .run()
        .await
        .unwrap();
        store.lock().await.close().await.unwrap();

        let mut multi = MultiStore::open(dir.path(), None).await.unwrap();
        let result = multi.get_result(7).await.unwrap().unwrap();
        assert_eq!(result.years.len(), 3);
    }

    #[tokio::test]
    async fn deadline_marks_task_and_exits() {
        let fx = fixture().await;
        add_cell(&fx, 1, 0.25, 10.25, true).await;
        add_cell(&fx, 2, 0.75, 10.25, true).await;
        let (_tx, rx) = watch::channel(false);
        let config = WorkerConfig {
            task_timeout: Some(Duration::from_millis(50)),
            ..config(10)
        };

        let report = WorkerLoop::new(
            fx.queue.clone(),
            slow_runner(&fx),
            Arc::new(MemorySink::default()),
            config,
            rx,
        )
        .run()
        .await
        .unwrap();

        assert_eq!(report.exit, WorkerExit::DeadlineExceeded);
        assert_eq!(report.exit.exit_code(), 3);
        let task = fx.queue.get_task_by_id(1).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Error);
        assert_eq!(task.comment.as_deref(), Some(COMMENT_DEADLINE));
        assert_eq!(fx.queue.count_by_status(TaskStatus::Pending).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn interrupt_marks_running_task() {
        let fx = fixture().await;
        add_cell(&fx, 1, 0.25, 10.25, true).await;
        let (tx, rx) = watch::channel(false);
        let worker = WorkerLoop::new(
            fx.queue.clone(),
            slow_runner(&fx),
            Arc::new(MemorySink::default()),
            config(10),
            rx,
        );
        let handle = tokio::spawn(worker.run());
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.exit, WorkerExit::Interrupted);
        assert_eq!(report.exit.exit_code(), 130);
        let task = fx.queue.get_task_by_id(1).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Error);
        assert_eq!(task.comment.as_deref(), Some(COMMENT_INTERRUPTED));
    }

    #[tokio::test]
    async fn unknown_crop_gets_general_comment() {
        let fx = fixture().await;
        fx.queue
            .enqueue(&[crate::store::NewTask {
                task_id: 1,
                crop_no: 42,
                longitude: 0.25,
                latitude: 0.25,
                tsum1: Some(1.0),
                tsum2: Some(1.0),
            }])
            .await
            .unwrap();
        fx.runner
            .catalog()
            .put_season(
                42,
                0.25,
                0.25,
                CropSeason {
                    start_doy: 1,
                    end_doy: 100,
                },
            )
            .await
            .unwrap();
        let (_tx, rx) = watch::channel(false);
        WorkerLoop::new(
            fx.queue.clone(),
            Arc::new(fx.runner.clone()),
            Arc::new(MemorySink::default()),
            config(10),
            rx,
        )
        .run()
        .await
        .unwrap();
        let task = fx.queue.get_task_by_id(1).await.unwrap().unwrap();
        assert_eq!(task.comment.as_deref(), Some(COMMENT_GENERAL));
    }
}
