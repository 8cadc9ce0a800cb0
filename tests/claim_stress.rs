//! Many concurrent claimers on one database file must never share a task.
//!
//! Each claimer opens its own database handle, the way separate worker
//! processes would.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;

use gridbatch::store::{Db, NewTask, TaskQueue};
use gridbatch::worker::TaskStatus;

const TASKS: i64 = 300;
const CLAIMERS: usize = 8;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_are_unique() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.db");

    let seed = TaskQueue::with_identity(Arc::new(Db::open_local(&path).await.unwrap()), "seed", 0);
    let tasks: Vec<NewTask> = (1..=TASKS)
        .map(|task_id| NewTask {
            task_id,
            crop_no: 1,
            longitude: task_id as f64 * 0.5,
            latitude: 0.25,
            tsum1: Some(1000.0),
            tsum2: Some(1000.0),
        })
        .collect();
    assert_eq!(seed.enqueue(&tasks).await.unwrap(), TASKS as usize);

    let mut queues = Vec::new();
    for i in 0..CLAIMERS {
        let db = Arc::new(Db::open_local(&path).await.unwrap());
        queues.push(TaskQueue::with_identity(db, format!("host-{i}"), i as i64 + 1));
    }

    let handles = queues.into_iter().map(|queue| {
        tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(task) = queue.get_task().await.unwrap() {
                assert_eq!(task.status, TaskStatus::Running);
                assert_eq!(task.hostname.as_deref(), Some(queue.hostname()));
                claimed.push(task.task_id);
                if task.task_id % 2 == 0 {
                    queue.set_task_finished(&task).await.unwrap();
                } else {
                    queue.set_task_error(&task, "odd").await.unwrap();
                }
            }
            claimed
        })
    });

    let mut seen = HashSet::new();
    let mut total = 0;
    for claimed in join_all(handles).await {
        for task_id in claimed.unwrap() {
            total += 1;
            assert!(seen.insert(task_id), "task {task_id} claimed twice");
        }
    }
    assert_eq!(total, TASKS as usize);
    assert_eq!(seen, (1..=TASKS).collect::<HashSet<_>>());

    assert_eq!(seed.count_by_status(TaskStatus::Pending).await.unwrap(), 0);
    assert_eq!(seed.count_by_status(TaskStatus::Running).await.unwrap(), 0);
    assert_eq!(seed.count_by_status(TaskStatus::Finished).await.unwrap(), TASKS / 2);
    assert_eq!(seed.count_by_status(TaskStatus::Error).await.unwrap(), TASKS / 2);
}
