//! Worker system: task execution, grid scanning and process supervision.
//!
//! Core components:
//! - `state`: task lease states (Pending → Running → Finished/Error)
//! - `runner`: simulates one task or cell across its weather years
//! - `worker`: per-process claim/run/record loop
//! - `scanner`: resumable sweep over every grid cell of a crop
//! - `supervisor`: keeps N worker processes alive

pub mod runner;
pub mod scanner;
pub mod state;
pub mod supervisor;
pub mod worker;

pub use runner::{Collaborators, TaskRunner};
pub use scanner::{GridScanner, ScanReport};
pub use state::TaskStatus;
pub use supervisor::{Supervisor, SupervisorReport, WorkerCommand, available_parallelism, worker_count};
pub use worker::{WorkerExit, WorkerLoop, WorkerReport};
