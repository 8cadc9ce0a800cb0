//! Persistence layer: the shared libSQL task database.
//!
//! - `db`: connection handle, pragmas, busy retry
//! - `migrations`: versioned schema
//! - `tasks`: [`TaskQueue`] leasing protocol
//! - `catalog`: crop tables, per-cell aggregates, crop calendar
//! - `seed`: filling the task list

pub mod calendar;
pub mod catalog;
pub mod db;
pub mod migrations;
pub mod model;
pub mod seed;
pub mod tasks;

pub use calendar::SqlCropCalendar;
pub use catalog::Catalog;
pub use db::Db;
pub use model::{CropInfo, NewTask, ResumptionPoint, Task, TsumRecord};
pub use seed::{SeedReport, seed_tasks};
pub use tasks::TaskQueue;
