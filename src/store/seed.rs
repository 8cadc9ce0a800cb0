//! Filling the task list for a crop.

use tracing::info;

use crate::error::DatabaseError;
use crate::raster::{GridMapper, RegularGrid};
use crate::sim::CropCalendar;
use crate::store::catalog::Catalog;
use crate::store::model::NewTask;
use crate::store::tasks::{TaskQueue, cell_key};

/// Counts reported by [`seed_tasks`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub enqueued: usize,
    pub off_land: usize,
    pub no_season: usize,
    pub existing: usize,
}

/// Enqueue one `Pending` task per land cell with a valid season.
///
/// Cells are visited north to south, west to east. Cells that already
/// have a task for the crop are left alone, so seeding can be re-run.
/// TSUM1 and TSUM2 are half the cell's stored temperature sum each, or
/// absent when the cell has no aggregate.
pub async fn seed_tasks(
    queue: &TaskQueue,
    catalog: &Catalog,
    calendar: &dyn CropCalendar,
    grid: &RegularGrid,
    crop_no: i64,
) -> Result<SeedReport, DatabaseError> {
    let existing = queue.task_cells(crop_no).await?;
    let mut next_id = queue.next_task_id().await?;
    let mut report = SeedReport::default();
    let mut batch = Vec::new();

    for row in 0..grid.nrows() {
        for col in 0..grid.ncols() {
            let (lon, lat) = grid.cell_center(row, col);
            let Some(season) = calendar.season(crop_no, lon, lat).await? else {
                report.off_land += 1;
                continue;
            };
            if !season.is_valid() {
                report.no_season += 1;
                continue;
            }
            if existing.contains(&cell_key(lon, lat)) {
                report.existing += 1;
                continue;
            }
            let half = catalog
                .tsum(crop_no, lon, lat)
                .await?
                .and_then(|t| t.average)
                .map(|avg| avg / 2.0);
            batch.push(NewTask {
                task_id: next_id,
                crop_no,
                longitude: lon,
                latitude: lat,
                tsum1: half,
                tsum2: half,
            });
            next_id += 1;
        }
    }

    report.enqueued = queue.enqueue(&batch).await?;
    info!(
        crop_no,
        enqueued = report.enqueued,
        off_land = report.off_land,
        no_season = report.no_season,
        existing = report.existing,
        "Task list seeded"
    );
    Ok(report)
}
