//! Consolidation of finished results into per-variable raster files.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::artifacts::MultiStore;
use crate::error::{Error, RasterError, Result};
use crate::naming::OutputNaming;
use crate::raster::{ConversionRegistry, GridMapper, RasterAggregator, RasterMode};
use crate::store::{Catalog, TaskQueue};

/// Counters from one consolidation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsolidationReport {
    /// Finished tasks considered.
    pub tasks: usize,
    /// Finished tasks with no stored result.
    pub missing: usize,
    /// Results that could not be placed on the grid.
    pub skipped: usize,
    /// (task, year) pairs written into the cubes.
    pub cells: usize,
    pub files: Vec<PathBuf>,
}

/// Builds the raster outputs of a crop from the artifact stores.
pub struct OutputConverter {
    queue: TaskQueue,
    catalog: Catalog,
    registry: ConversionRegistry,
    grid: Arc<dyn GridMapper>,
    naming: OutputNaming,
    results_dir: PathBuf,
}

impl OutputConverter {
    pub fn new(
        queue: TaskQueue,
        catalog: Catalog,
        registry: ConversionRegistry,
        grid: Arc<dyn GridMapper>,
        naming: OutputNaming,
        results_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            queue,
            catalog,
            registry,
            grid,
            naming,
            results_dir: results_dir.into(),
        }
    }

    /// Write one raster file per registry variable for `crop_no`.
    ///
    /// Every Finished task is looked up in `stores`; tasks without a
    /// stored result are logged and skipped. Years outside the naming
    /// range are ignored.
    pub async fn consolidate(&self, stores: &mut MultiStore, crop_no: i64) -> Result<ConsolidationReport> {
        let crop = self.catalog.crop_info(crop_no).await?;
        tokio::fs::create_dir_all(&self.results_dir).await?;

        let pattern = self.naming.raster_pattern(&crop.label, &crop.mgmt_code);
        let names = self.registry.names();
        let mut aggregator = RasterAggregator::open(
            RasterMode::Write,
            &self.results_dir,
            &pattern,
            &names,
            self.naming.start_year,
            self.naming.end_year,
            self.grid.clone(),
        )?;
        for spec in self.registry.variables() {
            aggregator.writeheader(
                &spec.name,
                &format!("{}_{}", spec.name, crop.label),
                &spec.long_name,
                &spec.units,
            )?;
        }

        let task_ids = self.queue.finished_task_ids(crop_no).await?;
        let mut report = ConsolidationReport {
            tasks: task_ids.len(),
            ..ConsolidationReport::default()
        };
        info!(crop_no, tasks = task_ids.len(), stores = stores.len(), "Consolidating");

        for task_id in task_ids {
            let result = match stores.get_result(task_id).await {
                Ok(Some(result)) => result,
                Ok(None) => {
                    warn!(task_id, "No stored result for finished task");
                    report.missing += 1;
                    continue;
                }
                Err(e) => {
                    warn!(task_id, error = %e, "Stored result unreadable");
                    report.missing += 1;
                    continue;
                }
            };

            for year in &result.years {
                if year.year < self.naming.start_year || year.year > self.naming.end_year {
                    continue;
                }
                let year_index = (year.year - self.naming.start_year) as usize;
                let values = self.registry.convert_all(&year.summary);
                match aggregator.set_data(year_index, result.longitude, result.latitude, &values) {
                    Ok(()) => report.cells += 1,
                    Err(e @ RasterError::OutsideGrid { .. }) => {
                        warn!(task_id, error = %e, "Result skipped");
                        report.skipped += 1;
                        break;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        report.files = aggregator.paths().into_values().map(PathBuf::from).collect();
        let nrows = self.grid.nrows();
        tokio::task::spawn_blocking(move || -> std::result::Result<(), RasterError> {
            for _ in 0..nrows {
                aggregator.writenext()?;
            }
            aggregator.close()
        })
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))??;

        info!(
            crop_no,
            cells = report.cells,
            missing = report.missing,
            skipped = report.skipped,
            files = report.files.len(),
            "Consolidation complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::NaiveDate;

    use super::*;
    use crate::artifacts::{ArtifactStore, SimulationResult, YearResult};
    use crate::raster::file::read_cube;
    use crate::raster::{GridFootprint, RegularGrid};
    use crate::sim::SummaryValue;
    use crate::store::{CropInfo, Db, NewTask};

    fn year(year: i32, twso: f64) -> YearResult {
        let mut summary = BTreeMap::new();
        summary.insert("TWSO".to_string(), SummaryValue::Number(twso));
        summary.insert(
            "DOS".to_string(),
            SummaryValue::Date(NaiveDate::from_ymd_opt(year, 4, 1).unwrap()),
        );
        YearResult {
            year,
            summary,
            series: Vec::new(),
        }
    }

    #[tokio::test]
    async fn places_yearly_values_and_skips_missing() {
        let db = Arc::new(Db::open_memory().await.unwrap());
        let queue = TaskQueue::with_identity(db.clone(), "h", 1);
        let catalog = Catalog::new(db);
        catalog
            .put_crop(&CropInfo {
                crop_no: 3,
                crop_name: "maize".into(),
                label: "mai".into(),
                mgmt_code: "rf".into(),
            })
            .await
            .unwrap();
        let cells = [(1, 0.5, 1.5), (2, 1.5, 0.5)];
        let tasks: Vec<NewTask> = cells
            .iter()
            .map(|&(task_id, longitude, latitude)| NewTask {
                task_id,
                crop_no: 3,
                longitude,
                latitude,
                tsum1: None,
                tsum2: None,
            })
            .collect();
        queue.enqueue(&tasks).await.unwrap();
        for _ in 0..2 {
            let task = queue.get_task().await.unwrap().unwrap();
            queue.set_task_finished(&task).await.unwrap();
        }

        let store_dir = tempfile::tempdir().unwrap();
        let mut store = ArtifactStore::open(store_dir.path(), 10).await.unwrap();
        store
            .put_result(&SimulationResult {
                task_id: 1,
                crop_no: 3,
                longitude: 0.5,
                latitude: 1.5,
                years: vec![year(2000, 5000.0), year(2001, 7000.0), year(1990, 1.0)],
            })
            .await
            .unwrap();
        store.close().await.unwrap();

        let footprint = GridFootprint {
            nrows: 2,
            ncols: 2,
            xll: 0.0,
            yll: 0.0,
            cellsize: 1.0,
            nodata: 1e20,
        };
        let naming = OutputNaming {
            start_year: 2000,
            end_year: 2001,
            ..OutputNaming::default()
        };
        let results = tempfile::tempdir().unwrap();
        let converter = OutputConverter::new(
            queue,
            catalog,
            ConversionRegistry::with_defaults(footprint.nodata),
            Arc::new(RegularGrid::new(footprint)),
            naming.clone(),
            results.path(),
        );
        let mut stores = MultiStore::open(store_dir.path(), None).await.unwrap();

        let report = converter.consolidate(&mut stores, 3).await.unwrap();
        assert_eq!(report.tasks, 2);
        assert_eq!(report.missing, 1);
        assert_eq!(report.cells, 2);
        assert_eq!(report.files.len(), 7);

        let path = results.path().join(naming.raster_file_name("yield", "mai", "rf"));
        let (header, data) = read_cube(&path).unwrap();
        assert_eq!(header.variable, "yield_mai");
        assert_eq!(header.nbands, 2);
        // band-major, row 0 is the northern row
        let expected = [5.0, 1e20, 1e20, 1e20, 7.0, 1e20, 1e20, 1e20];
        assert_eq!(data.len(), expected.len());
        for (got, want) in data.iter().zip(expected) {
            assert!((got - want).abs() <= want.abs() * 1e-9, "{data:?}");
        }
    }
}
