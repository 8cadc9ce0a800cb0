//! Crash-resumable sweep over every grid cell of a crop.
//!
//! There is no lease here: progress is read back from the `tsum` table.
//! Rows are visited north to south and cells west to east, so the
//! southernmost stored row and the easternmost stored cell on it tell a
//! restarted scanner where to pick up. Two scanners restarted at the same
//! time may both redo part of that boundary row; the upsert makes the
//! duplicate writes harmless.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::raster::{GridMapper, RegularGrid};
use crate::sim::CropParameters;
use crate::store::{ResumptionPoint, TsumRecord};
use crate::worker::runner::{DEFAULT_TBASE, TaskRunner};

/// Phase sums large enough that the crop never matures inside its season,
/// so thermal time accumulates over the whole window.
const SCAN_TSUM: f64 = 1.0e6;

/// Counters from one scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Cells already covered by an earlier run.
    pub resumed: usize,
    pub off_land: usize,
    pub no_season: usize,
    pub failed: usize,
    pub persisted: usize,
    pub interrupted: bool,
}

/// Visits every land cell of a crop once and stores its aggregate.
pub struct GridScanner {
    runner: Arc<TaskRunner>,
    grid: RegularGrid,
    field: String,
}

impl GridScanner {
    pub fn new(runner: Arc<TaskRunner>, grid: RegularGrid, field: impl Into<String>) -> Self {
        Self {
            runner,
            grid,
            field: field.into(),
        }
    }

    /// Sweep the grid for `crop_no`, starting after the stored resumption point.
    ///
    /// Cells whose simulation fails are logged and left without a record.
    /// Stops between cells once `shutdown` flips.
    pub async fn scan(&self, crop_no: i64, shutdown: &watch::Receiver<bool>) -> Result<ScanReport> {
        let catalog = self.runner.catalog();
        let crop = catalog.crop_info(crop_no).await?;
        let resume = catalog.resumption_point(crop_no).await?;
        let params = CropParameters {
            crop_no,
            crop_name: crop.crop_name,
            tsum1: SCAN_TSUM,
            tsum2: SCAN_TSUM,
            tbase: DEFAULT_TBASE,
        };
        info!(crop_no, ?resume, field = %self.field, "Grid scan started");

        let mut report = ScanReport::default();
        for row in 0..self.grid.nrows() {
            let (_, lat) = self.grid.cell_center(row, 0);
            if resume.is_some_and(|r| lat > r.min_lat + ResumptionPoint::EPS) {
                report.resumed += self.grid.ncols();
                continue;
            }
            for col in 0..self.grid.ncols() {
                if *shutdown.borrow() {
                    report.interrupted = true;
                    info!(crop_no, ?report, "Grid scan interrupted");
                    return Ok(report);
                }
                let (lon, lat) = self.grid.cell_center(row, col);
                if resume.is_some_and(|r| r.covers(lon, lat)) {
                    report.resumed += 1;
                    continue;
                }
                self.visit(&params, lon, lat, &mut report).await?;
            }
        }

        info!(crop_no, ?report, "Grid scan complete");
        Ok(report)
    }

    async fn visit(
        &self,
        params: &CropParameters,
        lon: f64,
        lat: f64,
        report: &mut ScanReport,
    ) -> Result<()> {
        let Some(season) = self.runner.calendar().season(params.crop_no, lon, lat).await? else {
            report.off_land += 1;
            return Ok(());
        };
        if !season.is_valid() {
            report.no_season += 1;
            return Ok(());
        }

        let years = match self.runner.simulate_cell(params.clone(), lon, lat, season).await {
            Ok(years) => years,
            Err(e) => {
                warn!(lon, lat, error = %e, "Cell skipped");
                report.failed += 1;
                return Ok(());
            }
        };
        let observations: Vec<f64> = years
            .iter()
            .filter_map(|y| y.summary.get(&self.field).and_then(|v| v.as_f64()))
            .collect();
        let record = TsumRecord::from_observations(params.crop_no, lon, lat, &observations);
        debug!(lon, lat, numobs = record.numobs, average = ?record.average, "Cell aggregated");
        self.runner.catalog().upsert_tsum(&record).await?;
        report.persisted += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::error::DatabaseError;
    use crate::raster::GridFootprint;
    use crate::sim::{CropCalendar, CropSeason, PhenologyModel, UniformSoil};
    use crate::sim::weather::CsvWeatherSource;
    use crate::store::{Catalog, CropInfo, Db};
    use crate::worker::runner::Collaborators;
    use crate::worker::runner::tests::write_weather;

    /// Calendar recording every cell it is asked about; all cells are off land.
    #[derive(Default)]
    struct RecordingCalendar(Mutex<Vec<(f64, f64)>>);

    #[async_trait]
    impl CropCalendar for RecordingCalendar {
        async fn season(&self, _crop_no: i64, lon: f64, lat: f64) -> std::result::Result<Option<CropSeason>, DatabaseError> {
            self.0.lock().unwrap().push((lon, lat));
            Ok(None)
        }
    }

    /// Cell centres at longitudes 0..=7 and latitudes 12 down to 8.
    fn grid() -> RegularGrid {
        RegularGrid::new(GridFootprint {
            nrows: 5,
            ncols: 8,
            xll: -0.5,
            yll: 7.5,
            cellsize: 1.0,
            nodata: 1e20,
        })
    }

    async fn catalog() -> (Catalog, tempfile::TempDir) {
        let catalog = Catalog::new(Arc::new(Db::open_memory().await.unwrap()));
        catalog
            .put_crop(&CropInfo {
                crop_no: 3,
                crop_name: "maize".into(),
                label: "mai".into(),
                mgmt_code: "rf".into(),
            })
            .await
            .unwrap();
        (catalog, tempfile::tempdir().unwrap())
    }

    fn runner(catalog: Catalog, calendar: Arc<dyn CropCalendar>, weather: &std::path::Path) -> Arc<TaskRunner> {
        Arc::new(TaskRunner::new(
            catalog,
            Collaborators {
                calendar,
                weather: Arc::new(CsvWeatherSource::new(weather)),
                soil: Arc::new(UniformSoil::default()),
                simulator: Arc::new(PhenologyModel),
            },
        ))
    }

    #[tokio::test]
    async fn resumes_after_stored_point() {
        let (catalog, weather) = catalog().await;
        for (lon, lat) in [(3.0, 12.0), (7.0, 11.0), (2.0, 10.0), (5.0, 10.0)] {
            catalog
                .upsert_tsum(&TsumRecord::from_observations(3, lon, lat, &[1.0]))
                .await
                .unwrap();
        }
        let calendar = Arc::new(RecordingCalendar::default());
        let scanner = GridScanner::new(runner(catalog, calendar.clone(), weather.path()), grid(), "TSUM");
        let (_tx, rx) = watch::channel(false);

        let report = scanner.scan(3, &rx).await.unwrap();

        let visited = calendar.0.lock().unwrap().clone();
        let mut expected = vec![(6.0, 10.0), (7.0, 10.0)];
        for lat in [9.0, 8.0] {
            expected.extend((0..8).map(|lon| (lon as f64, lat)));
        }
        assert_eq!(visited, expected);
        assert_eq!(report.resumed, 40 - 18);
        assert_eq!(report.off_land, 18);
    }

    #[tokio::test]
    async fn persists_aggregate_per_land_cell() {
        let (catalog, weather) = catalog().await;
        let season = CropSeason {
            start_doy: 91,
            end_doy: 273,
        };
        catalog.put_season(3, 1.0, 9.0, season).await.unwrap();
        catalog.put_season(3, 2.0, 9.0, season).await.unwrap();
        catalog
            .put_season(
                3,
                3.0,
                9.0,
                CropSeason {
                    start_doy: crate::sim::NO_SEASON_DOY,
                    end_doy: crate::sim::NO_SEASON_DOY,
                },
            )
            .await
            .unwrap();
        write_weather(weather.path(), 1.0, 9.0, 2000, 3);
        let calendar = Arc::new(crate::store::SqlCropCalendar::new(catalog.clone()));
        let scanner = GridScanner::new(runner(catalog.clone(), calendar, weather.path()), grid(), "TSUM");
        let (_tx, rx) = watch::channel(false);

        let report = scanner.scan(3, &rx).await.unwrap();
        assert_eq!(report.persisted, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.no_season, 1);

        let stored = catalog.tsum(3, 1.0, 9.0).await.unwrap().unwrap();
        assert_eq!(stored.numobs, 3);
        // 183 days at 15 °C over base 0
        let average = stored.average.unwrap();
        assert!((average - 183.0 * 15.0).abs() < 1e-6, "average = {average}");

        // A second run resumes past the stored cell and adds nothing new.
        let again = scanner.scan(3, &rx).await.unwrap();
        assert_eq!(again.persisted, 0);
        assert_eq!(catalog.tsum_count(3).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn stops_between_cells_on_shutdown() {
        let (catalog, weather) = catalog().await;
        let calendar = Arc::new(RecordingCalendar::default());
        let scanner = GridScanner::new(runner(catalog, calendar.clone(), weather.path()), grid(), "TSUM");
        let (_tx, rx) = watch::channel(true);
        let report = scanner.scan(3, &rx).await.unwrap();
        assert!(report.interrupted);
        assert!(calendar.0.lock().unwrap().is_empty());
    }
}
