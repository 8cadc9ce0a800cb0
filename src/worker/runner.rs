//! Running the simulator for one task or one grid cell.

use std::sync::Arc;

use tracing::debug;

use crate::artifacts::{SimulationResult, YearResult};
use crate::error::{Result, SimulationError};
use crate::sim::{
    CropCalendar, CropParameters, CropSeason, SimulationInput, Simulator, Site, SoilSource,
    TimerData, WeatherSource, available_years,
};
use crate::store::{Catalog, Task};

/// Base temperature for thermal time, °C.
pub const DEFAULT_TBASE: f64 = 0.0;

/// External collaborators needed to run a simulation.
#[derive(Clone)]
pub struct Collaborators {
    pub calendar: Arc<dyn CropCalendar>,
    pub weather: Arc<dyn WeatherSource>,
    pub soil: Arc<dyn SoilSource>,
    pub simulator: Arc<dyn Simulator>,
}

/// Turns a task into a [`SimulationResult`].
#[derive(Clone)]
pub struct TaskRunner {
    catalog: Catalog,
    deps: Collaborators,
}

impl TaskRunner {
    pub fn new(catalog: Catalog, deps: Collaborators) -> Self {
        Self { catalog, deps }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn calendar(&self) -> &Arc<dyn CropCalendar> {
        &self.deps.calendar
    }

    /// Simulate every available year for a task.
    ///
    /// Fails with a [`SimulationError`] when inputs are missing or no year
    /// produced output; database failures pass through unchanged.
    pub async fn run(&self, task: &Task) -> Result<SimulationResult> {
        let crop = self.catalog.crop_info(task.crop_no).await?;
        let (Some(tsum1), Some(tsum2)) = (task.tsum1, task.tsum2) else {
            return Err(SimulationError::MissingCropParameter("TSUM1, TSUM2".into()).into());
        };
        let season = match self
            .deps
            .calendar
            .season(task.crop_no, task.longitude, task.latitude)
            .await?
        {
            Some(season) if season.is_valid() => season,
            _ => {
                return Err(SimulationError::NoSeason {
                    lon: task.longitude,
                    lat: task.latitude,
                }
                .into());
            }
        };

        let params = CropParameters {
            crop_no: crop.crop_no,
            crop_name: crop.crop_name,
            tsum1,
            tsum2,
            tbase: DEFAULT_TBASE,
        };
        let years = self
            .simulate_cell(params, task.longitude, task.latitude, season)
            .await?;
        if years.is_empty() {
            return Err(SimulationError::InsufficientOutput {
                crop_no: task.crop_no,
                lon: task.longitude,
                lat: task.latitude,
            }
            .into());
        }

        Ok(SimulationResult {
            task_id: task.task_id,
            crop_no: task.crop_no,
            longitude: task.longitude,
            latitude: task.latitude,
            years,
        })
    }

    /// Run the simulator for each campaign that fits in the weather record.
    ///
    /// Years whose season falls outside the record, or that produce no step
    /// or summary output, are left out.
    pub async fn simulate_cell(
        &self,
        crop: CropParameters,
        longitude: f64,
        latitude: f64,
        season: CropSeason,
    ) -> std::result::Result<Vec<YearResult>, SimulationError> {
        let soil = self.deps.soil.soil(longitude, latitude).await?;
        let weather = self.deps.weather.open(longitude, latitude).await?;
        let (first, last) = (weather.first_date(), weather.last_date());

        let mut years = Vec::new();
        for year in available_years(first, last) {
            let Some(timer) = TimerData::for_season(year, season) else {
                continue;
            };
            if !timer.within(first, last) {
                debug!(year, lon = longitude, lat = latitude, "Season outside weather record");
                continue;
            }
            let input = SimulationInput {
                site: Site {
                    longitude,
                    latitude,
                },
                timer,
                soil,
                crop: crop.clone(),
                weather: weather.clone(),
            };
            let simulator = self.deps.simulator.clone();
            let output = tokio::task::spawn_blocking(move || simulator.run(&input))
                .await
                .map_err(|e| SimulationError::Model(format!("simulator task failed: {e}")))??;
            if output.is_complete() {
                years.push(YearResult {
                    year: timer.campaign_year,
                    summary: output.summary,
                    series: output.steps,
                });
            } else {
                debug!(year, lon = longitude, lat = latitude, "Simulator produced no output");
            }
        }
        Ok(years)
    }
}
