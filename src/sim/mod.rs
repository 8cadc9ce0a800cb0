//! Collaborator seams around the crop simulator.
//!
//! The worker only sees these traits. Bundled implementations:
//! - [`phenology::PhenologyModel`]: thermal-time crop model
//! - [`weather::CsvWeatherSource`]: one CSV file per grid cell
//! - [`UniformSoil`]: the same soil everywhere
//!
//! The crop calendar lives with the database (`store::calendar`).

pub mod phenology;
pub mod weather;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::{DatabaseError, SimulationError};

pub use phenology::PhenologyModel;
pub use weather::CsvWeatherSource;

/// Day-of-year sentinel meaning "no valid growing season".
pub const NO_SEASON_DOY: i32 = -99;

/// Growing season of a crop at one cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropSeason {
    pub start_doy: i32,
    pub end_doy: i32,
}

impl CropSeason {
    /// False when either bound carries the no-season sentinel.
    pub fn is_valid(&self) -> bool {
        self.start_doy != NO_SEASON_DOY && self.end_doy != NO_SEASON_DOY
    }
}

/// Crop calendar lookup.
///
/// `Ok(None)` means the cell is outside the land mask.
#[async_trait]
pub trait CropCalendar: Send + Sync {
    async fn season(
        &self,
        crop_no: i64,
        longitude: f64,
        latitude: f64,
    ) -> Result<Option<CropSeason>, DatabaseError>;
}

/// One day of weather.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DailyWeather {
    pub day: NaiveDate,
    /// Minimum temperature, °C.
    pub tmin: f64,
    /// Maximum temperature, °C.
    pub tmax: f64,
    /// Precipitation, mm.
    pub rain: f64,
}

impl DailyWeather {
    pub fn tavg(&self) -> f64 {
        (self.tmin + self.tmax) / 2.0
    }
}

/// Daily weather for one cell.
pub trait WeatherSeries: Send + Sync + fmt::Debug {
    fn first_date(&self) -> NaiveDate;
    fn last_date(&self) -> NaiveDate;
    fn day(&self, day: NaiveDate) -> Option<DailyWeather>;
}

/// Provider of per-cell weather series.
#[async_trait]
pub trait WeatherSource: Send + Sync {
    /// Load the series for a cell; fails with `MissingWeather` if absent.
    async fn open(&self, longitude: f64, latitude: f64) -> Result<Arc<dyn WeatherSeries>, SimulationError>;
}

/// Soil water parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SoilParameters {
    /// Plant-available water at field capacity over the rooting depth, mm.
    pub max_water: f64,
}

/// Provider of per-cell soil parameters.
#[async_trait]
pub trait SoilSource: Send + Sync {
    async fn soil(&self, longitude: f64, latitude: f64) -> Result<SoilParameters, SimulationError>;
}

/// The same soil at every cell.
#[derive(Debug, Clone, Copy)]
pub struct UniformSoil(pub SoilParameters);

impl Default for UniformSoil {
    fn default() -> Self {
        Self(SoilParameters { max_water: 150.0 })
    }
}

#[async_trait]
impl SoilSource for UniformSoil {
    async fn soil(&self, _longitude: f64, _latitude: f64) -> Result<SoilParameters, SimulationError> {
        Ok(self.0)
    }
}

/// Crop parameters for one simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CropParameters {
    pub crop_no: i64,
    pub crop_name: String,
    /// Temperature sum from sowing to anthesis, °C·d.
    pub tsum1: f64,
    /// Temperature sum from anthesis to maturity, °C·d.
    pub tsum2: f64,
    /// Base temperature for thermal time, °C.
    pub tbase: f64,
}

/// Site of one simulation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub longitude: f64,
    pub latitude: f64,
}

/// Start and end of one campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerData {
    pub campaign_year: i32,
    /// Sowing date.
    pub crop_start_date: NaiveDate,
    /// Latest harvest date.
    pub crop_end_date: NaiveDate,
}

impl TimerData {
    /// Campaign dates for a season starting in `year`.
    ///
    /// A season whose end day-of-year precedes its start wraps into the
    /// following year. Returns `None` for invalid seasons.
    pub fn for_season(year: i32, season: CropSeason) -> Option<Self> {
        if !season.is_valid() || season.start_doy < 1 || season.end_doy < 1 {
            return None;
        }
        let start = NaiveDate::from_yo_opt(year, season.start_doy as u32)?;
        let end_year = if season.end_doy >= season.start_doy {
            year
        } else {
            year + 1
        };
        let end = NaiveDate::from_yo_opt(end_year, season.end_doy as u32)?;
        Some(Self {
            campaign_year: year,
            crop_start_date: start,
            crop_end_date: end,
        })
    }

    /// Whether the whole campaign lies within the weather record.
    pub fn within(&self, first: NaiveDate, last: NaiveDate) -> bool {
        self.crop_start_date >= first && self.crop_end_date <= last
    }
}

/// Complete calendar years covered by a weather record, inclusive.
///
/// A record starting after January 1st skips its first year; one ending
/// before December 31st skips its last.
pub fn available_years(first: NaiveDate, last: NaiveDate) -> Vec<i32> {
    let start = if first.ordinal() == 1 {
        first.year()
    } else {
        first.year() + 1
    };
    let end = if (last + Duration::days(1)).year() != last.year() {
        last.year()
    } else {
        last.year() - 1
    };
    (start..=end).collect()
}

/// A summary field: a number or a date.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SummaryValue {
    Number(f64),
    Date(NaiveDate),
}

impl SummaryValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(v) => Some(*v),
            Self::Date(_) => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Self::Date(d) => Some(*d),
            Self::Number(_) => None,
        }
    }
}

/// Named summary fields of one campaign.
pub type Summary = BTreeMap<String, SummaryValue>;

/// State of the crop at the end of one simulated day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub day: NaiveDate,
    #[serde(flatten)]
    pub values: BTreeMap<String, f64>,
}

/// What the simulator returns for one campaign.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimulationOutput {
    pub steps: Vec<StepRecord>,
    pub summary: Summary,
}

impl SimulationOutput {
    /// Both step and summary output are present.
    pub fn is_complete(&self) -> bool {
        !self.steps.is_empty() && !self.summary.is_empty()
    }
}

/// Everything the simulator consumes for one campaign.
#[derive(Debug, Clone)]
pub struct SimulationInput {
    pub site: Site,
    pub timer: TimerData,
    pub soil: SoilParameters,
    pub crop: CropParameters,
    pub weather: Arc<dyn WeatherSeries>,
}

/// The crop growth model.
///
/// `run` is CPU-bound and synchronous; callers move it off the async
/// runtime with `spawn_blocking`.
pub trait Simulator: Send + Sync {
    fn run(&self, input: &SimulationInput) -> Result<SimulationOutput, SimulationError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn full_years_only() {
        assert_eq!(
            available_years(date(1979, 1, 1), date(1981, 12, 31)),
            vec![1979, 1980, 1981]
        );
        assert_eq!(
            available_years(date(1979, 1, 2), date(1981, 12, 30)),
            vec![1980]
        );
        assert!(available_years(date(1979, 3, 1), date(1979, 11, 1)).is_empty());
    }

    #[test]
    fn season_wraps_into_next_year() {
        let timer = TimerData::for_season(
            1990,
            CropSeason {
                start_doy: 300,
                end_doy: 150,
            },
        )
        .unwrap();
        assert_eq!(timer.crop_start_date.year(), 1990);
        assert_eq!(timer.crop_end_date.year(), 1991);
    }

    #[test]
    fn sentinel_season_has_no_timer() {
        let season = CropSeason {
            start_doy: NO_SEASON_DOY,
            end_doy: 200,
        };
        assert!(!season.is_valid());
        assert!(TimerData::for_season(1990, season).is_none());
    }

    #[test]
    fn summary_values_are_untagged() {
        let mut summary = Summary::new();
        summary.insert("TWSO".into(), SummaryValue::Number(5000.0));
        summary.insert("DOS".into(), SummaryValue::Date(date(1990, 4, 1)));
        let json = serde_json::to_string(&summary).unwrap();
        assert_eq!(json, r#"{"DOS":"1990-04-01","TWSO":5000.0}"#);
        let back: Summary = serde_json::from_str(&json).unwrap();
        assert_eq!(back, summary);
    }

    #[tokio::test]
    async fn uniform_soil_is_everywhere() {
        let soil = UniformSoil::default();
        assert_eq!(soil.soil(10.0, 20.0).await.unwrap().max_water, 150.0);
    }
}
