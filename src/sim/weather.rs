//! Per-cell weather from CSV files.
//!
//! Each cell has one file `{lon:.2}_{lat:.2}.csv` with a header line and
//! `date,tmin,tmax,rain` rows, dates as `YYYY-MM-DD`, one row per day.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use tracing::debug;

use crate::error::SimulationError;
use crate::sim::{DailyWeather, WeatherSeries, WeatherSource};

/// Weather files in one directory.
#[derive(Debug, Clone)]
pub struct CsvWeatherSource {
    dir: PathBuf,
}

impl CsvWeatherSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the file for a cell.
    pub fn cell_path(&self, longitude: f64, latitude: f64) -> PathBuf {
        self.dir.join(cell_file_name(longitude, latitude))
    }
}

/// File name for a cell.
pub fn cell_file_name(longitude: f64, latitude: f64) -> String {
    format!("{longitude:.2}_{latitude:.2}.csv")
}

#[async_trait]
impl WeatherSource for CsvWeatherSource {
    async fn open(&self, longitude: f64, latitude: f64) -> Result<Arc<dyn WeatherSeries>, SimulationError> {
        let path = self.cell_path(longitude, latitude);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Weather file unavailable");
                return Err(SimulationError::MissingWeather {
                    lon: longitude,
                    lat: latitude,
                });
            }
        };
        let series = CsvWeatherSeries::parse(&path, &text)?;
        if series.days.is_empty() {
            return Err(SimulationError::MissingWeather {
                lon: longitude,
                lat: latitude,
            });
        }
        Ok(Arc::new(series))
    }
}

/// Daily weather held in memory.
#[derive(Debug, Clone, Default)]
pub struct CsvWeatherSeries {
    days: BTreeMap<NaiveDate, DailyWeather>,
}

impl CsvWeatherSeries {
    /// Build a series from daily records.
    pub fn from_days(days: impl IntoIterator<Item = DailyWeather>) -> Self {
        Self {
            days: days.into_iter().map(|d| (d.day, d)).collect(),
        }
    }

    fn parse(path: &Path, text: &str) -> Result<Self, SimulationError> {
        let bad = |line_no: usize, what: &str| {
            SimulationError::Model(format!("{}:{line_no}: {what}", path.display()))
        };

        let mut days = BTreeMap::new();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || (idx == 0 && line.starts_with("date")) {
                continue;
            }
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            let &[date, tmin, tmax, rain] = fields.as_slice() else {
                return Err(bad(idx + 1, "expected date,tmin,tmax,rain"));
            };
            let day = NaiveDate::parse_from_str(date, "%Y-%m-%d")
                .map_err(|e| bad(idx + 1, &format!("bad date {date:?}: {e}")))?;
            let number = |raw: &str| {
                raw.parse::<f64>()
                    .map_err(|e| bad(idx + 1, &format!("bad number {raw:?}: {e}")))
            };
            days.insert(
                day,
                DailyWeather {
                    day,
                    tmin: number(tmin)?,
                    tmax: number(tmax)?,
                    rain: number(rain)?,
                },
            );
        }
        Ok(Self { days })
    }
}

impl WeatherSeries for CsvWeatherSeries {
    fn first_date(&self) -> NaiveDate {
        self.days.keys().next().copied().unwrap_or_default()
    }

    fn last_date(&self) -> NaiveDate {
        self.days.keys().next_back().copied().unwrap_or_default()
    }

    fn day(&self, day: NaiveDate) -> Option<DailyWeather> {
        self.days.get(&day).copied()
    }
}
