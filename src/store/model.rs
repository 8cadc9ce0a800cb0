//! Typed records read from and written to the task database.

use serde::{Deserialize, Serialize};

use crate::worker::state::TaskStatus;

/// One leaseable unit of work: a crop at a grid cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: i64,
    pub status: TaskStatus,
    pub hostname: Option<String>,
    pub process_id: Option<i64>,
    pub crop_no: i64,
    pub longitude: f64,
    pub latitude: f64,
    pub tsum1: Option<f64>,
    pub tsum2: Option<f64>,
    pub comment: Option<String>,
}

/// A task about to be inserted in `Pending` state.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub task_id: i64,
    pub crop_no: i64,
    pub longitude: f64,
    pub latitude: f64,
    pub tsum1: Option<f64>,
    pub tsum2: Option<f64>,
}

/// Crop metadata joined from `crop` and `cropinfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CropInfo {
    pub crop_no: i64,
    pub crop_name: String,
    /// Short label used in output file names (e.g. `mai`).
    pub label: String,
    /// Management code; `rf` is rainfed.
    pub mgmt_code: String,
}

/// Per-cell aggregate written by the grid scanner.
#[derive(Debug, Clone, PartialEq)]
pub struct TsumRecord {
    pub crop_no: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub average: Option<f64>,
    pub stdev: Option<f64>,
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
    pub numobs: i64,
}

impl TsumRecord {
    /// Aggregate a set of per-year observations.
    ///
    /// Standard deviation uses the sample (n - 1) form and is `None` for
    /// fewer than two observations.
    pub fn from_observations(crop_no: i64, longitude: f64, latitude: f64, obs: &[f64]) -> Self {
        let n = obs.len();
        let average = (n > 0).then(|| obs.iter().sum::<f64>() / n as f64);
        let stdev = match average {
            Some(mean) if n > 1 => {
                let ss: f64 = obs.iter().map(|v| (v - mean).powi(2)).sum();
                Some((ss / (n - 1) as f64).sqrt())
            }
            _ => None,
        };
        Self {
            crop_no,
            latitude,
            longitude,
            average,
            stdev,
            minimum: obs.iter().copied().reduce(f64::min),
            maximum: obs.iter().copied().reduce(f64::max),
            numobs: n as i64,
        }
    }
}

/// Where a restarted grid scan picks up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResumptionPoint {
    /// Southernmost latitude with persisted results.
    pub min_lat: f64,
    /// Easternmost longitude completed on the `min_lat` row.
    pub max_lon: f64,
}

impl ResumptionPoint {
    /// Tolerance used when comparing coordinates to the resumption row.
    pub const EPS: f64 = 1e-7;

    /// Whether the cell was already covered by an earlier scan.
    ///
    /// Rows are scanned north to south and cells west to east, so every
    /// row north of `min_lat` is complete, and on the `min_lat` row every
    /// longitude up to `max_lon` is.
    pub fn covers(&self, longitude: f64, latitude: f64) -> bool {
        if latitude > self.min_lat + Self::EPS {
            return true;
        }
        (latitude - self.min_lat).abs() < Self::EPS && longitude <= self.max_lon + Self::EPS
    }
}
