//! Error types for gridbatch.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("Raster error: {0}")]
    Raster(#[from] RasterError),

    #[error("Simulation error: {0}")]
    Simulation(#[from] SimulationError),

    #[error("Supervisor error: {0}")]
    Supervisor(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Relational store errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),
}

impl DatabaseError {
    /// Whether the error means the store itself is unusable.
    ///
    /// A worker hitting one of these stops instead of marking the task.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Pool(_) | Self::Query(_) | Self::Migration(_))
    }
}

/// Task lease errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {task_id} not found")]
    NotFound { task_id: i64 },

    #[error("Task {task_id} is {state}, cannot transition to {target}")]
    InvalidTransition {
        task_id: i64,
        state: String,
        target: String,
    },

    #[error("Task {task_id} exceeded deadline of {timeout:?}")]
    DeadlineExceeded { task_id: i64, timeout: Duration },
}

/// Keyed artifact store errors.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("Failed to open store {path}: {reason}")]
    Open { path: PathBuf, reason: String },

    #[error("Store write failed: {0}")]
    Write(String),

    #[error("Store read failed: {0}")]
    Read(String),

    #[error("Store is closed")]
    Closed,

    #[error("Unsupported artifact format version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("Artifact encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Invalid store pattern: {0}")]
    Pattern(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Raster output errors.
#[derive(Debug, thiserror::Error)]
pub enum RasterError {
    #[error("Raster file {path} could not be opened: {reason}")]
    Open { path: PathBuf, reason: String },

    #[error("Raster {path} does not match the grid footprint: {reason}")]
    FootprintMismatch { path: PathBuf, reason: String },

    #[error("Malformed raster {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("Location ({lon}, {lat}) is outside the grid")]
    OutsideGrid { lon: f64, lat: f64 },

    #[error("Year index {index} out of range (0..{nyears})")]
    YearOutOfRange { index: usize, nyears: usize },

    #[error("Unknown raster variable: {0}")]
    UnknownVariable(String),

    #[error("All {nrows} rows have already been written")]
    RowsExhausted { nrows: usize },

    #[error("Aggregator opened in {0} mode")]
    WrongMode(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors reported by the simulator and its input collaborators.
///
/// These are the ModelError category: the task is marked Error with
/// [`SimulationError::comment`] and the worker moves on.
#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error("No weather data for lon/lat {lon}/{lat}")]
    MissingWeather { lon: f64, lat: f64 },

    #[error("No soil data for lon/lat {lon}/{lat}")]
    MissingSoil { lon: f64, lat: f64 },

    #[error("Location specific values for crop parameter(s) missing: {0}")]
    MissingCropParameter(String),

    #[error("No crop calendar for lon/lat {lon}/{lat}")]
    NoSeason { lon: f64, lat: f64 },

    #[error("Insufficient results for crop {crop_no} at lon/lat {lon}/{lat}")]
    InsufficientOutput { crop_no: i64, lon: f64, lat: f64 },

    #[error("Simulator failed: {0}")]
    Model(String),
}

impl SimulationError {
    /// Short diagnostic stored in the task comment column.
    pub fn comment(&self) -> &'static str {
        match self {
            Self::MissingWeather { .. } => "No weather data",
            Self::MissingSoil { .. } => "No soil data",
            Self::MissingCropParameter(_) => "Missing crop parameters",
            Self::NoSeason { .. } => "No crop calendar",
            Self::InsufficientOutput { .. } => "Insufficient output",
            Self::Model(_) => "Simulator error",
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
