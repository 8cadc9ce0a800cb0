//! Configuration types.
//!
//! A single immutable [`Config`] is built once at startup (from the
//! environment, optionally overridden by CLI flags) and handed to every
//! component. Nothing reads settings from global state afterwards.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::naming::OutputNaming;
use crate::raster::GridFootprint;

/// Worker loop configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Tasks processed before the worker exits and gets replaced.
    pub max_tasks_per_worker: usize,
    /// Per-task deadline. `None` lets a stuck simulator block its slot.
    pub task_timeout: Option<Duration>,
    /// Summary field aggregated by the grid scanner.
    pub scan_field: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_tasks_per_worker: 200,
            task_timeout: None,
            scan_field: "TSUM".to_string(),
        }
    }
}

/// Supervisor configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Signed CPU request: `None` = all, `0` = one, negative = leave cores free.
    pub cpus: Option<i64>,
    /// Liveness poll interval.
    pub poll_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            cpus: None,
            poll_interval: Duration::from_secs(10),
        }
    }
}

/// Complete run configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Shared relational store (task list, crop tables, tsum).
    pub db_path: PathBuf,
    /// Directory where workers stage per-task artifact files.
    pub staging_dir: PathBuf,
    /// Directory holding rotating artifact stores.
    pub store_dir: PathBuf,
    /// Directory for raster output.
    pub results_dir: PathBuf,
    /// Directory of per-cell weather CSV files.
    pub weather_dir: PathBuf,
    /// Optional directory for rolling log files.
    pub log_dir: Option<PathBuf>,
    /// Keys per artifact store before rotation.
    pub store_max_keys: usize,
    pub worker: WorkerConfig,
    pub supervisor: SupervisorConfig,
    pub grid: GridFootprint,
    pub naming: OutputNaming,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/gridbatch.db"),
            staging_dir: PathBuf::from("./data/staging"),
            store_dir: PathBuf::from("./data/stores"),
            results_dir: PathBuf::from("./data/results"),
            weather_dir: PathBuf::from("./data/weather"),
            log_dir: None,
            store_max_keys: 100_000,
            worker: WorkerConfig::default(),
            supervisor: SupervisorConfig::default(),
            grid: GridFootprint::global_half_degree(),
            naming: OutputNaming::default(),
        }
    }
}

impl Config {
    /// Build config from `GRIDBATCH_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup. Unset keys keep defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let path = |key: &str, default: PathBuf| lookup(key).map(PathBuf::from).unwrap_or(default);

        let cpus = match lookup("GRIDBATCH_CPUS") {
            Some(raw) if !raw.trim().is_empty() => Some(parse_value::<i64>("GRIDBATCH_CPUS", &raw)?),
            _ => None,
        };
        let task_timeout = match lookup("GRIDBATCH_TASK_TIMEOUT_SECS") {
            Some(raw) => match parse_value::<u64>("GRIDBATCH_TASK_TIMEOUT_SECS", &raw)? {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            None => defaults.worker.task_timeout,
        };

        let worker = WorkerConfig {
            max_tasks_per_worker: parsed(
                &lookup,
                "GRIDBATCH_MAX_TASKS_PER_WORKER",
                defaults.worker.max_tasks_per_worker,
            )?,
            task_timeout,
            scan_field: lookup("GRIDBATCH_SCAN_FIELD").unwrap_or(defaults.worker.scan_field),
        };
        if worker.max_tasks_per_worker == 0 {
            return Err(ConfigError::InvalidValue {
                key: "GRIDBATCH_MAX_TASKS_PER_WORKER".into(),
                message: "must be at least 1".into(),
            });
        }

        let supervisor = SupervisorConfig {
            cpus,
            poll_interval: Duration::from_secs(parsed(
                &lookup,
                "GRIDBATCH_POLL_INTERVAL_SECS",
                defaults.supervisor.poll_interval.as_secs(),
            )?),
        };
        if supervisor.poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "GRIDBATCH_POLL_INTERVAL_SECS".into(),
                message: "must be at least 1".into(),
            });
        }

        let grid = GridFootprint {
            nrows: parsed(&lookup, "GRIDBATCH_GRID_NROWS", defaults.grid.nrows)?,
            ncols: parsed(&lookup, "GRIDBATCH_GRID_NCOLS", defaults.grid.ncols)?,
            xll: parsed(&lookup, "GRIDBATCH_GRID_XLL", defaults.grid.xll)?,
            yll: parsed(&lookup, "GRIDBATCH_GRID_YLL", defaults.grid.yll)?,
            cellsize: parsed(&lookup, "GRIDBATCH_GRID_CELLSIZE", defaults.grid.cellsize)?,
            nodata: parsed(&lookup, "GRIDBATCH_GRID_NODATA", defaults.grid.nodata)?,
        };
        if !(grid.xll.is_finite() && grid.yll.is_finite() && grid.nodata.is_finite()) {
            return Err(ConfigError::InvalidValue {
                key: "GRIDBATCH_GRID_*".into(),
                message: "grid origin and nodata must be finite numbers".into(),
            });
        }
        if grid.nrows == 0 || grid.ncols == 0 || !grid.cellsize.is_finite() || grid.cellsize <= 0.0 {
            return Err(ConfigError::InvalidValue {
                key: "GRIDBATCH_GRID_*".into(),
                message: "grid needs positive rows, columns and cell size".into(),
            });
        }

        let naming = OutputNaming {
            model: lookup("GRIDBATCH_MODEL").unwrap_or(defaults.naming.model),
            climate: lookup("GRIDBATCH_CLIMATE").unwrap_or(defaults.naming.climate),
            clim_scenario: lookup("GRIDBATCH_CLIM_SCENARIO")
                .unwrap_or(defaults.naming.clim_scenario),
            sim_scenario: lookup("GRIDBATCH_SIM_SCENARIO").unwrap_or(defaults.naming.sim_scenario),
            timestep: lookup("GRIDBATCH_TIMESTEP").unwrap_or(defaults.naming.timestep),
            start_year: parsed(&lookup, "GRIDBATCH_START_YEAR", defaults.naming.start_year)?,
            end_year: parsed(&lookup, "GRIDBATCH_END_YEAR", defaults.naming.end_year)?,
        };
        if naming.end_year < naming.start_year {
            return Err(ConfigError::InvalidValue {
                key: "GRIDBATCH_END_YEAR".into(),
                message: format!(
                    "end year {} precedes start year {}",
                    naming.end_year, naming.start_year
                ),
            });
        }

        let store_max_keys = parsed(&lookup, "GRIDBATCH_STORE_MAX_KEYS", defaults.store_max_keys)?;
        if store_max_keys == 0 {
            return Err(ConfigError::InvalidValue {
                key: "GRIDBATCH_STORE_MAX_KEYS".into(),
                message: "must be at least 1".into(),
            });
        }

        Ok(Self {
            db_path: path("GRIDBATCH_DB_PATH", defaults.db_path),
            staging_dir: path("GRIDBATCH_STAGING_DIR", defaults.staging_dir),
            store_dir: path("GRIDBATCH_STORE_DIR", defaults.store_dir),
            results_dir: path("GRIDBATCH_RESULTS_DIR", defaults.results_dir),
            weather_dir: path("GRIDBATCH_WEATHER_DIR", defaults.weather_dir),
            log_dir: lookup("GRIDBATCH_LOG_DIR").map(PathBuf::from),
            store_max_keys,
            worker,
            supervisor,
            grid,
            naming,
        })
    }
}

fn parsed<T, F>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{raw:?}: {e}"),
    })
}
