//! Per-variable gridded time series held in memory.
//!
//! In write mode each variable gets a years × rows × cols cube filled with
//! nodata. Results are placed with [`RasterAggregator::set_data`] in any
//! order, then [`RasterAggregator::writenext`] streams one grid row of every
//! cube to its file, `nrows` times. Read mode loads existing files back and
//! checks they share the grid footprint.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::RasterError;
use crate::naming::VARIABLE_PLACEHOLDER;
use crate::raster::file::{RasterHeader, RasterWriter, read_cube};
use crate::raster::grid::GridMapper;

/// How the aggregator was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RasterMode {
    Write,
    Read,
}

impl RasterMode {
    fn name(&self) -> &'static str {
        match self {
            Self::Write => "write",
            Self::Read => "read",
        }
    }
}

/// Metadata recorded by [`RasterAggregator::writeheader`].
#[derive(Debug, Clone)]
struct BandMeta {
    name: String,
    long_name: String,
    units: String,
}

/// One variable: its cube and backing file.
struct VariableCube {
    path: PathBuf,
    meta: BandMeta,
    /// Band-major: `year * nrows * ncols + row * ncols + col`.
    data: Vec<f64>,
    writer: Option<RasterWriter>,
}

/// Accumulates gridded yearly values for a set of variables.
pub struct RasterAggregator {
    mode: RasterMode,
    grid: Arc<dyn GridMapper>,
    start_year: i32,
    nyears: usize,
    variables: BTreeMap<String, VariableCube>,
    row_cursor: usize,
    closed: bool,
}

impl std::fmt::Debug for RasterAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RasterAggregator")
            .field("mode", &self.mode)
            .field("start_year", &self.start_year)
            .field("nyears", &self.nyears)
            .field("variables", &self.variables.keys().collect::<Vec<_>>())
            .field("row_cursor", &self.row_cursor)
            .finish()
    }
}

impl RasterAggregator {
    /// Open one backing file per variable.
    ///
    /// `file_pattern` is a file name where `*` stands for the variable.
    pub fn open(
        mode: RasterMode,
        dir: &Path,
        file_pattern: &str,
        variables: &[&str],
        start_year: i32,
        end_year: i32,
        grid: Arc<dyn GridMapper>,
    ) -> Result<Self, RasterError> {
        if end_year < start_year {
            return Err(RasterError::YearOutOfRange {
                index: 0,
                nyears: 0,
            });
        }
        let nyears = (end_year - start_year + 1) as usize;
        let fp = *grid.footprint();
        let cells = nyears * fp.nrows * fp.ncols;

        let mut cubes = BTreeMap::new();
        for &var in variables {
            let path = dir.join(file_pattern.replacen(VARIABLE_PLACEHOLDER, var, 1));
            let meta = BandMeta {
                name: var.to_string(),
                long_name: String::new(),
                units: String::new(),
            };
            let data = match mode {
                RasterMode::Write => vec![fp.nodata; cells],
                RasterMode::Read => {
                    let (header, data) = read_cube(&path)?;
                    if !header.footprint.same_footprint(&fp) {
                        return Err(RasterError::FootprintMismatch {
                            path,
                            reason: format!("{:?} vs {:?}", header.footprint, fp),
                        });
                    }
                    if header.nbands != nyears || header.start_year != start_year {
                        return Err(RasterError::FootprintMismatch {
                            path,
                            reason: format!(
                                "{} bands from {}, expected {nyears} from {start_year}",
                                header.nbands, header.start_year
                            ),
                        });
                    }
                    cubes.insert(
                        var.to_string(),
                        VariableCube {
                            path,
                            meta: BandMeta {
                                name: header.variable,
                                long_name: header.long_name,
                                units: header.units,
                            },
                            data,
                            writer: None,
                        },
                    );
                    continue;
                }
            };
            cubes.insert(
                var.to_string(),
                VariableCube {
                    path,
                    meta,
                    data,
                    writer: None,
                },
            );
        }

        debug!(
            mode = mode.name(),
            variables = cubes.len(),
            nyears,
            "Raster aggregator opened"
        );
        Ok(Self {
            mode,
            grid,
            start_year,
            nyears,
            variables: cubes,
            row_cursor: 0,
            closed: false,
        })
    }

    pub fn nyears(&self) -> usize {
        self.nyears
    }

    /// Record the name and description written in a variable's header.
    pub fn writeheader(
        &mut self,
        variable: &str,
        name: &str,
        long_name: &str,
        units: &str,
    ) -> Result<(), RasterError> {
        self.require(RasterMode::Write)?;
        let cube = self
            .variables
            .get_mut(variable)
            .ok_or_else(|| RasterError::UnknownVariable(variable.to_string()))?;
        cube.meta = BandMeta {
            name: name.to_string(),
            long_name: long_name.to_string(),
            units: units.to_string(),
        };
        Ok(())
    }

    /// Store one value per variable for a year at a location.
    ///
    /// Nothing is written unless every variable name is known.
    pub fn set_data(
        &mut self,
        year_index: usize,
        longitude: f64,
        latitude: f64,
        values: &BTreeMap<String, f64>,
    ) -> Result<(), RasterError> {
        self.require(RasterMode::Write)?;
        if year_index >= self.nyears {
            return Err(RasterError::YearOutOfRange {
                index: year_index,
                nyears: self.nyears,
            });
        }
        let (row, col) = self
            .grid
            .row_col(longitude, latitude)
            .ok_or(RasterError::OutsideGrid {
                lon: longitude,
                lat: latitude,
            })?;
        if let Some(unknown) = values.keys().find(|var| !self.variables.contains_key(*var)) {
            return Err(RasterError::UnknownVariable(unknown.clone()));
        }
        let idx = self.index(year_index, row, col);
        for (var, &value) in values {
            if let Some(cube) = self.variables.get_mut(var) {
                cube.data[idx] = value;
            }
        }
        Ok(())
    }

    /// Write the next grid row of every variable.
    pub fn writenext(&mut self) -> Result<(), RasterError> {
        self.require(RasterMode::Write)?;
        let fp = *self.grid.footprint();
        if self.row_cursor >= fp.nrows {
            return Err(RasterError::RowsExhausted { nrows: fp.nrows });
        }
        let row = self.row_cursor;
        let plane = fp.nrows * fp.ncols;
        let (start_year, nyears) = (self.start_year, self.nyears);

        for cube in self.variables.values_mut() {
            if cube.writer.is_none() {
                let header = RasterHeader {
                    footprint: fp,
                    nbands: nyears,
                    start_year,
                    variable: cube.meta.name.clone(),
                    long_name: cube.meta.long_name.clone(),
                    units: cube.meta.units.clone(),
                };
                cube.writer = Some(RasterWriter::create(&cube.path, header)?);
            }
            let data = &cube.data;
            if let Some(writer) = cube.writer.as_mut() {
                let bands = (0..nyears).map(|year| {
                    let start = year * plane + row * fp.ncols;
                    &data[start..start + fp.ncols]
                });
                writer.write_row(bands)?;
            }
        }
        self.row_cursor += 1;
        Ok(())
    }

    /// Value at a cell, `None` for unknown variables or indices.
    pub fn value(&self, variable: &str, year_index: usize, row: usize, col: usize) -> Option<f64> {
        let fp = self.grid.footprint();
        if year_index >= self.nyears || row >= fp.nrows || col >= fp.ncols {
            return None;
        }
        let idx = self.index(year_index, row, col);
        self.variables.get(variable).map(|cube| cube.data[idx])
    }

    /// Value at a location.
    pub fn value_at(&self, variable: &str, year_index: usize, longitude: f64, latitude: f64) -> Option<f64> {
        let (row, col) = self.grid.row_col(longitude, latitude)?;
        self.value(variable, year_index, row, col)
    }

    /// Paths of the backing files, by variable.
    pub fn paths(&self) -> BTreeMap<&str, &Path> {
        self.variables
            .iter()
            .map(|(var, cube)| (var.as_str(), cube.path.as_path()))
            .collect()
    }

    /// Flush and release every file.
    ///
    /// In write mode any rows not yet emitted are written first so the
    /// files are always complete.
    pub fn close(&mut self) -> Result<(), RasterError> {
        if self.closed {
            return Ok(());
        }
        if self.mode == RasterMode::Write {
            let nrows = self.grid.footprint().nrows;
            if self.row_cursor < nrows {
                debug!(remaining = nrows - self.row_cursor, "Writing remaining raster rows");
            }
            while self.row_cursor < nrows {
                self.writenext()?;
            }
            for cube in self.variables.values_mut() {
                if let Some(writer) = cube.writer.take() {
                    writer.finish()?;
                    info!(path = %cube.path.display(), "Raster written");
                }
            }
        }
        self.closed = true;
        Ok(())
    }

    fn index(&self, year_index: usize, row: usize, col: usize) -> usize {
        let fp = self.grid.footprint();
        year_index * fp.nrows * fp.ncols + row * fp.ncols + col
    }

    fn require(&self, mode: RasterMode) -> Result<(), RasterError> {
        if self.mode != mode || self.closed {
            return Err(RasterError::WrongMode(self.mode.name()));
        }
        Ok(())
    }
}
