//! Gridded output.
//!
//! - `grid`: lon/lat ↔ row/col mapping
//! - `file`: multi-band ASCII grid files
//! - `aggregator`: in-memory cubes per variable, flushed row by row
//! - `conversion`: variable → unit conversion registry

pub mod aggregator;
pub mod conversion;
pub mod file;
pub mod grid;

pub use aggregator::{RasterAggregator, RasterMode};
pub use conversion::{Conversion, ConversionRegistry, VariableSpec};
pub use grid::{GridMapper, RegularGrid};

/// Shape and placement of a regular lon/lat grid.
///
/// `xll`/`yll` are the lower-left corner; row 0 is the northernmost row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridFootprint {
    pub nrows: usize,
    pub ncols: usize,
    pub xll: f64,
    pub yll: f64,
    pub cellsize: f64,
    pub nodata: f64,
}

impl GridFootprint {
    /// Global 0.5° grid: 360 rows by 720 columns, nodata 1e20.
    pub fn global_half_degree() -> Self {
        Self {
            nrows: 360,
            ncols: 720,
            xll: -180.0,
            yll: -90.0,
            cellsize: 0.5,
            nodata: 1e20,
        }
    }

    /// Latitude of the northern edge.
    pub fn top(&self) -> f64 {
        self.yll + self.nrows as f64 * self.cellsize
    }

    /// Longitude of the eastern edge.
    pub fn right(&self) -> f64 {
        self.xll + self.ncols as f64 * self.cellsize
    }

    /// Same shape and placement, within a small tolerance.
    pub fn same_footprint(&self, other: &GridFootprint) -> bool {
        let close = |a: f64, b: f64| (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1.0);
        self.nrows == other.nrows
            && self.ncols == other.ncols
            && close(self.xll, other.xll)
            && close(self.yll, other.yll)
            && close(self.cellsize, other.cellsize)
            && close(self.nodata, other.nodata)
    }
}

impl Default for GridFootprint {
    fn default() -> Self {
        Self::global_half_degree()
    }
}
