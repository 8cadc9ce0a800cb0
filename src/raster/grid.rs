//! Coordinate mapping between lon/lat and raster rows/columns.

use crate::raster::GridFootprint;

/// Maps locations onto a grid.
pub trait GridMapper: Send + Sync {
    fn footprint(&self) -> &GridFootprint;

    /// Row and column of the cell containing a location, `None` outside.
    fn row_col(&self, longitude: f64, latitude: f64) -> Option<(usize, usize)>;

    /// Center of a cell as `(lon, lat)`.
    fn cell_center(&self, row: usize, col: usize) -> (f64, f64);

    fn nrows(&self) -> usize {
        self.footprint().nrows
    }

    fn ncols(&self) -> usize {
        self.footprint().ncols
    }
}

/// Plain regular lon/lat grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegularGrid {
    footprint: GridFootprint,
}

impl RegularGrid {
    pub fn new(footprint: GridFootprint) -> Self {
        Self { footprint }
    }
}

impl GridMapper for RegularGrid {
    fn footprint(&self) -> &GridFootprint {
        &self.footprint
    }

    fn row_col(&self, longitude: f64, latitude: f64) -> Option<(usize, usize)> {
        let fp = &self.footprint;
        let col = ((longitude - fp.xll) / fp.cellsize).floor();
        let row = ((fp.top() - latitude) / fp.cellsize).floor();
        if !(col >= 0.0 && row >= 0.0) {
            return None;
        }
        let (row, col) = (row as usize, col as usize);
        (row < fp.nrows && col < fp.ncols).then_some((row, col))
    }

    fn cell_center(&self, row: usize, col: usize) -> (f64, f64) {
        let fp = &self.footprint;
        let lon = fp.xll + (col as f64 + 0.5) * fp.cellsize;
        let lat = fp.top() - (row as f64 + 0.5) * fp.cellsize;
        (lon, lat)
    }
}
