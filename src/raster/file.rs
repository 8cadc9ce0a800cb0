//! Multi-band ASCII grid files.
//!
//! An ESRI ASCII grid header extended with band metadata:
//!
//! ```text
//! ncols        720
//! nrows        360
//! xllcorner    -180
//! yllcorner    -90
//! cellsize     0.5
//! NODATA_value 1e20
//! nbands       34
//! start_year   1979
//! variable     yield_mai
//! long_name    Crop yield (dry matter)
//! units        t ha-1 yr-1
//! ```
//!
//! followed, for each grid row from north to south, by `nbands` lines of
//! `ncols` values (band `b` holds year `start_year + b`).

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::RasterError;
use crate::raster::GridFootprint;

/// Header of one raster file.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterHeader {
    pub footprint: GridFootprint,
    pub nbands: usize,
    pub start_year: i32,
    pub variable: String,
    pub long_name: String,
    pub units: String,
}

impl RasterHeader {
    fn write_to(&self, out: &mut impl Write) -> std::io::Result<()> {
        let fp = &self.footprint;
        writeln!(out, "ncols        {}", fp.ncols)?;
        writeln!(out, "nrows        {}", fp.nrows)?;
        writeln!(out, "xllcorner    {}", fp.xll)?;
        writeln!(out, "yllcorner    {}", fp.yll)?;
        writeln!(out, "cellsize     {}", fp.cellsize)?;
        writeln!(out, "NODATA_value {:e}", fp.nodata)?;
        writeln!(out, "nbands       {}", self.nbands)?;
        writeln!(out, "start_year   {}", self.start_year)?;
        writeln!(out, "variable     {}", self.variable)?;
        writeln!(out, "long_name    {}", self.long_name)?;
        writeln!(out, "units        {}", self.units)
    }
}

/// Number of header lines.
const HEADER_LINES: usize = 11;

/// Streams rows of one raster file to disk.
pub struct RasterWriter {
    path: PathBuf,
    out: BufWriter<File>,
    header: RasterHeader,
    rows_written: usize,
    nodata_token: String,
}

impl RasterWriter {
    /// Create the file and write its header.
    pub fn create(path: &Path, header: RasterHeader) -> Result<Self, RasterError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path).map_err(|e| RasterError::Open {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let mut out = BufWriter::new(file);
        header.write_to(&mut out)?;
        let nodata_token = format!("{:e}", header.footprint.nodata);
        Ok(Self {
            path: path.to_path_buf(),
            out,
            header,
            rows_written: 0,
            nodata_token,
        })
    }

    /// Write the next grid row: `nbands` slices of `ncols` values.
    pub fn write_row<'a>(&mut self, bands: impl Iterator<Item = &'a [f64]>) -> Result<(), RasterError> {
        let fp = self.header.footprint;
        if self.rows_written >= fp.nrows {
            return Err(RasterError::RowsExhausted { nrows: fp.nrows });
        }
        let mut count = 0;
        for band in bands {
            let mut first = true;
            for &value in band {
                if !first {
                    self.out.write_all(b" ")?;
                }
                first = false;
                if value == fp.nodata {
                    self.out.write_all(self.nodata_token.as_bytes())?;
                } else {
                    write!(self.out, "{value}")?;
                }
            }
            self.out.write_all(b"\n")?;
            count += 1;
        }
        if count != self.header.nbands {
            return Err(RasterError::Malformed {
                path: self.path.clone(),
                reason: format!("row has {count} bands, header says {}", self.header.nbands),
            });
        }
        self.rows_written += 1;
        Ok(())
    }

    pub fn rows_written(&self) -> usize {
        self.rows_written
    }

    /// Flush buffered output and sync the file.
    pub fn finish(mut self) -> Result<(), RasterError> {
        self.out.flush()?;
        self.out.get_ref().sync_all()?;
        Ok(())
    }
}

/// Read only the header of a raster file.
pub fn read_header(path: &Path) -> Result<RasterHeader, RasterError> {
    let file = File::open(path).map_err(|e| RasterError::Open {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let mut lines = BufReader::new(file).lines();
    parse_header(path, &mut lines)
}

/// Read a raster file into its header and a band-major cube
/// (`band * nrows * ncols + row * ncols + col`).
pub fn read_cube(path: &Path) -> Result<(RasterHeader, Vec<f64>), RasterError> {
    let file = File::open(path).map_err(|e| RasterError::Open {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let mut lines = BufReader::new(file).lines();
    let header = parse_header(path, &mut lines)?;
    let fp = header.footprint;
    let malformed = |reason: String| RasterError::Malformed {
        path: path.to_path_buf(),
        reason,
    };

    let mut cube = vec![fp.nodata; header.nbands * fp.nrows * fp.ncols];
    for row in 0..fp.nrows {
        for band in 0..header.nbands {
            let line = lines
                .next()
                .ok_or_else(|| malformed(format!("missing data for row {row} band {band}")))??;
            let offset = band * fp.nrows * fp.ncols + row * fp.ncols;
            let mut cols = 0;
            for (col, token) in line.split_whitespace().enumerate() {
                if col >= fp.ncols {
                    return Err(malformed(format!("row {row} band {band} has too many values")));
                }
                cube[offset + col] = token
                    .parse()
                    .map_err(|e| malformed(format!("row {row} band {band}: {token:?}: {e}")))?;
                cols = col + 1;
            }
            if cols != fp.ncols {
                return Err(malformed(format!(
                    "row {row} band {band} has {cols} values, expected {}",
                    fp.ncols
                )));
            }
        }
    }
    Ok((header, cube))
}

fn parse_header<B: BufRead>(
    path: &Path,
    lines: &mut std::io::Lines<B>,
) -> Result<RasterHeader, RasterError> {
    let malformed = |reason: String| RasterError::Malformed {
        path: path.to_path_buf(),
        reason,
    };

    let mut fields = Vec::with_capacity(HEADER_LINES);
    for expected in [
        "ncols",
        "nrows",
        "xllcorner",
        "yllcorner",
        "cellsize",
        "NODATA_value",
        "nbands",
        "start_year",
        "variable",
        "long_name",
        "units",
    ] {
        let line = lines
            .next()
            .ok_or_else(|| malformed(format!("header ends before {expected}")))??;
        let (key, value) = line
            .split_once(char::is_whitespace)
            .map(|(k, v)| (k, v.trim()))
            .unwrap_or((line.trim(), ""));
        if !key.eq_ignore_ascii_case(expected) {
            return Err(malformed(format!("expected {expected}, found {key:?}")));
        }
        fields.push(value.to_string());
    }

    let number = |idx: usize| -> Result<f64, RasterError> {
        fields[idx]
            .parse()
            .map_err(|e| malformed(format!("header field {idx}: {:?}: {e}", fields[idx])))
    };
    let count = |idx: usize| -> Result<usize, RasterError> {
        fields[idx]
            .parse()
            .map_err(|e| malformed(format!("header field {idx}: {:?}: {e}", fields[idx])))
    };

    Ok(RasterHeader {
        footprint: GridFootprint {
            ncols: count(0)?,
            nrows: count(1)?,
            xll: number(2)?,
            yll: number(3)?,
            cellsize: number(4)?,
            nodata: number(5)?,
        },
        nbands: count(6)?,
        start_year: fields[7]
            .parse()
            .map_err(|e| malformed(format!("start_year {:?}: {e}", fields[7])))?,
        variable: fields[8].clone(),
        long_name: fields[9].clone(),
        units: fields[10].clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> RasterHeader {
        RasterHeader {
            footprint: GridFootprint {
                nrows: 2,
                ncols: 3,
                xll: 0.0,
                yll: 0.0,
                cellsize: 1.0,
                nodata: 1e20,
            },
            nbands: 2,
            start_year: 2000,
            variable: "yield_mai".into(),
            long_name: "Crop yield (dry matter)".into(),
            units: "t ha-1 yr-1".into(),
        }
    }

    #[test]
    fn written_file_reads_back() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("out.asc");
        let mut writer = RasterWriter::create(&path, header()).unwrap();
        let nd = 1e20;
        writer
            .write_row([&[1.5, nd, 2.0][..], &[nd, nd, nd][..]].into_iter())
            .unwrap();
        writer
            .write_row([&[nd, nd, nd][..], &[0.0, -3.25, nd][..]].into_iter())
            .unwrap();
        assert!(matches!(
            writer.write_row([&[nd; 3][..], &[nd; 3][..]].into_iter()),
            Err(RasterError::RowsExhausted { nrows: 2 })
        ));
        writer.finish().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("NODATA_value 1e20"));
        assert!(text.contains("1.5 1e20 2\n"));

        let (read, cube) = read_cube(&path).unwrap();
        assert_eq!(read, header());
        // band 0, row 0
        assert_eq!(&cube[0..3], &[1.5, nd, 2.0]);
        // band 1, row 1
        assert_eq!(&cube[9..12], &[0.0, -3.25, nd]);
    }

    #[test]
    fn truncated_file_is_malformed() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("short.asc");
        let writer = RasterWriter::create(&path, header()).unwrap();
        writer.finish().unwrap();
        assert!(matches!(read_cube(&path), Err(RasterError::Malformed { .. })));
        assert_eq!(read_header(&path).unwrap(), header());
    }

    #[test]
    fn missing_file_fails_to_open() {
        assert!(matches!(
            read_header(Path::new("/nonexistent/raster.asc")),
            Err(RasterError::Open { .. })
        ));
    }
}
