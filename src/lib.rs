//! gridbatch: distributed crop simulation over a lon/lat grid.
//!
//! Worker processes lease tasks from a shared libSQL task list, run the
//! simulator for every weather year of a cell and store the results in
//! rotating artifact stores. Consolidation reads the stores back and
//! writes one multi-band raster per output variable.

pub mod artifacts;
pub mod config;
pub mod consolidate;
pub mod error;
pub mod naming;
pub mod raster;
pub mod sim;
pub mod store;
pub mod worker;
