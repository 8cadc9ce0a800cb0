//! Result artifacts: encoding, rotating stores, merged reads, staging.

pub mod model;
pub mod multi;
pub mod rotating;
pub mod staging;

pub use model::{FORMAT_VERSION, SimulationResult, YearResult};
pub use multi::MultiStore;
pub use rotating::ArtifactStore;
pub use staging::{ArtifactSink, StagingDir, ingest};
