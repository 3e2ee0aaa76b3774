//! Storage layer: extraction/result artifacts on disk, document status in DuckDB.

mod artifacts;
mod error;
mod status;

pub use artifacts::{ArtifactStore, LocalArtifacts, rejected_file_name, result_file_name};
pub use error::StoreError;
pub use status::{DocumentStatus, MemorySink, NoopSink, StatusEvent, StatusSink};

#[cfg(feature = "duckdb")]
mod duck;
#[cfg(feature = "duckdb")]
pub use duck::{DuckStatusSink, StatusRow};
