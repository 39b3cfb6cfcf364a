//! Klinehouse Runner — ingest orchestration on top of `klinehouse-core`.
//!
//! This crate provides:
//! - Run configuration (TOML, every field defaulted)
//! - The pipeline driver: resolve → schema → fetch → verify → extract → load
//! - Per-target outcomes and the run summary
//! - Progress reporting and fingerprinted JSON run reports

pub mod config;
pub mod outcome;
pub mod pipeline;
pub mod progress;
pub mod report;

pub use config::{ClickHouseOverrides, ConfigError, DestinationKind, IngestConfig};
pub use outcome::{FailureKind, PipelineOutcome, RunSummary, SkipReason, TargetReport};
pub use pipeline::{PipelineDriver, PipelineError};
pub use progress::{IngestProgress, NoProgress, StdoutProgress};
pub use report::{selection_fingerprint, ReportError, RunReport};

#[cfg(test)]
mod send_sync_checks {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn driver_is_send_sync() {
        assert_send::<PipelineDriver>();
        assert_sync::<PipelineDriver>();
    }

    #[test]
    fn summary_is_send_sync() {
        assert_send::<RunSummary>();
        assert_sync::<RunSummary>();
        assert_send::<TargetReport>();
        assert_sync::<TargetReport>();
    }

    #[test]
    fn config_is_send_sync() {
        assert_send::<IngestConfig>();
        assert_sync::<IngestConfig>();
    }

    #[test]
    fn progress_reporters_are_send_sync() {
        assert_send::<StdoutProgress>();
        assert_sync::<StdoutProgress>();
        assert_send::<NoProgress>();
        assert_sync::<NoProgress>();
    }
}
