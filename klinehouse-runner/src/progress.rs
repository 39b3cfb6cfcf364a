//! Operator-facing progress reporting for ingest runs.

use klinehouse_core::domain::FetchTarget;

use crate::outcome::{PipelineOutcome, RunSummary, TargetReport};

/// Progress callback for multi-target runs. Called from worker threads when
/// the run is parallel.
pub trait IngestProgress: Send + Sync {
    /// Called when starting on a target.
    fn on_start(&self, target: &FetchTarget, index: usize, total: usize);

    /// Called when a target reaches its outcome.
    fn on_complete(&self, report: &TargetReport, index: usize, total: usize);

    /// Called once the whole run is done.
    fn on_run_complete(&self, summary: &RunSummary);
}

/// Prints one line per event to stdout.
pub struct StdoutProgress;

impl IngestProgress for StdoutProgress {
    fn on_start(&self, target: &FetchTarget, index: usize, total: usize) {
        println!("[{}/{}] Fetching {target}...", index + 1, total);
    }

    fn on_complete(&self, report: &TargetReport, _index: usize, _total: usize) {
        let target = &report.target;
        match &report.outcome {
            PipelineOutcome::Loaded { rows } if report.dropped_rows > 0 => println!(
                "  OK: {target} ({rows} rows, {} malformed dropped)",
                report.dropped_rows
            ),
            PipelineOutcome::Loaded { rows } => println!("  OK: {target} ({rows} rows)"),
            PipelineOutcome::Skipped { reason } => println!("  SKIP: {target}: {reason}"),
            PipelineOutcome::Failed { kind, message } => {
                println!("  FAIL: {target}: {kind}: {message}")
            }
        }
    }

    fn on_run_complete(&self, s: &RunSummary) {
        println!(
            "\nIngest complete: {}/{} loaded, {} skipped, {} failed ({} rows)",
            s.loaded, s.targets_considered, s.skipped, s.failed, s.rows_loaded
        );
    }
}

/// Reports nothing.
pub struct NoProgress;

impl IngestProgress for NoProgress {
    fn on_start(&self, _: &FetchTarget, _: usize, _: usize) {}
    fn on_complete(&self, _: &TargetReport, _: usize, _: usize) {}
    fn on_run_complete(&self, _: &RunSummary) {}
}
