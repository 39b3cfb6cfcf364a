//! Per-target outcomes and the run summary.

use serde::{Deserialize, Serialize};
use std::fmt;

use klinehouse_core::domain::FetchTarget;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Loaded by an earlier run and still intact in the cache.
    CacheHit,
    /// The host does not publish this archive.
    NotFound,
    Cancelled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SkipReason::CacheHit => "cache_hit",
            SkipReason::NotFound => "not_found",
            SkipReason::Cancelled => "cancelled",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Fetch,
    Integrity,
    Extract,
    Load,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureKind::Fetch => "fetch",
            FailureKind::Integrity => "integrity",
            FailureKind::Extract => "extract",
            FailureKind::Load => "load",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PipelineOutcome {
    Loaded { rows: u64 },
    Skipped { reason: SkipReason },
    Failed { kind: FailureKind, message: String },
}

impl PipelineOutcome {
    pub fn failed(kind: FailureKind, message: impl fmt::Display) -> Self {
        PipelineOutcome::Failed {
            kind,
            message: message.to_string(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, PipelineOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetReport {
    pub target: FetchTarget,
    pub outcome: PipelineOutcome,
    /// Malformed lines dropped during extraction.
    #[serde(default)]
    pub dropped_rows: u64,
}

impl TargetReport {
    pub fn new(target: FetchTarget, outcome: PipelineOutcome) -> Self {
        Self {
            target,
            outcome,
            dropped_rows: 0,
        }
    }

    pub fn skipped(target: &FetchTarget, reason: SkipReason) -> Self {
        Self::new(target.clone(), PipelineOutcome::Skipped { reason })
    }

    pub fn failed(target: &FetchTarget, kind: FailureKind, message: impl fmt::Display) -> Self {
        Self::new(target.clone(), PipelineOutcome::failed(kind, message))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub targets_considered: usize,
    pub loaded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub rows_loaded: u64,
    pub reports: Vec<TargetReport>,
}

impl RunSummary {
    /// Tally reports, kept in the order given.
    pub fn from_reports(reports: Vec<TargetReport>) -> Self {
        let mut summary = RunSummary {
            targets_considered: reports.len(),
            ..Default::default()
        };
        for report in &reports {
            match &report.outcome {
                PipelineOutcome::Loaded { rows } => {
                    summary.loaded += 1;
                    summary.rows_loaded += rows;
                }
                PipelineOutcome::Skipped { .. } => summary.skipped += 1,
                PipelineOutcome::Failed { .. } => summary.failed += 1,
            }
        }
        summary.reports = reports;
        summary
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    pub fn skipped_for(&self, reason: SkipReason) -> usize {
        self.reports
            .iter()
            .filter(|r| r.outcome == PipelineOutcome::Skipped { reason })
            .count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &TargetReport> {
        self.reports.iter().filter(|r| r.outcome.is_failure())
    }
}
