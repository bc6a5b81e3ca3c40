//! Job lifecycle data: pipeline kinds, status machine, progress snapshots,
//! and the durable record the registry persists.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use paramlab_core::{CombinationResult, RunId, SpecHash};

use crate::artifacts::ArtifactRef;

/// The five research pipelines the queue can drive.
///
/// At most one job per kind may be active at a time; different kinds run
/// concurrently without sharing mutable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineKind {
    GridSearch,
    WalkForward,
    MonteCarlo,
    Portfolio,
    Regime,
}

impl PipelineKind {
    pub const ALL: [PipelineKind; 5] = [
        PipelineKind::GridSearch,
        PipelineKind::WalkForward,
        PipelineKind::MonteCarlo,
        PipelineKind::Portfolio,
        PipelineKind::Regime,
    ];

    /// Stable lowercase label, used in run ids and file names.
    pub fn label(self) -> &'static str {
        match self {
            Self::GridSearch => "grid_search",
            Self::WalkForward => "walk_forward",
            Self::MonteCarlo => "monte_carlo",
            Self::Portfolio => "portfolio",
            Self::Regime => "regime",
        }
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl FromStr for PipelineKind {
    type Err = ParsePipelineKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "grid_search" | "grid" => Ok(Self::GridSearch),
            "walk_forward" => Ok(Self::WalkForward),
            "monte_carlo" => Ok(Self::MonteCarlo),
            "portfolio" => Ok(Self::Portfolio),
            "regime" => Ok(Self::Regime),
            other => Err(ParsePipelineKindError(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown pipeline kind '{0}'")]
pub struct ParsePipelineKindError(pub String);

/// Lifecycle state of a job.
///
/// `Idle` only ever appears in status reports (no job exists for that
/// pipeline kind); persisted records start at `Starting` and end in one of
/// the three terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Idle,
    Starting,
    Running,
    Completed,
    Aborted,
    Error,
}

impl JobStatus {
    /// Starting or Running: the job holds its pipeline-kind slot.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted | Self::Error)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Aborted => "ABORTED",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Lightweight, cheaply cloneable view of where a job stands.
///
/// This is everything a `status()` read is allowed to expose: no datasets,
/// no result heaps, no artifact payloads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// 0.0 ..= 100.0; never regresses once published.
    pub percent: f64,
    /// Short phase label ("loading", "optimizing", "finalizing", ...).
    pub phase: String,
    /// Human-readable one-liner for display.
    pub message: String,
    pub combinations_done: u64,
    pub combinations_total: u64,
}

impl ProgressSnapshot {
    pub fn at(
        percent: f64,
        phase: impl Into<String>,
        message: impl Into<String>,
        combinations_done: u64,
        combinations_total: u64,
    ) -> Self {
        Self {
            percent: percent.clamp(0.0, 100.0),
            phase: phase.into(),
            message: message.into(),
            combinations_done,
            combinations_total,
        }
    }

    /// Merge a newer snapshot in, keeping percent monotonic.
    pub fn advance_to(&mut self, newer: ProgressSnapshot) {
        let floor = self.percent;
        *self = newer;
        if self.percent < floor {
            self.percent = floor;
        }
    }
}

/// Which branch of the failure taxonomy an error record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// Missing data, malformed config, combination ceiling exceeded.
    Precondition,
    /// A job of the same pipeline kind was already active.
    Conflict,
    /// The lab subsystem touched (or was touched by) a live-trading context.
    Isolation,
    /// Anti-lookahead breach or walk-forward window underflow in strict mode.
    Validation,
    /// Unexpected failure while the job was running.
    Runtime,
    /// Stale heartbeat observed on read; the process died mid-run.
    CrashInferred,
}

/// Captured failure attached to a terminal `Error` (or `Aborted`) record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: FailureKind,
    pub message: String,
    pub at: NaiveDateTime,
}

impl ErrorRecord {
    pub fn new(kind: FailureKind, message: impl Into<String>, at: NaiveDateTime) -> Self {
        Self {
            kind,
            message: message.into(),
            at,
        }
    }
}

/// One combination that failed during a run, kept for the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureNote {
    pub index: u64,
    pub params: String,
    pub error: String,
}

/// Final payload of a completed job: the ranked survivors plus references
/// to the heavy artifacts written out-of-band.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobOutcome {
    /// Best-first. Bounded by the configured top-N capacity.
    pub top_n: Vec<CombinationResult>,
    pub artifacts: Vec<ArtifactRef>,
    /// Combinations actually evaluated (≤ the pre-start total).
    pub evaluated: u64,
    /// Combinations that failed and were skipped.
    pub failed: u64,
    /// Anti-lookahead violations observed (nonzero only in lenient mode;
    /// strict mode turns the first one into a terminal error).
    pub lookahead_violations: u64,
}

/// The durable job record. One JSON file per run in the registry.
///
/// Mutated only by the owning worker thread; everyone else sees clones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub run_id: RunId,
    pub kind: PipelineKind,
    pub status: JobStatus,
    pub spec_hash: SpecHash,
    pub symbols: Vec<String>,
    pub progress: ProgressSnapshot,
    pub started_at: NaiveDateTime,
    pub finished_at: Option<NaiveDateTime>,
    /// Refreshed once per batch while running; staleness implies a crash.
    pub heartbeat_at: NaiveDateTime,
    pub outcome: Option<JobOutcome>,
    pub error: Option<ErrorRecord>,
}

impl JobRecord {
    /// Fresh record in `Starting`, written before the worker spawns.
    pub fn starting(
        run_id: RunId,
        kind: PipelineKind,
        spec_hash: SpecHash,
        symbols: Vec<String>,
        started_at: NaiveDateTime,
    ) -> Self {
        Self {
            run_id,
            kind,
            status: JobStatus::Starting,
            spec_hash,
            symbols,
            progress: ProgressSnapshot::at(0.0, "starting", "job accepted", 0, 0),
            started_at,
            finished_at: None,
            heartbeat_at: started_at,
            outcome: None,
            error: None,
        }
    }

    /// Starting -> Running, once the worker owns the job.
    pub fn mark_running(&mut self, at: NaiveDateTime) {
        self.status = JobStatus::Running;
        self.heartbeat_at = at;
    }

    /// Refresh heartbeat and fold in newer progress.
    pub fn beat(&mut self, progress: ProgressSnapshot, at: NaiveDateTime) {
        self.progress.advance_to(progress);
        self.heartbeat_at = at;
    }

    pub fn mark_completed(&mut self, outcome: JobOutcome, at: NaiveDateTime) {
        self.status = JobStatus::Completed;
        self.finished_at = Some(at);
        self.heartbeat_at = at;
        self.progress.percent = 100.0;
        self.progress.phase = "done".into();
        self.progress.message = "completed".into();
        self.progress.combinations_done = outcome.evaluated;
        self.outcome = Some(outcome);
    }

    pub fn mark_aborted(&mut self, at: NaiveDateTime) {
        self.status = JobStatus::Aborted;
        self.finished_at = Some(at);
        self.heartbeat_at = at;
    }

    pub fn mark_error(&mut self, error: ErrorRecord, finished_at: NaiveDateTime) {
        self.status = JobStatus::Error;
        self.finished_at = Some(finished_at);
        self.error = Some(error);
    }

    /// The `status()` payload: everything except the outcome.
    pub fn status_report(&self) -> StatusReport {
        StatusReport {
            run_id: Some(self.run_id.clone()),
            kind: Some(self.kind),
            status: self.status,
            progress: self.progress.clone(),
            started_at: Some(self.started_at),
            finished_at: self.finished_at,
            error: self.error.clone(),
        }
    }
}

/// What `status()` returns. Intentionally minimal; heavy data lives behind
/// `results()` and the artifact store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub run_id: Option<RunId>,
    pub kind: Option<PipelineKind>,
    pub status: JobStatus,
    pub progress: ProgressSnapshot,
    pub started_at: Option<NaiveDateTime>,
    pub finished_at: Option<NaiveDateTime>,
    pub error: Option<ErrorRecord>,
}

impl StatusReport {
    /// No job exists for the queried pipeline kind.
    pub fn idle(kind: PipelineKind) -> Self {
        Self {
            run_id: None,
            kind: Some(kind),
            status: JobStatus::Idle,
            progress: ProgressSnapshot::default(),
            started_at: None,
            finished_at: None,
            error: None,
        }
    }
}
