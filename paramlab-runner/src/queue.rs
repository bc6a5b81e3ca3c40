//! The job queue: one lane per pipeline kind, one worker thread per job.
//!
//! `start` does every pre-flight check synchronously (lab mode, spec
//! validation and ceiling, dataset coverage, lane conflict), writes the
//! Starting record, then hands the job to a named worker thread. `status`
//! and `abort` only touch the shared record and flags, never the data the
//! worker is chewing on. Panics on the worker are caught and recorded so a
//! broken evaluator cannot leave a phantom Running record behind.

use std::collections::HashMap;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use paramlab_core::guard::{ensure_lab_mode, IsolationError};
use paramlab_core::{RunId, ValidationMode, YieldGate};

use crate::artifacts::{ArtifactError, ArtifactStore};
use crate::candle_cache::CandleDataCache;
use crate::config::{JobSpec, SpecError};
use crate::evaluator::{SmaCrossEvaluator, StrategyEvaluator};
use crate::job::{
    ErrorRecord, FailureKind, JobOutcome, JobRecord, JobStatus, PipelineKind, StatusReport,
};
use crate::pipelines::{self, RunContext};
use crate::registry::{JobRegistry, RegistryError, DEFAULT_STALE_AFTER_SECS};
use crate::store::HistoricalStore;

/// Why `start` refused a job. All of these are synchronous; no job record
/// exists when one is returned.
#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Spec(#[from] SpecError),
    #[error("historical data unavailable: {0}")]
    Data(String),
    #[error("a {kind} job is already active: {run_id}")]
    Conflict { kind: PipelineKind, run_id: RunId },
    #[error(transparent)]
    Isolation(#[from] IsolationError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),
}

impl StartError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Spec(_) | Self::Data(_) => FailureKind::Precondition,
            Self::Conflict { .. } => FailureKind::Conflict,
            Self::Isolation(_) => FailureKind::Isolation,
            Self::Registry(_) | Self::Spawn(_) => FailureKind::Runtime,
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error("run `{run_id}` is {status}, not completed")]
    NotCompleted { run_id: RunId, status: JobStatus },
    #[error("run `{run_id}` completed without a stored outcome")]
    MissingOutcome { run_id: RunId },
}

/// In-memory handle to the job currently (or last) owned by this process
/// for one pipeline kind.
struct Lane {
    run_id: RunId,
    record: Arc<Mutex<JobRecord>>,
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Lane {
    fn status(&self) -> JobStatus {
        self.record
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .status
    }
}

pub struct OptimizationJobQueue {
    registry: Arc<JobRegistry>,
    artifacts: Arc<ArtifactStore>,
    cache: Arc<CandleDataCache>,
    store: Arc<dyn HistoricalStore>,
    evaluator: Arc<dyn StrategyEvaluator>,
    lanes: Mutex<HashMap<PipelineKind, Lane>>,
}

impl OptimizationJobQueue {
    /// Queue over a lab directory: records land in `<root>/jobs`, artifacts
    /// in `<root>/artifacts`.
    pub fn new(
        store: Arc<dyn HistoricalStore>,
        lab_root: impl Into<PathBuf>,
    ) -> Result<Self, QueueError> {
        Self::with_stale_after(store, lab_root, DEFAULT_STALE_AFTER_SECS)
    }

    pub fn with_stale_after(
        store: Arc<dyn HistoricalStore>,
        lab_root: impl Into<PathBuf>,
        stale_after_secs: i64,
    ) -> Result<Self, QueueError> {
        let lab_root = lab_root.into();
        let registry = Arc::new(JobRegistry::with_stale_after(
            lab_root.join("jobs"),
            stale_after_secs,
        )?);
        let artifacts = Arc::new(ArtifactStore::new(lab_root.join("artifacts"))?);
        let cache = Arc::new(CandleDataCache::new(Arc::clone(&store)));
        Ok(Self {
            registry,
            artifacts,
            cache,
            store,
            evaluator: Arc::new(SmaCrossEvaluator),
            lanes: Mutex::new(HashMap::new()),
        })
    }

    /// Swap in a different strategy evaluator for all later jobs.
    pub fn with_evaluator(mut self, evaluator: Arc<dyn StrategyEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    fn lock_lanes(&self) -> std::sync::MutexGuard<'_, HashMap<PipelineKind, Lane>> {
        self.lanes.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every symbol must have stored data for the job window: the whole of
    /// it in strict mode, a non-empty overlap in lenient mode.
    fn check_coverage(&self, spec: &JobSpec) -> Result<(), StartError> {
        let range = spec.range()?;
        for symbol in &spec.symbols {
            let span = self
                .store
                .coverage(symbol, spec.timeframe)
                .map_err(|e| StartError::Data(e.to_string()))?;
            let covered = match span {
                Some(span) => match spec.validation.mode {
                    ValidationMode::Strict => span.covers(&range),
                    ValidationMode::Lenient => span.overlaps(&range),
                },
                None => false,
            };
            if !covered {
                return Err(StartError::Data(format!(
                    "{symbol}/{} has no data for {range}",
                    spec.timeframe
                )));
            }
        }
        Ok(())
    }

    /// Validate and launch a job. Returns the run id once the Starting
    /// record is durable and the worker thread is up.
    pub fn start(&self, spec: JobSpec) -> Result<RunId, StartError> {
        ensure_lab_mode()?;
        let compiled = spec.compile()?;
        let objectives = spec.objective_set()?;
        let spec_hash = spec.spec_hash()?;
        self.check_coverage(&spec)?;

        let mut lanes = self.lock_lanes();
        if let Some(lane) = lanes.get_mut(&spec.kind) {
            if lane.status().is_active() {
                return Err(StartError::Conflict {
                    kind: spec.kind,
                    run_id: lane.run_id.clone(),
                });
            }
            // Finished lane: reap the thread before reusing the slot.
            if let Some(handle) = lane.handle.take() {
                let _ = handle.join();
            }
            lanes.remove(&spec.kind);
        }
        // A worker in another process shows up through the registry.
        if let Some(record) = self.registry.latest(spec.kind)? {
            if record.status.is_active() {
                return Err(StartError::Conflict {
                    kind: spec.kind,
                    run_id: record.run_id,
                });
            }
        }

        let started = Utc::now().naive_utc();
        let run_id = RunId::generate(spec.kind.label(), &spec_hash, started);
        let record = JobRecord::starting(
            run_id.clone(),
            spec.kind,
            spec_hash,
            spec.symbols.clone(),
            started,
        );
        self.registry.save(&record)?;

        let kind = spec.kind;
        let record = Arc::new(Mutex::new(record));
        let cancel = Arc::new(AtomicBool::new(false));
        let gate = YieldGate::new(spec.limits.combo_batch, spec.limits.bar_batch);
        let ctx = RunContext {
            run_id: run_id.clone(),
            spec,
            compiled,
            objectives,
            registry: Arc::clone(&self.registry),
            artifacts: Arc::clone(&self.artifacts),
            cache: Arc::clone(&self.cache),
            evaluator: Arc::clone(&self.evaluator),
            record: Arc::clone(&record),
            cancel: Arc::clone(&cancel),
            gate,
        };
        let handle = spawn_worker(ctx)?;
        lanes.insert(
            kind,
            Lane {
                run_id: run_id.clone(),
                record,
                cancel,
                handle: Some(handle),
            },
        );
        info!(%run_id, %kind, "job started");
        Ok(run_id)
    }

    /// Current state of the lane for one pipeline kind. Snapshot clone of
    /// the shared record for live jobs; the durable registry (with crash
    /// inference) for everything else.
    pub fn status(&self, kind: PipelineKind) -> StatusReport {
        {
            let lanes = self.lock_lanes();
            if let Some(lane) = lanes.get(&kind) {
                return lane
                    .record
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .status_report();
            }
        }
        match self.registry.latest(kind) {
            Ok(Some(record)) => record.status_report(),
            Ok(None) => StatusReport::idle(kind),
            Err(err) => {
                warn!(%kind, error = %err, "status read failed");
                StatusReport::idle(kind)
            }
        }
    }

    /// Request cancellation of the active job of one kind. Returns whether
    /// there was an active job to signal; the job itself winds down at its
    /// next checkpoint.
    pub fn abort(&self, kind: PipelineKind) -> bool {
        {
            let lanes = self.lock_lanes();
            if let Some(lane) = lanes.get(&kind) {
                if lane.status().is_active() {
                    lane.cancel.store(true, Ordering::SeqCst);
                    if let Err(err) = self.registry.request_abort(&lane.run_id) {
                        warn!(run_id = %lane.run_id, error = %err, "abort marker write failed");
                    }
                    info!(run_id = %lane.run_id, %kind, "abort requested");
                    return true;
                }
            }
        }
        // Jobs owned by another process can only be reached by marker file.
        match self.registry.latest(kind) {
            Ok(Some(record)) if record.status.is_active() => {
                match self.registry.request_abort(&record.run_id) {
                    Ok(()) => {
                        info!(run_id = %record.run_id, %kind, "abort requested via registry");
                        true
                    }
                    Err(err) => {
                        warn!(run_id = %record.run_id, error = %err, "abort marker write failed");
                        false
                    }
                }
            }
            _ => false,
        }
    }

    /// Ranked results and artifact references of a completed run.
    pub fn results(&self, run_id: &RunId) -> Result<JobOutcome, QueueError> {
        let record = self.registry.load(run_id)?;
        if record.status != JobStatus::Completed {
            return Err(QueueError::NotCompleted {
                run_id: run_id.clone(),
                status: record.status,
            });
        }
        record.outcome.ok_or_else(|| QueueError::MissingOutcome {
            run_id: run_id.clone(),
        })
    }

    /// Poll until the lane reaches a terminal state or the timeout passes.
    /// Returns the last observed report either way.
    pub fn wait_terminal(&self, kind: PipelineKind, timeout: Duration) -> StatusReport {
        let deadline = Instant::now() + timeout;
        loop {
            let report = self.status(kind);
            if report.status.is_terminal() || Instant::now() >= deadline {
                return report;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }
}

impl Drop for OptimizationJobQueue {
    fn drop(&mut self) {
        let mut lanes = self.lock_lanes();
        for lane in lanes.values() {
            lane.cancel.store(true, Ordering::SeqCst);
        }
        for (_, lane) in lanes.drain() {
            if let Some(handle) = lane.handle {
                let _ = handle.join();
            }
        }
    }
}

/// Run the job on a named worker thread. A panic anywhere in the pipeline
/// is converted into a terminal Error record; the normal path finalizes
/// inside [`pipelines::execute`].
fn spawn_worker(ctx: RunContext) -> Result<JoinHandle<()>, StartError> {
    let name = format!("paramlab-{}", ctx.spec.kind.label());
    let run_id = ctx.run_id.clone();
    let record = Arc::clone(&ctx.record);
    let registry = Arc::clone(&ctx.registry);
    let cache = Arc::clone(&ctx.cache);
    thread::Builder::new()
        .name(name)
        .spawn(move || {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| pipelines::execute(ctx)))
            {
                let message = panic_message(payload.as_ref());
                warn!(%run_id, message, "worker panicked");
                let now = Utc::now().naive_utc();
                let snapshot = {
                    let mut rec = record.lock().unwrap_or_else(|e| e.into_inner());
                    rec.mark_error(
                        ErrorRecord::new(
                            FailureKind::Runtime,
                            format!("worker panicked: {message}"),
                            now,
                        ),
                        now,
                    );
                    rec.clone()
                };
                if let Err(err) = registry.save(&snapshot) {
                    warn!(%run_id, error = %err, "failed to persist panic record");
                }
                registry.clear_abort(&run_id);
                cache.release_job(&run_id);
            }
        })
        .map_err(StartError::Spawn)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
