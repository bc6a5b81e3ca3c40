//! The five research pipelines and their shared execution plumbing.
//!
//! A pipeline is a plain function from a [`RunContext`] to a [`JobOutcome`].
//! The queue owns the worker thread; [`execute`] dispatches on the job kind,
//! finalizes the durable record on every exit path, and releases the job's
//! cached datasets afterwards.

pub mod grid_search;
pub mod monte_carlo;
pub mod portfolio;
pub mod regime;
pub mod walk_forward;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use paramlab_core::data::{HtfSeries, MtfCursor};
use paramlab_core::guard::IsolationError;
use paramlab_core::{
    Candle, CandleDataset, CombinationResult, DatasetKey, ObjectiveSet, RunId, TopNResultStore,
    ValidationMode, YieldGate,
};

use crate::artifacts::{ArtifactError, ArtifactStore};
use crate::candle_cache::CandleDataCache;
use crate::config::{CompiledSpace, JobSpec, SpecError};
use crate::evaluator::{EvaluationContext, StrategyEvaluator};
use crate::job::{
    ErrorRecord, FailureKind, FailureNote, JobRecord, PipelineKind, ProgressSnapshot,
};
use crate::registry::{JobRegistry, RegistryError};
use crate::report;
use crate::store::StoreError;

/// Failure notes kept per run; everything past this is counted but dropped.
const MAX_FAILURE_NOTES: usize = 50;

/// Combinations evaluated before the failure-rate cap starts to bite, so a
/// couple of early losers cannot kill a large run.
const FAILURE_GRACE: u64 = 20;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("job aborted")]
    Aborted,
    #[error("validation failed: {0}")]
    Validation(String),
    #[error(transparent)]
    Isolation(#[from] IsolationError),
    #[error("{failed} of {evaluated} combinations failed; run looks systemically broken")]
    FailureRateExceeded { failed: u64, evaluated: u64 },
    #[error(transparent)]
    Spec(#[from] SpecError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("{0}")]
    Runtime(String),
}

impl PipelineError {
    /// Taxonomy bucket recorded on the terminal job record.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Aborted => FailureKind::Runtime,
            Self::Validation(_) => FailureKind::Validation,
            Self::Isolation(_) => FailureKind::Isolation,
            Self::FailureRateExceeded { .. } => FailureKind::Runtime,
            Self::Spec(_) => FailureKind::Precondition,
            Self::Store(_) => FailureKind::Precondition,
            Self::Artifact(_) => FailureKind::Runtime,
            Self::Registry(_) => FailureKind::Runtime,
            Self::Runtime(_) => FailureKind::Runtime,
        }
    }
}

/// Everything a worker thread needs to run one job.
pub struct RunContext {
    pub run_id: RunId,
    pub spec: JobSpec,
    pub compiled: CompiledSpace,
    pub objectives: ObjectiveSet,
    pub registry: Arc<JobRegistry>,
    pub artifacts: Arc<ArtifactStore>,
    pub cache: Arc<CandleDataCache>,
    pub evaluator: Arc<dyn StrategyEvaluator>,
    /// Shared with the queue so `status()` stays O(1).
    pub record: Arc<Mutex<JobRecord>>,
    pub cancel: Arc<AtomicBool>,
    pub gate: YieldGate,
}

impl RunContext {
    fn lock_record(&self) -> MutexGuard<'_, JobRecord> {
        self.record.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Best-effort write of the current record to the registry. Finalization
    /// must never panic, so persistence failures only log.
    fn persist_record(&self) {
        let snapshot = self.lock_record().clone();
        if let Err(err) = self.registry.save(&snapshot) {
            warn!(run_id = %self.run_id, error = %err, "failed to persist job record");
        }
    }

    /// Publish a phase transition (loading, resampling, finalizing).
    /// Honors pending abort requests before doing anything else.
    pub fn publish_phase(
        &self,
        percent: f64,
        phase: &str,
        message: impl Into<String>,
    ) -> Result<(), PipelineError> {
        if self.cancel.load(Ordering::SeqCst) || self.registry.abort_requested(&self.run_id) {
            return Err(PipelineError::Aborted);
        }
        let now = Utc::now().naive_utc();
        let snapshot = {
            let mut record = self.lock_record();
            let done = record.progress.combinations_done;
            let total = record.progress.combinations_total;
            record.beat(ProgressSnapshot::at(percent, phase, message, done, total), now);
            record.clone()
        };
        self.registry.save(&snapshot)?;
        Ok(())
    }

    /// Per-combination checkpoint. The cancel flag is checked every call;
    /// the heavier work (abort marker probe, heartbeat persistence, thread
    /// yield) happens once per combination batch.
    pub fn checkpoint(
        &mut self,
        percent: f64,
        phase: &str,
        done: u64,
        total: u64,
    ) -> Result<(), PipelineError> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(PipelineError::Aborted);
        }
        if !self.gate.tick_combination() {
            return Ok(());
        }
        if self.registry.abort_requested(&self.run_id) {
            self.cancel.store(true, Ordering::SeqCst);
            return Err(PipelineError::Aborted);
        }
        let now = Utc::now().naive_utc();
        let snapshot = {
            let mut record = self.lock_record();
            record.beat(
                ProgressSnapshot::at(
                    percent,
                    phase,
                    format!("{done}/{total} combinations"),
                    done,
                    total,
                ),
                now,
            );
            record.clone()
        };
        self.registry.save(&snapshot)?;
        std::thread::yield_now();
        Ok(())
    }

    /// Load one symbol's candles for the job window through the shared cache.
    pub fn load_symbol(&self, symbol: &str) -> Result<Arc<CandleDataset>, PipelineError> {
        let key = DatasetKey {
            symbol: symbol.to_string(),
            timeframe: self.spec.timeframe,
            range: self.spec.range()?,
        };
        let dataset = self
            .cache
            .get_or_load(&self.run_id, &key, self.spec.validation.mode)?;
        Ok(dataset)
    }

    /// Resampled confirmation series when the spec pins a higher timeframe.
    pub fn htf_series(&self, dataset: &CandleDataset) -> Result<Option<HtfSeries>, PipelineError> {
        match self.spec.validation.higher_timeframe {
            Some(tf) => HtfSeries::from_base(dataset, tf)
                .map(Some)
                .map_err(|e| PipelineError::Validation(e.to_string())),
            None => Ok(None),
        }
    }
}

/// Run one job to a terminal state. Called on the worker thread; never
/// returns an error because every failure ends up on the job record.
pub fn execute(mut ctx: RunContext) {
    let started = Utc::now().naive_utc();
    ctx.lock_record().mark_running(started);
    ctx.persist_record();
    info!(run_id = %ctx.run_id, kind = %ctx.spec.kind, "job running");

    let result = match ctx.spec.kind {
        PipelineKind::GridSearch => grid_search::run(&mut ctx),
        PipelineKind::WalkForward => walk_forward::run(&mut ctx),
        PipelineKind::MonteCarlo => monte_carlo::run(&mut ctx),
        PipelineKind::Portfolio => portfolio::run(&mut ctx),
        PipelineKind::Regime => regime::run(&mut ctx),
    };

    let finished = Utc::now().naive_utc();
    match result {
        Ok(outcome) => {
            info!(
                run_id = %ctx.run_id,
                evaluated = outcome.evaluated,
                failed = outcome.failed,
                "job completed"
            );
            ctx.lock_record().mark_completed(outcome, finished);
        }
        Err(PipelineError::Aborted) => {
            info!(run_id = %ctx.run_id, "job aborted");
            ctx.lock_record().mark_aborted(finished);
        }
        Err(err) => {
            warn!(run_id = %ctx.run_id, error = %err, "job failed");
            ctx.lock_record().mark_error(
                ErrorRecord::new(err.failure_kind(), err.to_string(), finished),
                finished,
            );
        }
    }
    ctx.persist_record();
    ctx.registry.clear_abort(&ctx.run_id);
    ctx.cache.release_job(&ctx.run_id);
}

/// Where a slice optimization sits inside the whole job, for progress
/// reporting: percent window plus combination counter offsets.
pub struct SliceProgress<'a> {
    pub phase: &'a str,
    pub percent_start: f64,
    pub percent_span: f64,
    pub counter_base: u64,
    pub counter_total: u64,
}

/// What one slice optimization produced.
#[derive(Debug)]
pub struct SliceOptimization {
    pub top: TopNResultStore,
    pub evaluated: u64,
    pub failed: u64,
    pub failures: Vec<FailureNote>,
    pub lookahead_violations: u64,
}

/// Evaluate every compiled combination against one candle slice, keeping
/// the best `capacity` results.
///
/// Failed combinations are skipped and noted; the run only dies when the
/// failure rate crosses the configured cap (after a small grace window) or,
/// in strict validation mode, on the first lookahead violation.
pub fn optimize_slice(
    ctx: &mut RunContext,
    symbol: &str,
    candles: &[Candle],
    htf: Option<&HtfSeries>,
    capacity: usize,
    progress: &SliceProgress<'_>,
) -> Result<SliceOptimization, PipelineError> {
    let evaluator = Arc::clone(&ctx.evaluator);
    let total = ctx.compiled.combination_count();
    let strict = ctx.spec.validation.mode == ValidationMode::Strict;
    let max_failure_rate = ctx.spec.limits.max_failure_rate;
    let initial_capital = ctx.spec.initial_capital;
    let timeframe = ctx.spec.timeframe;

    let mut top = TopNResultStore::new(capacity);
    let mut evaluated = 0u64;
    let mut failed = 0u64;
    let mut failures = Vec::new();
    let mut lookahead_violations = 0u64;

    for index in 0..total {
        let Some(params) = ctx.compiled.combination_at(index) else {
            break;
        };

        let mut eval_ctx = EvaluationContext::new(symbol, timeframe, candles, &mut ctx.gate)
            .with_initial_capital(initial_capital);
        if let Some(series) = htf {
            eval_ctx = eval_ctx.with_htf(MtfCursor::new(series));
        }
        let outcome = evaluator.evaluate(&mut eval_ctx, &params);
        let violations = eval_ctx.lookahead_violations();
        drop(eval_ctx);

        lookahead_violations += violations;
        if strict && violations > 0 {
            return Err(PipelineError::Validation(format!(
                "combination {index} read {violations} unclosed higher-timeframe candle(s)"
            )));
        }

        evaluated += 1;
        match outcome {
            Ok(metrics) => {
                let score = ctx.objectives.score(&metrics);
                top.offer(CombinationResult {
                    index,
                    params,
                    metrics,
                    score,
                });
            }
            Err(err) => {
                failed += 1;
                if failures.len() < MAX_FAILURE_NOTES {
                    failures.push(FailureNote {
                        index,
                        params: report::params_label(&ctx.compiled, &params),
                        error: err.to_string(),
                    });
                }
                if evaluated >= FAILURE_GRACE
                    && failed as f64 / evaluated as f64 > max_failure_rate
                {
                    return Err(PipelineError::FailureRateExceeded { failed, evaluated });
                }
            }
        }

        let fraction = (index + 1) as f64 / total.max(1) as f64;
        ctx.checkpoint(
            progress.percent_start + fraction * progress.percent_span,
            progress.phase,
            progress.counter_base + index + 1,
            progress.counter_total,
        )?;
    }

    Ok(SliceOptimization {
        top,
        evaluated,
        failed,
        failures,
        lookahead_violations,
    })
}
