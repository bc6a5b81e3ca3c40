//! ParamLab Runner : job orchestration over the core lab components.
//!
//! This crate builds on `paramlab-core` to provide:
//! - Historical candle stores (CSV directory layout, in-memory) and the
//!   per-job dataset cache
//! - The strategy-evaluator seam plus a reference SMA-cross evaluator
//! - The five research pipelines: grid search, walk-forward, Monte Carlo,
//!   multi-asset portfolio, market-regime detection
//! - Durable job records with heartbeat-based crash inference
//! - Content-addressed run artifacts (trades, equity, reports, summaries)
//! - The optimization job queue: one worker thread per job, one active job
//!   per pipeline kind, cooperative abort

pub mod artifacts;
pub mod candle_cache;
pub mod config;
pub mod evaluator;
pub mod job;
mod metrics;
pub mod pipelines;
pub mod queue;
pub mod registry;
mod report;
pub mod store;

pub use artifacts::{ArtifactError, ArtifactKind, ArtifactRef, ArtifactStore};
pub use candle_cache::CandleDataCache;
pub use config::{
    CompiledSpace, DimensionSpec, JobSpec, LimitSpec, MonteCarloSpec, RegimeSpec, SpecError,
    ValidationSpec,
};
pub use evaluator::{
    EvalError, Evaluation, EvaluationContext, EquityPoint, SmaCrossEvaluator, StrategyEvaluator,
    TradeDirection, TradeRecord,
};
pub use job::{
    ErrorRecord, FailureKind, FailureNote, JobOutcome, JobRecord, JobStatus, PipelineKind,
    ProgressSnapshot, StatusReport,
};
pub use pipelines::{PipelineError, RunContext};
pub use queue::{OptimizationJobQueue, QueueError, StartError};
pub use registry::{JobRegistry, RegistryError, DEFAULT_STALE_AFTER_SECS};
pub use store::{seed_synthetic, CsvCandleStore, HistoricalStore, MemoryStore, StoreError};

#[cfg(test)]
mod send_sync_checks {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn job_spec_is_send_sync() {
        assert_send::<JobSpec>();
        assert_sync::<JobSpec>();
    }

    #[test]
    fn job_record_is_send_sync() {
        assert_send::<JobRecord>();
        assert_sync::<JobRecord>();
    }

    #[test]
    fn status_report_is_send_sync() {
        assert_send::<StatusReport>();
        assert_sync::<StatusReport>();
    }

    #[test]
    fn job_outcome_is_send_sync() {
        assert_send::<JobOutcome>();
        assert_sync::<JobOutcome>();
    }

    #[test]
    fn artifact_ref_is_send_sync() {
        assert_send::<ArtifactRef>();
        assert_sync::<ArtifactRef>();
    }

    #[test]
    fn stores_are_send_sync() {
        assert_send::<CsvCandleStore>();
        assert_sync::<CsvCandleStore>();
        assert_send::<MemoryStore>();
        assert_sync::<MemoryStore>();
        assert_send::<CandleDataCache>();
        assert_sync::<CandleDataCache>();
    }

    #[test]
    fn queue_is_send_sync() {
        // The queue is shared between an API thread and worker threads;
        // losing either bound silently breaks that model.
        assert_send::<OptimizationJobQueue>();
        assert_sync::<OptimizationJobQueue>();
    }

    #[test]
    fn evaluation_is_send_sync() {
        assert_send::<Evaluation>();
        assert_sync::<Evaluation>();
        assert_send::<TradeRecord>();
        assert_sync::<TradeRecord>();
    }

    #[test]
    fn errors_are_send_sync() {
        assert_send::<PipelineError>();
        assert_sync::<PipelineError>();
        assert_send::<StartError>();
        assert_sync::<StartError>();
        assert_send::<QueueError>();
        assert_sync::<QueueError>();
    }
}
