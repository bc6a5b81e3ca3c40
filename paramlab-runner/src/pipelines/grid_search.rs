//! Exhaustive grid search: every enabled combination against one symbol,
//! ranked by the robustness score.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use paramlab_core::data::MtfCursor;
use paramlab_core::{EvaluationMetrics, RunId};

use crate::artifacts::ArtifactKind;
use crate::evaluator::EvaluationContext;
use crate::job::{FailureNote, JobOutcome};
use crate::report;

use super::{optimize_slice, PipelineError, RunContext, SliceProgress};

/// One ranked row of the report artifact, with grid values rendered back to
/// their human form.
#[derive(Debug, Serialize)]
struct ReportRow {
    rank: usize,
    index: u64,
    score: f64,
    params: BTreeMap<String, String>,
    metrics: EvaluationMetrics,
}

#[derive(Debug, Serialize)]
struct GridReport<'a> {
    run_id: &'a RunId,
    symbol: &'a str,
    evaluated: u64,
    failed: u64,
    lookahead_violations: u64,
    results: Vec<ReportRow>,
    failures: &'a [FailureNote],
}

pub fn run(ctx: &mut RunContext) -> Result<JobOutcome, PipelineError> {
    let symbol = ctx.spec.symbols[0].clone();
    let total = ctx.compiled.combination_count();
    ctx.lock_record().progress.combinations_total = total;

    ctx.publish_phase(2.0, "loading", format!("loading {symbol}"))?;
    let dataset = ctx.load_symbol(&symbol)?;
    let htf = ctx.htf_series(&dataset)?;

    let capacity = ctx.spec.limits.top_n;
    let slice = optimize_slice(
        ctx,
        &symbol,
        dataset.candles(),
        htf.as_ref(),
        capacity,
        &SliceProgress {
            phase: "optimizing",
            percent_start: 5.0,
            percent_span: 90.0,
            counter_base: 0,
            counter_total: total,
        },
    )?;

    ctx.publish_phase(95.0, "finalizing", "writing artifacts")?;
    let results = slice.top.into_sorted();
    let mut artifacts = Vec::new();

    // Replay the champion once more for the trade log and equity curve.
    if let Some(champion) = results.first() {
        let evaluator = Arc::clone(&ctx.evaluator);
        let initial_capital = ctx.spec.initial_capital;
        let timeframe = ctx.spec.timeframe;
        let mut eval_ctx =
            EvaluationContext::new(&symbol, timeframe, dataset.candles(), &mut ctx.gate)
                .with_initial_capital(initial_capital);
        if let Some(series) = &htf {
            eval_ctx = eval_ctx.with_htf(MtfCursor::new(series));
        }
        let replayed = evaluator.replay(&mut eval_ctx, &champion.params);
        drop(eval_ctx);
        match replayed {
            Ok(evaluation) => {
                artifacts.push(ctx.artifacts.save_csv(
                    &ctx.run_id,
                    ArtifactKind::Trades,
                    &evaluation.trades,
                )?);
                artifacts.push(ctx.artifacts.save_csv(
                    &ctx.run_id,
                    ArtifactKind::Equity,
                    &evaluation.equity,
                )?);
            }
            Err(err) => {
                warn!(run_id = %ctx.run_id, error = %err, "champion replay failed");
            }
        }
    }

    let report_doc = GridReport {
        run_id: &ctx.run_id,
        symbol: &symbol,
        evaluated: slice.evaluated,
        failed: slice.failed,
        lookahead_violations: slice.lookahead_violations,
        results: results
            .iter()
            .enumerate()
            .map(|(i, r)| ReportRow {
                rank: i + 1,
                index: r.index,
                score: r.score,
                params: ctx.compiled.render(&r.params),
                metrics: r.metrics,
            })
            .collect(),
        failures: &slice.failures,
    };
    artifacts.push(
        ctx.artifacts
            .save_json(&ctx.run_id, ArtifactKind::Report, &report_doc)?,
    );

    let mut outcome = JobOutcome {
        top_n: results,
        artifacts: Vec::new(),
        evaluated: slice.evaluated,
        failed: slice.failed,
        lookahead_violations: slice.lookahead_violations,
    };

    let summary = report::summary_report(
        &ctx.run_id,
        ctx.evaluator.name(),
        &ctx.spec,
        &ctx.compiled,
        &outcome,
        &slice.failures,
    );
    artifacts.push(ctx.artifacts.save_bytes(
        &ctx.run_id,
        ArtifactKind::Summary,
        summary.as_bytes(),
    )?);

    let manifest = ctx.artifacts.write_manifest(&ctx.run_id, &artifacts)?;
    artifacts.push(manifest);
    outcome.artifacts = artifacts;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::*;
    use crate::artifacts::ArtifactRef;
    use crate::job::JobStatus;

    #[test]
    fn grid_run_ranks_the_whole_space() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = grid_context(dir.path());
        let outcome = run(&mut ctx).unwrap();

        assert_eq!(outcome.evaluated, 9);
        assert_eq!(outcome.failed, 0);
        assert!(!outcome.top_n.is_empty());
        assert!(outcome
            .top_n
            .windows(2)
            .all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn grid_run_writes_the_artifact_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = grid_context(dir.path());
        let outcome = run(&mut ctx).unwrap();

        let kinds: Vec<ArtifactKind> = outcome.artifacts.iter().map(|a| a.kind).collect();
        assert!(kinds.contains(&ArtifactKind::Trades));
        assert!(kinds.contains(&ArtifactKind::Equity));
        assert!(kinds.contains(&ArtifactKind::Report));
        assert!(kinds.contains(&ArtifactKind::Summary));
        assert!(kinds.contains(&ArtifactKind::Manifest));
        for artifact in &outcome.artifacts {
            assert!(ctx.artifacts.exists(&artifact.reference));
        }
    }

    #[test]
    fn execute_finalizes_the_record_as_completed() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = grid_context(dir.path());
        let registry = Arc::clone(&ctx.registry);
        let run_id = ctx.run_id.clone();

        super::super::execute(ctx);

        let record = registry.load(&run_id).unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        let outcome = record.outcome.unwrap();
        assert_eq!(outcome.evaluated, 9);
        assert_eq!(record.progress.percent, 100.0);
        assert!(record.finished_at.is_some());
    }

    #[test]
    fn report_artifact_round_trips_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = grid_context(dir.path());
        let outcome = run(&mut ctx).unwrap();

        let report_ref = outcome
            .artifacts
            .iter()
            .find(|a| a.kind == ArtifactKind::Report)
            .unwrap();
        let bytes = ctx.artifacts.load_bytes(&report_ref.reference).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["evaluated"], 9);
        assert_eq!(value["results"].as_array().unwrap().len(), outcome.top_n.len());
        assert!(value["results"][0]["params"]["fast"].is_string());
    }
}
