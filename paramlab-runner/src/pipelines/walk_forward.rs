//! Walk-forward validation: rolling in-sample/out-of-sample folds.
//!
//! Each fold optimizes the grid on its in-sample bars, then re-scores that
//! fold's champion on the adjacent unseen out-of-sample bars. The aggregate
//! degradation ratio (mean OOS Sharpe over mean IS Sharpe) is the overfit
//! detector: a parameter set that only shines in-sample degrades hard.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use paramlab_core::data::MtfCursor;
use paramlab_core::{CombinationResult, RunId, ValidationMode};

use crate::artifacts::ArtifactKind;
use crate::config::ValidationSpec;
use crate::evaluator::EvaluationContext;
use crate::job::{FailureNote, JobOutcome};
use crate::metrics;
use crate::report;

use super::{optimize_slice, PipelineError, RunContext, SliceProgress};

/// Bar index ranges of one fold; IS and OOS are adjacent half-open ranges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoldSpec {
    pub fold_index: usize,
    pub is_start: usize,
    pub is_end: usize,
    pub oos_start: usize,
    pub oos_end: usize,
}

/// How the degradation ratio was computed (or why it was not).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DegradationFlag {
    /// IS Sharpe >= 0.1; ratio = OOS / IS.
    Normal,
    /// IS Sharpe in [0, 0.1); the ratio would explode, so the value is the
    /// difference OOS - IS instead.
    LowIsSharpe,
    /// IS Sharpe negative; no meaningful ratio.
    NegativeIsSharpe,
    /// Healthy IS but negative OOS, the canonical overfit signature;
    /// clamped to 0.
    FailedOos,
}

impl DegradationFlag {
    pub fn label(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::LowIsSharpe => "low_is_sharpe",
            Self::NegativeIsSharpe => "negative_is_sharpe",
            Self::FailedOos => "failed_oos",
        }
    }
}

/// One validated fold: the in-sample champion re-scored out-of-sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoldRow {
    pub fold_index: usize,
    pub params: String,
    pub is_sharpe: f64,
    pub oos_sharpe: f64,
    pub is_trades: u32,
    pub oos_trades: u32,
    pub oos_score: f64,
}

#[derive(Debug, Serialize)]
struct WalkForwardReport<'a> {
    run_id: &'a RunId,
    symbol: &'a str,
    truncated: bool,
    folds: &'a [FoldRow],
    mean_is_sharpe: f64,
    mean_oos_sharpe: f64,
    degradation_ratio: Option<f64>,
    degradation_flag: Option<DegradationFlag>,
    evaluated: u64,
    failed: u64,
}

/// Rolling fold layout over `total_bars`.
///
/// Folds advance by the configured step until the out-of-sample window runs
/// past the data. When not even one full fold fits, strict mode fails the
/// run; lenient mode shrinks a single fold proportionally into whatever
/// bars exist and flags the result as truncated.
pub fn plan_folds(
    total_bars: usize,
    validation: &ValidationSpec,
) -> Result<(Vec<FoldSpec>, bool), PipelineError> {
    let is_bars = validation.in_sample_bars;
    let oos_bars = validation.out_of_sample_bars;
    let step = validation.effective_step();

    let mut folds = Vec::new();
    let mut index = 0usize;
    loop {
        let is_start = index * step;
        let is_end = is_start + is_bars;
        let oos_end = is_end + oos_bars;
        if oos_end > total_bars {
            break;
        }
        folds.push(FoldSpec {
            fold_index: index,
            is_start,
            is_end,
            oos_start: is_end,
            oos_end,
        });
        index += 1;
    }
    if !folds.is_empty() {
        return Ok((folds, false));
    }

    match validation.mode {
        ValidationMode::Strict => Err(PipelineError::Validation(format!(
            "{total_bars} bars cannot fit one fold of {is_bars}+{oos_bars} bars"
        ))),
        ValidationMode::Lenient => {
            if total_bars < 4 {
                return Err(PipelineError::Validation(format!(
                    "{total_bars} bars is too little even for a truncated fold"
                )));
            }
            let ratio = is_bars as f64 / (is_bars + oos_bars) as f64;
            let is_end = ((total_bars as f64 * ratio) as usize).clamp(2, total_bars - 2);
            Ok((
                vec![FoldSpec {
                    fold_index: 0,
                    is_start: 0,
                    is_end,
                    oos_start: is_end,
                    oos_end: total_bars,
                }],
                true,
            ))
        }
    }
}

/// Degradation with the usual edge cases:
/// - IS >= 0.1: ratio = OOS / IS
/// - 0 <= IS < 0.1: difference OOS - IS
/// - IS < 0: no ratio
/// - IS >= 0.1 but OOS < 0: clamped to 0
pub fn degradation_ratio(mean_is: f64, mean_oos: f64) -> (Option<f64>, DegradationFlag) {
    if mean_is < 0.0 {
        (None, DegradationFlag::NegativeIsSharpe)
    } else if mean_is < 0.1 {
        (Some(mean_oos - mean_is), DegradationFlag::LowIsSharpe)
    } else if mean_oos < 0.0 {
        (Some(0.0), DegradationFlag::FailedOos)
    } else {
        (Some(mean_oos / mean_is), DegradationFlag::Normal)
    }
}

fn merge_failures(into: &mut Vec<FailureNote>, mut fresh: Vec<FailureNote>) {
    let room = super::MAX_FAILURE_NOTES.saturating_sub(into.len());
    fresh.truncate(room);
    into.append(&mut fresh);
}

pub fn run(ctx: &mut RunContext) -> Result<JobOutcome, PipelineError> {
    let symbol = ctx.spec.symbols[0].clone();
    ctx.publish_phase(2.0, "loading", format!("loading {symbol}"))?;
    let dataset = ctx.load_symbol(&symbol)?;
    let htf = ctx.htf_series(&dataset)?;
    let candles = dataset.candles();

    let (folds, truncated) = plan_folds(candles.len(), &ctx.spec.validation)?;
    if truncated {
        warn!(
            run_id = %ctx.run_id,
            bars = candles.len(),
            "window shorter than one full fold; validating one truncated fold"
        );
    }

    let combos = ctx.compiled.combination_count();
    let total_units = (combos + 1) * folds.len() as u64;
    ctx.lock_record().progress.combinations_total = total_units;

    let strict = ctx.spec.validation.mode == ValidationMode::Strict;
    let initial_capital = ctx.spec.initial_capital;
    let timeframe = ctx.spec.timeframe;

    let mut fold_rows: Vec<FoldRow> = Vec::new();
    let mut champions: Vec<CombinationResult> = Vec::new();
    let mut evaluated = 0u64;
    let mut failed = 0u64;
    let mut failures: Vec<FailureNote> = Vec::new();
    let mut lookahead_violations = 0u64;

    let span_per_fold = 90.0 / folds.len() as f64;
    for fold in &folds {
        let is_slice = &candles[fold.is_start..fold.is_end];
        let oos_slice = &candles[fold.oos_start..fold.oos_end];

        let slice = optimize_slice(
            ctx,
            &symbol,
            is_slice,
            htf.as_ref(),
            1,
            &SliceProgress {
                phase: "optimizing",
                percent_start: 5.0 + fold.fold_index as f64 * span_per_fold,
                percent_span: span_per_fold * 0.9,
                counter_base: fold.fold_index as u64 * (combos + 1),
                counter_total: total_units,
            },
        )?;
        evaluated += slice.evaluated;
        failed += slice.failed;
        lookahead_violations += slice.lookahead_violations;
        merge_failures(&mut failures, slice.failures);

        let Some(champion) = slice.top.into_sorted().into_iter().next() else {
            continue;
        };

        let evaluator = Arc::clone(&ctx.evaluator);
        let mut eval_ctx =
            EvaluationContext::new(&symbol, timeframe, oos_slice, &mut ctx.gate)
                .with_initial_capital(initial_capital);
        if let Some(series) = &htf {
            eval_ctx = eval_ctx.with_htf(MtfCursor::new(series));
        }
        let outcome = evaluator.evaluate(&mut eval_ctx, &champion.params);
        let violations = eval_ctx.lookahead_violations();
        drop(eval_ctx);

        lookahead_violations += violations;
        if strict && violations > 0 {
            return Err(PipelineError::Validation(format!(
                "fold {} champion read {violations} unclosed higher-timeframe candle(s) out-of-sample",
                fold.fold_index
            )));
        }

        evaluated += 1;
        match outcome {
            Ok(oos_metrics) => {
                let oos_score = ctx.objectives.score(&oos_metrics);
                fold_rows.push(FoldRow {
                    fold_index: fold.fold_index,
                    params: report::params_label(&ctx.compiled, &champion.params),
                    is_sharpe: champion.metrics.sharpe,
                    oos_sharpe: oos_metrics.sharpe,
                    is_trades: champion.metrics.trade_count,
                    oos_trades: oos_metrics.trade_count,
                    oos_score,
                });
                champions.push(CombinationResult {
                    index: champion.index,
                    params: champion.params,
                    metrics: oos_metrics,
                    score: oos_score,
                });
            }
            Err(err) => {
                failed += 1;
                if failures.len() < super::MAX_FAILURE_NOTES {
                    failures.push(FailureNote {
                        index: champion.index,
                        params: report::params_label(&ctx.compiled, &champion.params),
                        error: format!("out-of-sample fold {}: {err}", fold.fold_index),
                    });
                }
            }
        }
    }

    ctx.publish_phase(95.0, "finalizing", "writing artifacts")?;

    let is_sharpes: Vec<f64> = fold_rows.iter().map(|f| f.is_sharpe).collect();
    let oos_sharpes: Vec<f64> = fold_rows.iter().map(|f| f.oos_sharpe).collect();
    let mean_is_sharpe = metrics::mean_f64(&is_sharpes);
    let mean_oos_sharpe = metrics::mean_f64(&oos_sharpes);
    let (ratio, flag) = if fold_rows.is_empty() {
        (None, None)
    } else {
        let (ratio, flag) = degradation_ratio(mean_is_sharpe, mean_oos_sharpe);
        (ratio, Some(flag))
    };

    champions.sort_by(|a, b| b.score.total_cmp(&a.score));
    champions.truncate(ctx.spec.limits.top_n);

    let report_doc = WalkForwardReport {
        run_id: &ctx.run_id,
        symbol: &symbol,
        truncated,
        folds: &fold_rows,
        mean_is_sharpe,
        mean_oos_sharpe,
        degradation_ratio: ratio,
        degradation_flag: flag,
        evaluated,
        failed,
    };
    let mut artifacts = vec![
        ctx.artifacts
            .save_csv(&ctx.run_id, ArtifactKind::Folds, &fold_rows)?,
        ctx.artifacts
            .save_json(&ctx.run_id, ArtifactKind::Report, &report_doc)?,
    ];

    let mut outcome = JobOutcome {
        top_n: champions,
        artifacts: Vec::new(),
        evaluated,
        failed,
        lookahead_violations,
    };

    let mut summary = report::summary_report(
        &ctx.run_id,
        ctx.evaluator.name(),
        &ctx.spec,
        &ctx.compiled,
        &outcome,
        &failures,
    );
    summary.push_str("## Degradation\n\n");
    summary.push_str("| Field | Value |\n");
    summary.push_str("| --- | --- |\n");
    summary.push_str(&format!("| Folds | {} |\n", fold_rows.len()));
    if truncated {
        summary.push_str("| Window | **TRUNCATED** |\n");
    }
    summary.push_str(&format!("| Mean IS Sharpe | {mean_is_sharpe:.3} |\n"));
    summary.push_str(&format!("| Mean OOS Sharpe | {mean_oos_sharpe:.3} |\n"));
    match (ratio, flag) {
        (Some(value), Some(flag)) => {
            summary.push_str(&format!(
                "| Degradation | {value:.3} ({}) |\n",
                flag.label()
            ));
        }
        (None, Some(flag)) => {
            summary.push_str(&format!("| Degradation | n/a ({}) |\n", flag.label()));
        }
        _ => {
            summary.push_str("| Degradation | n/a |\n");
        }
    }
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
