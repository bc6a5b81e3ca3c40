//! Monte Carlo robustness: stationary block bootstrap over the champion's
//! bar returns.
//!
//! Geometric block lengths (mean `mean_block_len`) preserve the serial
//! dependence of financial returns; plain IID resampling would understate
//! the variance of anything autocorrelated. Each resample rebuilds a return
//! path of the original length and re-measures Sharpe and total return; the
//! percentiles of those distributions become the confidence interval, and
//! the interval becomes a grade.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use paramlab_core::data::MtfCursor;
use paramlab_core::{RunId, Timeframe, ValidationMode};

use crate::artifacts::ArtifactKind;
use crate::evaluator::EvaluationContext;
use crate::job::JobOutcome;
use crate::metrics;
use crate::report;

use super::{optimize_slice, PipelineError, RunContext, SliceProgress};

/// Abort checks and heartbeats happen every this many resamples.
const RESAMPLE_BATCH: u32 = 100;

/// Minimum champion trades and bar returns for the bootstrap to say
/// anything; below either bound the grade is `Insufficient`.
const MIN_TRADES: u32 = 5;
const MIN_RETURNS: usize = 30;

/// How much confidence the resampled Sharpe distribution supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfidenceGrade {
    /// CI lower bound strongly positive (> 0.5) and narrow (width < 3).
    High,
    /// CI lower bound positive and moderately wide (width < 5).
    Medium,
    /// Wide interval or a lower bound at or below zero.
    Low,
    /// Too few trades or returns to resample meaningfully.
    Insufficient,
}

impl ConfidenceGrade {
    pub fn label(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Insufficient => "insufficient",
        }
    }
}

/// One bootstrap resample's statistics; the distribution artifact is a CSV
/// of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResampleRow {
    pub resample: u32,
    pub sharpe: f64,
    pub total_return: f64,
}

#[derive(Debug, Serialize)]
struct MonteCarloReport<'a> {
    run_id: &'a RunId,
    symbol: &'a str,
    params: std::collections::BTreeMap<String, String>,
    grade: ConfidenceGrade,
    sharpe_ci_lower: f64,
    sharpe_ci_upper: f64,
    sharpe_median: f64,
    ci_width: f64,
    return_median: f64,
    resamples: u32,
    sample_size: usize,
    seed: u64,
}

/// One stationary block bootstrap resample: geometric block lengths with
/// parameter `p`, wrapping around the end of the series.
fn resample_stationary_block(
    returns: &[f64],
    target_len: usize,
    p: f64,
    rng: &mut StdRng,
) -> Vec<f64> {
    let n = returns.len();
    let mut resampled = Vec::with_capacity(target_len);
    let mut pos = rng.gen_range(0..n);
    for _ in 0..target_len {
        resampled.push(returns[pos]);
        if rng.gen::<f64>() < p {
            pos = rng.gen_range(0..n);
        } else {
            pos = (pos + 1) % n;
        }
    }
    resampled
}

fn sharpe_of_returns(returns: &[f64], timeframe: Timeframe) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let mean = metrics::mean_f64(returns);
    let std = metrics::std_dev(returns);
    if std < 1e-15 {
        return 0.0;
    }
    (mean / std) * metrics::periods_per_year(timeframe).sqrt()
}

fn compound_return(returns: &[f64]) -> f64 {
    returns.iter().fold(1.0, |acc, r| acc * (1.0 + r)) - 1.0
}

/// Thresholds sized for the naturally wide intervals a block bootstrap
/// produces compared to IID resampling.
fn assign_grade(ci_lower: f64, ci_width: f64) -> ConfidenceGrade {
    if ci_lower > 0.5 && ci_width < 3.0 {
        ConfidenceGrade::High
    } else if ci_lower > 0.0 && ci_width < 5.0 {
        ConfidenceGrade::Medium
    } else {
        ConfidenceGrade::Low
    }
}

pub fn run(ctx: &mut RunContext) -> Result<JobOutcome, PipelineError> {
    let symbol = ctx.spec.symbols[0].clone();
    let total = ctx.compiled.combination_count();
    ctx.lock_record().progress.combinations_total = total;

    ctx.publish_phase(2.0, "loading", format!("loading {symbol}"))?;
    let dataset = ctx.load_symbol(&symbol)?;
    let htf = ctx.htf_series(&dataset)?;

    // Find the champion first: grid-search when dimensions are enabled,
    // otherwise the pinned defaults are the champion.
    let slice = optimize_slice(
        ctx,
        &symbol,
        dataset.candles(),
        htf.as_ref(),
        1,
        &SliceProgress {
            phase: "optimizing",
            percent_start: 5.0,
            percent_span: 50.0,
            counter_base: 0,
            counter_total: total,
        },
    )?;
    let mut evaluated = slice.evaluated;
    let mut failed = slice.failed;
    let mut lookahead_violations = slice.lookahead_violations;
    let failures = slice.failures;
    let Some(champion) = slice.top.into_sorted().into_iter().next() else {
        return Err(PipelineError::Runtime(
            "no combination survived champion selection".to_string(),
        ));
    };

    // Full replay of the champion for its equity curve and trade log.
    let evaluator = Arc::clone(&ctx.evaluator);
    let initial_capital = ctx.spec.initial_capital;
    let timeframe = ctx.spec.timeframe;
    let strict = ctx.spec.validation.mode == ValidationMode::Strict;
    let mut eval_ctx =
        EvaluationContext::new(&symbol, timeframe, dataset.candles(), &mut ctx.gate)
            .with_initial_capital(initial_capital);
    if let Some(series) = &htf {
        eval_ctx = eval_ctx.with_htf(MtfCursor::new(series));
    }
    let replayed = evaluator.replay(&mut eval_ctx, &champion.params);
    let violations = eval_ctx.lookahead_violations();
    drop(eval_ctx);
    lookahead_violations += violations;
    if strict && violations > 0 {
        return Err(PipelineError::Validation(format!(
            "champion replay read {violations} unclosed higher-timeframe candle(s)"
        )));
    }
    evaluated += 1;
    let evaluation = match replayed {
        Ok(evaluation) => evaluation,
        Err(err) => {
            failed += 1;
            return Err(PipelineError::Runtime(format!(
                "champion replay failed: {err}"
            )));
        }
    };

    let curve: Vec<f64> = evaluation.equity.iter().map(|p| p.equity).collect();
    let returns = metrics::bar_returns(&curve);
    let resamples = ctx.spec.monte_carlo.resamples;
    let seed = ctx.spec.seed.unwrap_or(42);

    let mut rows: Vec<ResampleRow> = Vec::new();
    let (grade, sharpe_ci_lower, sharpe_ci_upper, sharpe_median, return_median);
    if evaluation.metrics.trade_count < MIN_TRADES || returns.len() < MIN_RETURNS {
        grade = ConfidenceGrade::Insufficient;
        sharpe_ci_lower = 0.0;
        sharpe_ci_upper = 0.0;
        sharpe_median = 0.0;
        return_median = 0.0;
    } else {
        let p = 1.0 / ctx.spec.monte_carlo.mean_block_len.max(1) as f64;
        let mut rng = StdRng::seed_from_u64(seed);
        let mut sharpes = Vec::with_capacity(resamples as usize);
        let mut total_returns = Vec::with_capacity(resamples as usize);
        for i in 0..resamples {
            let resampled = resample_stationary_block(&returns, returns.len(), p, &mut rng);
            let sharpe = sharpe_of_returns(&resampled, timeframe);
            let total_return = compound_return(&resampled);
            if sharpe.is_finite() && total_return.is_finite() {
                rows.push(ResampleRow {
                    resample: i,
                    sharpe,
                    total_return,
                });
                sharpes.push(sharpe);
                total_returns.push(total_return);
            }
            if (i + 1) % RESAMPLE_BATCH == 0 {
                ctx.publish_phase(
                    55.0 + 40.0 * (i + 1) as f64 / resamples as f64,
                    "resampling",
                    format!("resample {}/{resamples}", i + 1),
                )?;
                std::thread::yield_now();
            }
        }
        sharpes.sort_by(|a, b| a.total_cmp(b));
        total_returns.sort_by(|a, b| a.total_cmp(b));
        sharpe_ci_lower = metrics::percentile(&sharpes, 0.05);
        sharpe_ci_upper = metrics::percentile(&sharpes, 0.95);
        sharpe_median = metrics::percentile(&sharpes, 0.50);
        return_median = metrics::percentile(&total_returns, 0.50);
        grade = assign_grade(sharpe_ci_lower, sharpe_ci_upper - sharpe_ci_lower);
    }

    ctx.publish_phase(96.0, "finalizing", "writing artifacts")?;
    let report_doc = MonteCarloReport {
        run_id: &ctx.run_id,
        symbol: &symbol,
        params: ctx.compiled.render(&champion.params),
        grade,
        sharpe_ci_lower,
        sharpe_ci_upper,
        sharpe_median,
        ci_width: sharpe_ci_upper - sharpe_ci_lower,
        return_median,
        resamples,
        sample_size: returns.len(),
        seed,
    };
    let mut artifacts = vec![
        ctx.artifacts
            .save_csv(&ctx.run_id, ArtifactKind::Distribution, &rows)?,
        ctx.artifacts
            .save_json(&ctx.run_id, ArtifactKind::Report, &report_doc)?,
    ];

    let mut outcome = JobOutcome {
        top_n: vec![champion],
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
    summary.push_str("## Monte Carlo\n\n");
    summary.push_str("| Field | Value |\n");
    summary.push_str("| --- | --- |\n");
    summary.push_str(&format!("| Grade | {} |\n", grade.label()));
    summary.push_str(&format!(
        "| Sharpe 90% CI | [{sharpe_ci_lower:.3}, {sharpe_ci_upper:.3}] |\n"
    ));
    summary.push_str(&format!("| Sharpe Median | {sharpe_median:.3} |\n"));
    summary.push_str(&format!(
        "| Return Median | {:.2}% |\n",
        return_median * 100.0
    ));
    summary.push_str(&format!("| Resamples | {resamples} |\n"));
    summary.push_str(&format!("| Seed | {seed} |\n"));
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
