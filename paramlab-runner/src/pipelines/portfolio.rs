//! Multi-asset portfolio testing: each combination runs on every symbol,
//! and the ranked quantity is the equally weighted portfolio curve built on
//! the bars all symbols share.
//!
//! A combination that fails on any symbol fails as a whole; a parameter set
//! that only works on one market is exactly what this pipeline exists to
//! expose. The champion additionally gets a per-symbol diagnostic with
//! breadth guardrails.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::NaiveDateTime;
use serde::Serialize;
use tracing::warn;

use paramlab_core::data::{HtfSeries, MtfCursor};
use paramlab_core::{
    CandleDataset, CombinationResult, EvaluationMetrics, RunId, TopNResultStore, ValidationMode,
};

use crate::artifacts::ArtifactKind;
use crate::evaluator::{Evaluation, EvaluationContext, EquityPoint, TradeRecord};
use crate::job::{FailureNote, JobOutcome};
use crate::metrics;
use crate::report;

use super::{PipelineError, RunContext};

struct SymbolSeries {
    symbol: String,
    dataset: Arc<CandleDataset>,
    htf: Option<HtfSeries>,
}

/// Champion breadth diagnostic: is performance broad or carried by one
/// market?
#[derive(Debug, Clone, Serialize)]
pub struct PerSymbolDiagnostic {
    pub mean_sharpe: f64,
    pub worst_sharpe: f64,
    pub symbol_count: usize,
    /// Fraction of symbols that closed profitable.
    pub hit_rate: f64,
    /// Guardrails: at least 3 symbols, worst Sharpe above -1.0, and at
    /// least 30% of symbols profitable.
    pub adequate: bool,
}

#[derive(Debug, Serialize)]
struct SymbolRow {
    symbol: String,
    sharpe: f64,
    total_return: f64,
    trade_count: u32,
}

#[derive(Debug, Serialize)]
struct RankRow {
    rank: usize,
    index: u64,
    score: f64,
    params: std::collections::BTreeMap<String, String>,
    metrics: EvaluationMetrics,
}

#[derive(Debug, Serialize)]
struct PortfolioReport<'a> {
    run_id: &'a RunId,
    symbols: &'a [String],
    evaluated: u64,
    failed: u64,
    results: Vec<RankRow>,
    champion_symbols: Vec<SymbolRow>,
    diagnostic: Option<PerSymbolDiagnostic>,
}

/// Equal-weight portfolio curve over the bar times every symbol shares.
/// Each symbol is normalized to its first common-bar equity, so a symbol
/// cannot dominate just by absolute price level. `None` when fewer than two
/// common bars exist.
fn portfolio_curve(
    evals: &[(&str, Evaluation)],
    initial_capital: f64,
) -> Option<Vec<EquityPoint>> {
    let (_, first_eval) = evals.first()?;
    let mut common: BTreeSet<NaiveDateTime> =
        first_eval.equity.iter().map(|p| p.time).collect();
    for (_, eval) in &evals[1..] {
        let times: BTreeSet<NaiveDateTime> = eval.equity.iter().map(|p| p.time).collect();
        common = common.intersection(&times).copied().collect();
    }
    if common.len() < 2 {
        return None;
    }

    let weight = 1.0 / evals.len() as f64;
    let mut curve: Vec<EquityPoint> = common
        .into_iter()
        .map(|time| EquityPoint { time, equity: 0.0 })
        .collect();
    for (_, eval) in evals {
        let by_time: HashMap<NaiveDateTime, f64> =
            eval.equity.iter().map(|p| (p.time, p.equity)).collect();
        let first = curve
            .first()
            .and_then(|p| by_time.get(&p.time))
            .copied()
            .unwrap_or(initial_capital);
        if first <= 0.0 {
            return None;
        }
        for point in curve.iter_mut() {
            let equity = by_time.get(&point.time).copied().unwrap_or(first);
            point.equity += weight * initial_capital * (equity / first);
        }
    }
    Some(curve)
}

fn per_symbol_diagnostic(evals: &[(&str, Evaluation)]) -> PerSymbolDiagnostic {
    let sharpes: Vec<f64> = evals.iter().map(|(_, e)| e.metrics.sharpe).collect();
    let profitable = evals
        .iter()
        .filter(|(_, e)| e.metrics.net_profit > 0.0)
        .count();
    let symbol_count = evals.len();
    let worst = sharpes.iter().copied().fold(f64::INFINITY, f64::min);
    let worst_sharpe = if worst.is_finite() { worst } else { 0.0 };
    let hit_rate = if symbol_count > 0 {
        profitable as f64 / symbol_count as f64
    } else {
        0.0
    };
    PerSymbolDiagnostic {
        mean_sharpe: metrics::mean_f64(&sharpes),
        worst_sharpe,
        symbol_count,
        hit_rate,
        adequate: symbol_count >= 3 && worst_sharpe > -1.0 && hit_rate >= 0.3,
    }
}

pub fn run(ctx: &mut RunContext) -> Result<JobOutcome, PipelineError> {
    let symbols = ctx.spec.symbols.clone();
    let total = ctx.compiled.combination_count();
    ctx.lock_record().progress.combinations_total = total;

    ctx.publish_phase(2.0, "loading", format!("loading {} symbols", symbols.len()))?;
    let mut series: Vec<SymbolSeries> = Vec::with_capacity(symbols.len());
    for symbol in &symbols {
        let dataset = ctx.load_symbol(symbol)?;
        let htf = ctx.htf_series(&dataset)?;
        series.push(SymbolSeries {
            symbol: symbol.clone(),
            dataset,
            htf,
        });
    }

    let evaluator = Arc::clone(&ctx.evaluator);
    let strict = ctx.spec.validation.mode == ValidationMode::Strict;
    let initial_capital = ctx.spec.initial_capital;
    let timeframe = ctx.spec.timeframe;
    let max_failure_rate = ctx.spec.limits.max_failure_rate;

    let mut top = TopNResultStore::new(ctx.spec.limits.top_n);
    let mut evaluated = 0u64;
    let mut failed = 0u64;
    let mut failures: Vec<FailureNote> = Vec::new();
    let mut lookahead_violations = 0u64;

    for index in 0..total {
        let Some(params) = ctx.compiled.combination_at(index) else {
            break;
        };

        let mut evals: Vec<(&str, Evaluation)> = Vec::with_capacity(series.len());
        let mut combo_err: Option<String> = None;
        for s in &series {
            let mut eval_ctx =
                EvaluationContext::new(&s.symbol, timeframe, s.dataset.candles(), &mut ctx.gate)
                    .with_initial_capital(initial_capital);
            if let Some(h) = &s.htf {
                eval_ctx = eval_ctx.with_htf(MtfCursor::new(h));
            }
            let outcome = evaluator.replay(&mut eval_ctx, &params);
            let violations = eval_ctx.lookahead_violations();
            drop(eval_ctx);
            lookahead_violations += violations;
            if strict && violations > 0 {
                return Err(PipelineError::Validation(format!(
                    "combination {index} on {} read {violations} unclosed higher-timeframe candle(s)",
                    s.symbol
                )));
            }
            match outcome {
                Ok(evaluation) => evals.push((s.symbol.as_str(), evaluation)),
                Err(err) => {
                    combo_err = Some(format!("{}: {err}", s.symbol));
                    break;
                }
            }
        }

        evaluated += 1;
        let failure = match combo_err {
            Some(msg) => Some(msg),
            None => match portfolio_curve(&evals, initial_capital) {
                Some(curve) => {
                    let mut trades: Vec<TradeRecord> = evals
                        .iter()
                        .flat_map(|(_, e)| e.trades.iter().cloned())
                        .collect();
                    trades.sort_by_key(|t| t.entry_time);
                    let values: Vec<f64> = curve.iter().map(|p| p.equity).collect();
                    let combined =
                        metrics::compute(&values, &trades, initial_capital, timeframe);
                    let score = ctx.objectives.score(&combined);
                    top.offer(CombinationResult {
                        index,
                        params: params.clone(),
                        metrics: combined,
                        score,
                    });
                    None
                }
                None => Some("no overlapping bars across symbols".to_string()),
            },
        };
        if let Some(error) = failure {
            failed += 1;
            if failures.len() < super::MAX_FAILURE_NOTES {
                failures.push(FailureNote {
                    index,
                    params: report::params_label(&ctx.compiled, &params),
                    error,
                });
            }
            if evaluated >= super::FAILURE_GRACE
                && failed as f64 / evaluated as f64 > max_failure_rate
            {
                return Err(PipelineError::FailureRateExceeded { failed, evaluated });
            }
        }

        let fraction = (index + 1) as f64 / total.max(1) as f64;
        ctx.checkpoint(5.0 + fraction * 90.0, "optimizing", index + 1, total)?;
    }

    ctx.publish_phase(95.0, "finalizing", "writing artifacts")?;
    let results = top.into_sorted();

    // Champion breadth diagnostic plus its portfolio curve for the equity
    // artifact.
    let mut champion_symbols: Vec<SymbolRow> = Vec::new();
    let mut diagnostic: Option<PerSymbolDiagnostic> = None;
    let mut champion_curve: Option<Vec<EquityPoint>> = None;
    if let Some(champion) = results.first() {
        let mut evals: Vec<(&str, Evaluation)> = Vec::with_capacity(series.len());
        let mut ok = true;
        for s in &series {
            let mut eval_ctx =
                EvaluationContext::new(&s.symbol, timeframe, s.dataset.candles(), &mut ctx.gate)
                    .with_initial_capital(initial_capital);
            if let Some(h) = &s.htf {
                eval_ctx = eval_ctx.with_htf(MtfCursor::new(h));
            }
            let outcome = evaluator.replay(&mut eval_ctx, &champion.params);
            drop(eval_ctx);
            match outcome {
                Ok(evaluation) => evals.push((s.symbol.as_str(), evaluation)),
                Err(err) => {
                    warn!(run_id = %ctx.run_id, symbol = %s.symbol, error = %err, "champion replay failed");
                    ok = false;
                    break;
                }
            }
        }
        if ok {
            for (symbol, eval) in &evals {
                champion_symbols.push(SymbolRow {
                    symbol: symbol.to_string(),
                    sharpe: eval.metrics.sharpe,
                    total_return: eval.metrics.total_return,
                    trade_count: eval.metrics.trade_count,
                });
            }
            diagnostic = Some(per_symbol_diagnostic(&evals));
            champion_curve = portfolio_curve(&evals, initial_capital);
        }
    }

    let mut artifacts = Vec::new();
    if let Some(curve) = &champion_curve {
        artifacts.push(
            ctx.artifacts
                .save_csv(&ctx.run_id, ArtifactKind::Equity, curve)?,
        );
    }
    let report_doc = PortfolioReport {
        run_id: &ctx.run_id,
        symbols: &symbols,
        evaluated,
        failed,
        results: results
            .iter()
            .enumerate()
            .map(|(i, r)| RankRow {
                rank: i + 1,
                index: r.index,
                score: r.score,
                params: ctx.compiled.render(&r.params),
                metrics: r.metrics,
            })
            .collect(),
        champion_symbols,
        diagnostic: diagnostic.clone(),
    };
    artifacts.push(
        ctx.artifacts
            .save_json(&ctx.run_id, ArtifactKind::Report, &report_doc)?,
    );

    let mut outcome = JobOutcome {
        top_n: results,
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
    if let Some(diag) = &diagnostic {
        summary.push_str("## Breadth\n\n");
        summary.push_str("| Field | Value |\n");
        summary.push_str("| --- | --- |\n");
        summary.push_str(&format!("| Symbols | {} |\n", diag.symbol_count));
        summary.push_str(&format!("| Mean Sharpe | {:.3} |\n", diag.mean_sharpe));
        summary.push_str(&format!("| Worst Sharpe | {:.3} |\n", diag.worst_sharpe));
        summary.push_str(&format!("| Hit Rate | {:.0}% |\n", diag.hit_rate * 100.0));
        summary.push_str(&format!(
            "| Adequate | {} |\n",
            if diag.adequate { "yes" } else { "no" }
        ));
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

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::*;
    use chrono::NaiveDate;
    use paramlab_core::Timeframe;

    use crate::evaluator::SmaCrossEvaluator;
    use crate::job::PipelineKind;

    fn eval_with_curve(values: &[f64], start_hour: u32) -> Evaluation {
        let base = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(start_hour, 0, 0)
            .unwrap();
        let equity = values
            .iter()
            .enumerate()
            .map(|(i, &equity)| EquityPoint {
                time: base + Timeframe::H1.duration() * i as i32,
                equity,
            })
            .collect();
        Evaluation {
            metrics: EvaluationMetrics::flat(),
            trades: Vec::new(),
            equity,
        }
    }

    #[test]
    fn portfolio_curve_averages_normalized_symbols() {
        // One symbol doubles, the other halves; equal weights cancel to a
        // 1.25x portfolio at the end.
        let a = eval_with_curve(&[100.0, 150.0, 200.0], 0);
        let b = eval_with_curve(&[1_000.0, 750.0, 500.0], 0);
        let evals = vec![("A", a), ("B", b)];
        let curve = portfolio_curve(&evals, 10_000.0).unwrap();
        assert_eq!(curve.len(), 3);
        assert!((curve[0].equity - 10_000.0).abs() < 1e-9);
        let last = curve.last().unwrap().equity;
        assert!((last - 10_000.0 * (2.0 + 0.5) / 2.0).abs() < 1e-9);
    }

    #[test]
    fn portfolio_curve_uses_only_common_bars() {
        // B starts two hours later; only the overlap counts.
        let a = eval_with_curve(&[100.0, 110.0, 120.0, 130.0], 0);
        let b = eval_with_curve(&[50.0, 55.0], 2);
        let evals = vec![("A", a), ("B", b)];
        let curve = portfolio_curve(&evals, 10_000.0).unwrap();
        assert_eq!(curve.len(), 2);
    }

    #[test]
    fn disjoint_symbols_have_no_curve() {
        let a = eval_with_curve(&[100.0, 110.0], 0);
        let b = eval_with_curve(&[50.0, 55.0], 12);
        let evals = vec![("A", a), ("B", b)];
        assert!(portfolio_curve(&evals, 10_000.0).is_none());
    }

    #[test]
    fn diagnostic_guardrails_need_three_symbols() {
        let a = eval_with_curve(&[100.0, 120.0], 0);
        let b = eval_with_curve(&[100.0, 130.0], 0);
        let mut evals = vec![("A", a), ("B", b)];
        let diag = per_symbol_diagnostic(&evals);
        assert_eq!(diag.symbol_count, 2);
        assert!(!diag.adequate);

        evals.push(("C", eval_with_curve(&[100.0, 140.0], 0)));
        let diag = per_symbol_diagnostic(&evals);
        assert_eq!(diag.symbol_count, 3);
        // Flat metrics carry zero net profit, so the hit rate stays 0.
        assert!(!diag.adequate);
    }

    #[test]
    fn diagnostic_accepts_broad_profits() {
        let mut evals = Vec::new();
        for symbol in ["A", "B", "C"] {
            let mut eval = eval_with_curve(&[100.0, 120.0], 0);
            eval.metrics.net_profit = 200.0;
            eval.metrics.sharpe = 1.0;
            evals.push((symbol, eval));
        }
        let diag = per_symbol_diagnostic(&evals);
        assert!(diag.adequate);
        assert_eq!(diag.hit_rate, 1.0);
    }

    #[test]
    fn portfolio_run_ranks_combinations_across_symbols() {
        let dir = tempfile::tempdir().unwrap();
        let spec = small_spec(
            PipelineKind::Portfolio,
            &["AAAUSD", "BBBUSD", "CCCUSD"],
            1_200,
        );
        let mut ctx = context(spec, std::sync::Arc::new(SmaCrossEvaluator), dir.path());
        let outcome = run(&mut ctx).unwrap();

        assert_eq!(outcome.evaluated, 9);
        assert!(!outcome.top_n.is_empty());
        let kinds: Vec<_> = outcome.artifacts.iter().map(|a| a.kind).collect();
        assert!(kinds.contains(&ArtifactKind::Equity));
        assert!(kinds.contains(&ArtifactKind::Report));
        assert!(kinds.contains(&ArtifactKind::Summary));
        assert!(kinds.contains(&ArtifactKind::Manifest));
    }

    #[test]
    fn portfolio_report_carries_the_diagnostic() {
        let dir = tempfile::tempdir().unwrap();
        let spec = small_spec(
            PipelineKind::Portfolio,
            &["AAAUSD", "BBBUSD", "CCCUSD"],
            1_200,
        );
        let mut ctx = context(spec, std::sync::Arc::new(SmaCrossEvaluator), dir.path());
        let outcome = run(&mut ctx).unwrap();

        let report_ref = outcome
            .artifacts
            .iter()
            .find(|a| a.kind == ArtifactKind::Report)
            .unwrap();
        let bytes = ctx.artifacts.load_bytes(&report_ref.reference).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["diagnostic"]["symbol_count"], 3);
        assert_eq!(
            value["champion_symbols"].as_array().unwrap().len(),
            3
        );
    }
}
