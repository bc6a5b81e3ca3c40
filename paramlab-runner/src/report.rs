//! Human-readable Markdown summary written next to the machine artifacts.

use paramlab_core::{CombinationResult, ParameterSet, RunId};

use crate::config::{CompiledSpace, JobSpec};
use crate::job::{FailureNote, JobOutcome};

const MAX_RESULT_ROWS: usize = 15;
const MAX_FAILURE_ROWS: usize = 10;

/// A parameter set as `name=value` pairs, with grid values mapped back to
/// their human form.
pub fn params_label(compiled: &CompiledSpace, params: &ParameterSet) -> String {
    compiled
        .render(params)
        .into_iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn summary_report(
    run_id: &RunId,
    evaluator_name: &str,
    spec: &JobSpec,
    compiled: &CompiledSpace,
    outcome: &JobOutcome,
    failures: &[FailureNote],
) -> String {
    let mut md = String::new();

    md.push_str("# Optimization Report\n\n");

    md.push_str("## Metadata\n\n");
    md.push_str("| Field | Value |\n");
    md.push_str("| --- | --- |\n");
    md.push_str(&format!("| Run | {run_id} |\n"));
    md.push_str(&format!("| Pipeline | {} |\n", spec.kind));
    md.push_str(&format!("| Strategy | {evaluator_name} |\n"));
    md.push_str(&format!("| Symbols | {} |\n", spec.symbols.join(", ")));
    md.push_str(&format!("| Timeframe | {} |\n", spec.timeframe));
    md.push_str(&format!(
        "| Window | {} to {} |\n",
        spec.start.format("%Y-%m-%d %H:%M"),
        spec.end.format("%Y-%m-%d %H:%M")
    ));
    if let Some(htf) = spec.validation.higher_timeframe {
        md.push_str(&format!("| Higher TF | {htf} |\n"));
    }
    md.push_str(&format!("| Evaluated | {} |\n", outcome.evaluated));
    md.push_str(&format!("| Skipped | {} |\n", outcome.failed));
    if outcome.lookahead_violations > 0 {
        md.push_str(&format!(
            "| Lookahead Violations | {} |\n",
            outcome.lookahead_violations
        ));
    }
    md.push('\n');

    md.push_str("## Top Results\n\n");
    if outcome.top_n.is_empty() {
        md.push_str("No combination survived evaluation.\n\n");
    } else {
        md.push_str(
            "| # | Score | Sharpe | Return | Max DD | Win Rate | PF | Trades | Parameters |\n",
        );
        md.push_str("| --- | --- | --- | --- | --- | --- | --- | --- | --- |\n");
        for (rank, result) in outcome.top_n.iter().take(MAX_RESULT_ROWS).enumerate() {
            md.push_str(&result_row(rank + 1, result, compiled));
        }
        if outcome.top_n.len() > MAX_RESULT_ROWS {
            md.push_str(&format!(
                "\n{} more results in the stored artifacts.\n",
                outcome.top_n.len() - MAX_RESULT_ROWS
            ));
        }
        md.push('\n');
    }

    if !failures.is_empty() {
        md.push_str("## Skipped Combinations\n\n");
        md.push_str("| Index | Parameters | Error |\n");
        md.push_str("| --- | --- | --- |\n");
        for note in failures.iter().take(MAX_FAILURE_ROWS) {
            md.push_str(&format!(
                "| {} | {} | {} |\n",
                note.index, note.params, note.error
            ));
        }
        if failures.len() > MAX_FAILURE_ROWS {
            md.push_str(&format!(
                "\n{} more skipped combinations not shown.\n",
                failures.len() - MAX_FAILURE_ROWS
            ));
        }
        md.push('\n');
    }

    md
}

fn result_row(rank: usize, result: &CombinationResult, compiled: &CompiledSpace) -> String {
    let m = &result.metrics;
    format!(
        "| {} | {:.4} | {:.2} | {:.2}% | {:.2}% | {:.1}% | {:.2} | {} | {} |\n",
        rank,
        result.score,
        m.sharpe,
        m.total_return * 100.0,
        m.max_drawdown * 100.0,
        m.win_rate * 100.0,
        m.profit_factor,
        m.trade_count,
        params_label(compiled, &result.params)
    )
}
