//! Market-regime detection: classify every bar of the window as trending or
//! ranging with a volatility tier, merge maximal runs of the same class into
//! segments, and summarize time spent per regime.
//!
//! This pipeline ignores the parameter dimensions entirely. Trend strength
//! is momentum over the rolling window divided by volatility scaled to the
//! same horizon, so a drifting but noisy market still reads as ranging.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use paramlab_core::{Candle, RunId};

use crate::artifacts::ArtifactKind;
use crate::job::JobOutcome;
use crate::metrics;

use super::{PipelineError, RunContext};

/// Segments shown in the Markdown summary; the full timeline lives in the
/// CSV artifact.
const MAX_SEGMENT_ROWS: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Regime {
    TrendUp,
    TrendDown,
    Range,
}

impl Regime {
    pub fn label(self) -> &'static str {
        match self {
            Self::TrendUp => "trend up",
            Self::TrendDown => "trend down",
            Self::Range => "range",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VolTier {
    Normal,
    High,
}

impl VolTier {
    pub fn label(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::High => "high",
        }
    }
}

/// One classified bar, before run-merging.
#[derive(Debug, Clone, Copy)]
pub struct BarClass {
    pub time: NaiveDateTime,
    pub regime: Regime,
    pub vol_tier: VolTier,
    pub bar_return: f64,
    pub vol: f64,
}

/// A maximal run of bars sharing regime and volatility tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeSegment {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub regime: Regime,
    pub vol_tier: VolTier,
    pub bars: u32,
}

#[derive(Debug, Clone, Serialize)]
struct RegimeSummaryRow {
    regime: Regime,
    bars: u64,
    /// Fraction of classified bars.
    share: f64,
    mean_return: f64,
    mean_vol: f64,
}

#[derive(Debug, Serialize)]
struct RegimeReport<'a> {
    run_id: &'a RunId,
    symbol: &'a str,
    window_bars: usize,
    trend_threshold: f64,
    high_vol_quantile: f64,
    /// Volatility above this value counts as the high tier.
    vol_threshold: f64,
    bars_total: usize,
    bars_classified: usize,
    dominant: Regime,
    regimes: Vec<RegimeSummaryRow>,
    segment_count: usize,
}

/// Classify every bar past the warmup window. Returns the per-bar classes
/// and the volatility value that separates the tiers.
fn classify(
    candles: &[Candle],
    window: usize,
    trend_threshold: f64,
    high_vol_quantile: f64,
) -> (Vec<BarClass>, f64) {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let mut returns = vec![0.0_f64; closes.len()];
    for t in 1..closes.len() {
        if closes[t - 1] > 0.0 {
            returns[t] = closes[t] / closes[t - 1] - 1.0;
        }
    }

    let horizon = (window as f64).sqrt();
    let mut classes: Vec<BarClass> = Vec::with_capacity(closes.len().saturating_sub(window));
    let mut vols: Vec<f64> = Vec::with_capacity(classes.capacity());
    for t in window..closes.len() {
        let momentum = if closes[t - window] > 0.0 {
            closes[t] / closes[t - window] - 1.0
        } else {
            0.0
        };
        let vol = metrics::std_dev(&returns[t - window + 1..=t]);
        let strength = momentum / (vol * horizon + 1e-9);
        let regime = if strength > trend_threshold {
            Regime::TrendUp
        } else if strength < -trend_threshold {
            Regime::TrendDown
        } else {
            Regime::Range
        };
        vols.push(vol);
        classes.push(BarClass {
            time: candles[t].open_time,
            regime,
            vol_tier: VolTier::Normal,
            bar_return: returns[t],
            vol,
        });
    }

    vols.sort_by(|a, b| a.total_cmp(b));
    let vol_threshold = metrics::percentile(&vols, high_vol_quantile);
    for class in classes.iter_mut() {
        if class.vol > vol_threshold {
            class.vol_tier = VolTier::High;
        }
    }
    (classes, vol_threshold)
}

/// Merge consecutive bars sharing (regime, volatility tier) into maximal
/// segments.
fn merge_segments(classes: &[BarClass]) -> Vec<RegimeSegment> {
    let mut segments: Vec<RegimeSegment> = Vec::new();
    for class in classes {
        match segments.last_mut() {
            Some(seg) if seg.regime == class.regime && seg.vol_tier == class.vol_tier => {
                seg.end = class.time;
                seg.bars += 1;
            }
            _ => segments.push(RegimeSegment {
                start: class.time,
                end: class.time,
                regime: class.regime,
                vol_tier: class.vol_tier,
                bars: 1,
            }),
        }
    }
    segments
}

fn summarize(classes: &[BarClass]) -> Vec<RegimeSummaryRow> {
    let total = classes.len().max(1) as f64;
    [Regime::TrendUp, Regime::TrendDown, Regime::Range]
        .into_iter()
        .map(|regime| {
            let returns: Vec<f64> = classes
                .iter()
                .filter(|c| c.regime == regime)
                .map(|c| c.bar_return)
                .collect();
            let vols: Vec<f64> = classes
                .iter()
                .filter(|c| c.regime == regime)
                .map(|c| c.vol)
                .collect();
            RegimeSummaryRow {
                regime,
                bars: returns.len() as u64,
                share: returns.len() as f64 / total,
                mean_return: metrics::mean_f64(&returns),
                mean_vol: metrics::mean_f64(&vols),
            }
        })
        .collect()
}

/// Regime with the most classified bars; earlier enum order wins ties.
fn dominant_regime(rows: &[RegimeSummaryRow]) -> Regime {
    let mut best = Regime::Range;
    let mut best_bars = 0u64;
    for row in rows {
        if row.bars > best_bars {
            best = row.regime;
            best_bars = row.bars;
        }
    }
    best
}

fn summary_markdown(
    ctx: &RunContext,
    symbol: &str,
    report: &RegimeReport<'_>,
    segments: &[RegimeSegment],
) -> String {
    let mut out = String::new();
    out.push_str("# Regime Report\n\n");
    out.push_str("## Metadata\n\n");
    out.push_str("| Field | Value |\n");
    out.push_str("| --- | --- |\n");
    out.push_str(&format!("| Run | {} |\n", ctx.run_id));
    out.push_str(&format!("| Symbol | {} |\n", symbol));
    out.push_str(&format!("| Timeframe | {} |\n", ctx.spec.timeframe));
    out.push_str(&format!("| Window Bars | {} |\n", report.window_bars));
    out.push_str(&format!(
        "| Trend Threshold | {:.2} |\n",
        report.trend_threshold
    ));
    out.push_str(&format!(
        "| High-Vol Quantile | {:.2} |\n",
        report.high_vol_quantile
    ));
    out.push_str(&format!("| Bars Classified | {} |\n", report.bars_classified));
    out.push_str(&format!(
        "| Dominant Regime | {} |\n",
        report.dominant.label()
    ));
    out.push('\n');

    out.push_str("## Regimes\n\n");
    out.push_str("| Regime | Bars | Share | Mean Return | Mean Vol |\n");
    out.push_str("| --- | --- | --- | --- | --- |\n");
    for row in &report.regimes {
        out.push_str(&format!(
            "| {} | {} | {:.1}% | {:.4}% | {:.4}% |\n",
            row.regime.label(),
            row.bars,
            row.share * 100.0,
            row.mean_return * 100.0,
            row.mean_vol * 100.0,
        ));
    }
    out.push('\n');

    out.push_str("## Segments\n\n");
    if segments.is_empty() {
        out.push_str("No segments: the window is longer than the dataset.\n");
        return out;
    }
    out.push_str("| Start | End | Regime | Vol | Bars |\n");
    out.push_str("| --- | --- | --- | --- | --- |\n");
    for seg in segments.iter().take(MAX_SEGMENT_ROWS) {
        out.push_str(&format!(
            "| {} | {} | {} | {} | {} |\n",
            seg.start.format("%Y-%m-%d %H:%M"),
            seg.end.format("%Y-%m-%d %H:%M"),
            seg.regime.label(),
            seg.vol_tier.label(),
            seg.bars,
        ));
    }
    if segments.len() > MAX_SEGMENT_ROWS {
        out.push_str(&format!(
            "\n{} more segments in the stored artifacts.\n",
            segments.len() - MAX_SEGMENT_ROWS
        ));
    }
    out
}

pub fn run(ctx: &mut RunContext) -> Result<JobOutcome, PipelineError> {
    let symbol = ctx.spec.symbols[0].clone();
    let window = ctx.spec.regime.window_bars;
    let trend_threshold = ctx.spec.regime.trend_threshold;
    let high_vol_quantile = ctx.spec.regime.high_vol_quantile;

    ctx.publish_phase(2.0, "loading", format!("loading {symbol}"))?;
    let dataset = ctx.load_symbol(&symbol)?;
    let candles = dataset.candles();
    if candles.len() <= window {
        return Err(PipelineError::Validation(format!(
            "regime window of {window} bars needs more than {window} candles; have {}",
            candles.len()
        )));
    }

    ctx.publish_phase(10.0, "classifying", format!("{} bars", candles.len()))?;
    let (classes, vol_threshold) = classify(candles, window, trend_threshold, high_vol_quantile);

    ctx.publish_phase(80.0, "segmenting", format!("{} classified bars", classes.len()))?;
    let segments = merge_segments(&classes);
    let regimes = summarize(&classes);
    let dominant = dominant_regime(&regimes);

    ctx.publish_phase(90.0, "finalizing", "writing artifacts")?;
    let report = RegimeReport {
        run_id: &ctx.run_id,
        symbol: &symbol,
        window_bars: window,
        trend_threshold,
        high_vol_quantile,
        vol_threshold,
        bars_total: candles.len(),
        bars_classified: classes.len(),
        dominant,
        regimes,
        segment_count: segments.len(),
    };

    let mut artifacts = Vec::new();
    artifacts.push(
        ctx.artifacts
            .save_csv(&ctx.run_id, ArtifactKind::Segments, &segments)?,
    );
    artifacts.push(
        ctx.artifacts
            .save_json(&ctx.run_id, ArtifactKind::Report, &report)?,
    );
    let summary = summary_markdown(ctx, &symbol, &report, &segments);
    artifacts.push(ctx.artifacts.save_bytes(
        &ctx.run_id,
        ArtifactKind::Summary,
        summary.as_bytes(),
    )?);
    let manifest = ctx.artifacts.write_manifest(&ctx.run_id, &artifacts)?;
    artifacts.push(manifest);

    Ok(JobOutcome {
        top_n: Vec::new(),
        artifacts,
        evaluated: 0,
        failed: 0,
        lookahead_violations: 0,
    })
}
