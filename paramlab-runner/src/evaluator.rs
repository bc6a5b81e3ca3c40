//! Strategy evaluation: one parameter combination replayed over one candle
//! slice, producing metrics, a trade log, and an equity curve.
//!
//! Pipelines drive evaluators through [`EvaluationContext`], which carries
//! the candles, the cooperative yield gate, and (optionally) a
//! higher-timeframe cursor. The cursor is the only window onto HTF data, so
//! an evaluator physically cannot read a candle that has not closed; trying
//! counts as a lookahead violation the pipeline inspects afterwards.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use paramlab_core::data::MtfCursor;
use paramlab_core::{Candle, EvaluationMetrics, ParameterSet, Timeframe, YieldGate};

use crate::metrics;

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("missing parameter `{0}`")]
    MissingParam(String),
    #[error("not enough candles: need {need}, have {have}")]
    InsufficientData { need: usize, have: usize },
    #[error("invalid combination: {0}")]
    Invalid(String),
}

/// Which way a trade was opened. The reference strategy is long-only, but
/// the record format covers both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeDirection {
    Long,
    Short,
}

/// One round trip, entry to exit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub symbol: String,
    pub direction: TradeDirection,
    pub entry_time: NaiveDateTime,
    pub exit_time: NaiveDateTime,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub pnl: f64,
    pub return_pct: f64,
}

impl TradeRecord {
    pub fn is_winner(&self) -> bool {
        self.pnl > 0.0
    }
}

/// Mark-to-market account value at one bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub time: NaiveDateTime,
    pub equity: f64,
}

/// Full output of one replay.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub metrics: EvaluationMetrics,
    pub trades: Vec<TradeRecord>,
    pub equity: Vec<EquityPoint>,
}

/// Everything an evaluator may see during one replay.
pub struct EvaluationContext<'a> {
    symbol: &'a str,
    timeframe: Timeframe,
    candles: &'a [Candle],
    initial_capital: f64,
    htf: Option<MtfCursor<'a>>,
    gate: &'a mut YieldGate,
}

impl<'a> EvaluationContext<'a> {
    pub fn new(
        symbol: &'a str,
        timeframe: Timeframe,
        candles: &'a [Candle],
        gate: &'a mut YieldGate,
    ) -> Self {
        Self {
            symbol,
            timeframe,
            candles,
            initial_capital: 10_000.0,
            htf: None,
            gate,
        }
    }

    pub fn with_initial_capital(mut self, capital: f64) -> Self {
        self.initial_capital = capital;
        self
    }

    pub fn with_htf(mut self, cursor: MtfCursor<'a>) -> Self {
        self.htf = Some(cursor);
        self
    }

    pub fn symbol(&self) -> &'a str {
        self.symbol
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn candles(&self) -> &'a [Candle] {
        self.candles
    }

    pub fn initial_capital(&self) -> f64 {
        self.initial_capital
    }

    /// Call once per simulated bar; yields the thread at batch boundaries.
    pub fn tick_bar(&mut self) {
        self.gate.tick_bar();
    }

    /// Move the higher-timeframe frontier up to the replay clock.
    pub fn advance_htf(&mut self, now: NaiveDateTime) {
        if let Some(cursor) = &mut self.htf {
            cursor.advance_to(now);
        }
    }

    /// Most recently closed higher-timeframe candle, if any.
    pub fn htf_last_closed(&self) -> Option<&'a Candle> {
        self.htf.as_ref().and_then(|c| c.last_closed())
    }

    /// Indexed HTF access. Reaching past the frontier records a lookahead
    /// violation and yields `None`.
    pub fn htf_candle(&mut self, index: usize) -> Option<&'a Candle> {
        self.htf.as_mut().and_then(|c| c.candle(index))
    }

    pub fn htf_closed_len(&self) -> usize {
        self.htf.as_ref().map_or(0, |c| c.closed_len())
    }

    pub fn has_htf(&self) -> bool {
        self.htf.is_some()
    }

    /// Blocked future accesses recorded so far in this replay.
    pub fn lookahead_violations(&self) -> u64 {
        self.htf.as_ref().map_or(0, |c| c.violations())
    }
}

/// A strategy that can be replayed over historical candles.
///
/// `evaluate` is the hot path the optimization loop calls per combination;
/// the default implementation runs a full replay and keeps only the metrics.
/// `replay` is called once more for the champion to produce artifacts.
pub trait StrategyEvaluator: Send + Sync {
    fn name(&self) -> &str;

    fn replay(
        &self,
        ctx: &mut EvaluationContext<'_>,
        params: &ParameterSet,
    ) -> Result<Evaluation, EvalError>;

    fn evaluate(
        &self,
        ctx: &mut EvaluationContext<'_>,
        params: &ParameterSet,
    ) -> Result<EvaluationMetrics, EvalError> {
        Ok(self.replay(ctx, params)?.metrics)
    }
}

// ─── Reference strategy ─────────────────────────────────────────────

/// Long-only SMA crossover with next-bar-open execution.
///
/// Parameters:
/// - `fast`, `slow` (required): moving average periods, `fast < slow`
/// - `stop_pct` (optional): intrabar stop-loss as a fraction of entry
/// - `htf_confirm` (optional, >= 0.5): only enter while the last closed
///   higher-timeframe candle is bullish; ignored without an HTF cursor
pub struct SmaCrossEvaluator;

fn period(params: &ParameterSet, name: &str) -> Result<usize, EvalError> {
    let raw = params
        .get(name)
        .ok_or_else(|| EvalError::MissingParam(name.to_string()))?;
    let period = raw.round();
    if !period.is_finite() || period < 1.0 {
        return Err(EvalError::Invalid(format!(
            "{name} must be a positive period, got {raw}"
        )));
    }
    Ok(period as usize)
}

#[derive(Clone, Copy)]
enum Pending {
    Enter,
    Exit,
}

impl StrategyEvaluator for SmaCrossEvaluator {
    fn name(&self) -> &str {
        "sma_cross"
    }

    fn replay(
        &self,
        ctx: &mut EvaluationContext<'_>,
        params: &ParameterSet,
    ) -> Result<Evaluation, EvalError> {
        let fast = period(params, "fast")?;
        let slow = period(params, "slow")?;
        if fast >= slow {
            return Err(EvalError::Invalid(format!(
                "fast period {fast} must be below slow period {slow}"
            )));
        }
        let stop_pct = params.get("stop_pct").filter(|&s| s > 0.0);
        let htf_confirm = params.get("htf_confirm").is_some_and(|v| v >= 0.5) && ctx.has_htf();

        let candles = ctx.candles();
        if candles.len() <= slow {
            return Err(EvalError::InsufficientData {
                need: slow + 1,
                have: candles.len(),
            });
        }

        let symbol = ctx.symbol().to_string();
        let timeframe = ctx.timeframe();
        let initial_capital = ctx.initial_capital();

        let mut cash = initial_capital;
        let mut quantity = 0.0_f64;
        let mut entry_price = 0.0_f64;
        let mut entry_time = candles[0].open_time;
        let mut pending: Option<Pending> = None;

        let mut fast_sum = 0.0_f64;
        let mut slow_sum = 0.0_f64;
        let mut prev_fast: Option<f64> = None;
        let mut prev_slow: Option<f64> = None;

        let mut trades: Vec<TradeRecord> = Vec::new();
        let mut equity: Vec<EquityPoint> = Vec::with_capacity(candles.len());

        for (i, candle) in candles.iter().enumerate() {
            ctx.advance_htf(candle.open_time);

            // Orders queued on the previous close fill at this bar's open.
            match pending.take() {
                Some(Pending::Enter) if quantity == 0.0 => {
                    let confirmed = !htf_confirm
                        || ctx
                            .htf_last_closed()
                            .is_some_and(|c| c.close >= c.open);
                    if confirmed {
                        entry_price = candle.open;
                        entry_time = candle.open_time;
                        quantity = cash / entry_price;
                        cash = 0.0;
                    }
                }
                Some(Pending::Exit) if quantity > 0.0 => {
                    let exit_price = candle.open;
                    trades.push(close_trade(
                        &symbol,
                        entry_time,
                        candle.open_time,
                        entry_price,
                        exit_price,
                        quantity,
                    ));
                    cash = quantity * exit_price;
                    quantity = 0.0;
                }
                _ => {}
            }

            // Intrabar stop: fills at the stop level.
            if quantity > 0.0 {
                if let Some(stop) = stop_pct {
                    let stop_price = entry_price * (1.0 - stop);
                    if candle.low <= stop_price {
                        trades.push(close_trade(
                            &symbol,
                            entry_time,
                            candle.open_time,
                            entry_price,
                            stop_price,
                            quantity,
                        ));
                        cash = quantity * stop_price;
                        quantity = 0.0;
                        pending = None;
                    }
                }
            }

            // Signal on this bar's close.
            fast_sum += candle.close;
            if i >= fast {
                fast_sum -= candles[i - fast].close;
            }
            slow_sum += candle.close;
            if i >= slow {
                slow_sum -= candles[i - slow].close;
            }
            if i + 1 >= slow {
                let fast_ma = fast_sum / fast as f64;
                let slow_ma = slow_sum / slow as f64;
                if let (Some(pf), Some(ps)) = (prev_fast, prev_slow) {
                    if pf <= ps && fast_ma > slow_ma && quantity == 0.0 {
                        pending = Some(Pending::Enter);
                    } else if pf >= ps && fast_ma < slow_ma && quantity > 0.0 {
                        pending = Some(Pending::Exit);
                    }
                }
                prev_fast = Some(fast_ma);
                prev_slow = Some(slow_ma);
            }

            equity.push(EquityPoint {
                time: candle.open_time,
                equity: cash + quantity * candle.close,
            });
            ctx.tick_bar();
        }

        // Close any open position at the final bar so the trade log agrees
        // with the equity curve, which already marked that close.
        if quantity > 0.0 {
            if let Some(last) = candles.last() {
                trades.push(close_trade(
                    &symbol,
                    entry_time,
                    last.open_time,
                    entry_price,
                    last.close,
                    quantity,
                ));
            }
        }

        let curve: Vec<f64> = equity.iter().map(|p| p.equity).collect();
        let metrics = metrics::compute(&curve, &trades, initial_capital, timeframe);
        Ok(Evaluation {
            metrics,
            trades,
            equity,
        })
    }
}

fn close_trade(
    symbol: &str,
    entry_time: NaiveDateTime,
    exit_time: NaiveDateTime,
    entry_price: f64,
    exit_price: f64,
    quantity: f64,
) -> TradeRecord {
    TradeRecord {
        symbol: symbol.to_string(),
        direction: TradeDirection::Long,
        entry_time,
        exit_time,
        entry_price,
        exit_price,
        quantity,
        pnl: quantity * (exit_price - entry_price),
        return_pct: (exit_price - entry_price) / entry_price,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use paramlab_core::data::synthetic_drift;

    fn start() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    /// Chained candles from a list of closes: each bar opens at the prior
    /// close, with a one-unit wick either side.
    fn chained(closes: &[f64]) -> Vec<Candle> {
        let mut candles = Vec::with_capacity(closes.len());
        let mut open = closes[0];
        for (i, &close) in closes.iter().enumerate() {
            candles.push(Candle {
                open_time: start() + Timeframe::H1.duration() * i as i32,
                open,
                high: open.max(close) + 1.0,
                low: open.min(close) - 1.0,
                close,
                volume: 100.0,
            });
            open = close;
        }
        candles
    }

    fn params(pairs: &[(&str, f64)]) -> ParameterSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }

    fn run(
        candles: &[Candle],
        params: &ParameterSet,
    ) -> Result<Evaluation, EvalError> {
        let mut gate = YieldGate::default();
        let mut ctx = EvaluationContext::new("TESTUSD", Timeframe::H1, candles, &mut gate);
        SmaCrossEvaluator.replay(&mut ctx, params)
    }

    #[test]
    fn missing_parameter_is_reported() {
        let candles = chained(&[100.0; 10]);
        let err = run(&candles, &params(&[("fast", 2.0)])).unwrap_err();
        assert!(matches!(err, EvalError::MissingParam(name) if name == "slow"));
    }

    #[test]
    fn fast_must_be_below_slow() {
        let candles = chained(&[100.0; 10]);
        let err = run(&candles, &params(&[("fast", 5.0), ("slow", 5.0)])).unwrap_err();
        assert!(matches!(err, EvalError::Invalid(_)));
    }

    #[test]
    fn too_few_candles_is_reported() {
        let candles = chained(&[100.0, 101.0, 102.0]);
        let err = run(&candles, &params(&[("fast", 2.0), ("slow", 5.0)])).unwrap_err();
        assert!(matches!(
            err,
            EvalError::InsufficientData { need: 6, have: 3 }
        ));
    }

    #[test]
    fn flat_series_never_trades() {
        let candles = chained(&[100.0; 50]);
        let eval = run(&candles, &params(&[("fast", 3.0), ("slow", 8.0)])).unwrap();
        assert_eq!(eval.trades.len(), 0);
        assert_eq!(eval.metrics.trade_count, 0);
        assert_eq!(eval.metrics.total_return, 0.0);
        assert_eq!(eval.equity.len(), candles.len());
    }

    #[test]
    fn golden_cross_enters_at_next_bar_open() {
        // Flat, then a jump: the cross fires on the jump bar's close, so the
        // fill is the following bar's open.
        let candles = chained(&[100.0, 100.0, 100.0, 110.0, 120.0, 130.0]);
        let eval = run(&candles, &params(&[("fast", 2.0), ("slow", 3.0)])).unwrap();
        assert_eq!(eval.trades.len(), 1);
        let trade = &eval.trades[0];
        assert_eq!(trade.entry_price, 110.0);
        assert_eq!(trade.entry_time, candles[4].open_time);
        // Never crossed back down, so the position closes on the last bar.
        assert_eq!(trade.exit_price, 130.0);
        assert!(trade.is_winner());
    }

    #[test]
    fn stop_loss_fills_at_the_stop_level() {
        let candles = chained(&[100.0, 100.0, 100.0, 110.0, 120.0, 50.0, 50.0, 50.0]);
        let eval = run(
            &candles,
            &params(&[("fast", 2.0), ("slow", 3.0), ("stop_pct", 0.1)]),
        )
        .unwrap();
        assert_eq!(eval.trades.len(), 1);
        let trade = &eval.trades[0];
        assert_eq!(trade.entry_price, 110.0);
        assert!((trade.exit_price - 99.0).abs() < 1e-9);
        assert!(trade.pnl < 0.0);
    }

    #[test]
    fn equity_curve_tracks_the_account() {
        let candles = chained(&[100.0, 100.0, 100.0, 110.0, 120.0, 130.0]);
        let eval = run(&candles, &params(&[("fast", 2.0), ("slow", 3.0)])).unwrap();
        assert_eq!(eval.equity.len(), candles.len());
        // Entered at 110 with the whole account; equity at the final close
        // reflects the 110 -> 130 move.
        let final_equity = eval.equity.last().unwrap().equity;
        let expected = 10_000.0 / 110.0 * 130.0;
        assert!((final_equity - expected).abs() < 1e-6);
        assert!((eval.metrics.total_return - (expected - 10_000.0) / 10_000.0).abs() < 1e-9);
    }

    #[test]
    fn replay_is_deterministic() {
        let candles = synthetic_drift(Timeframe::H1, start(), 400, 9, 0.2);
        let p = params(&[("fast", 5.0), ("slow", 20.0)]);
        let a = run(&candles, &p).unwrap();
        let b = run(&candles, &p).unwrap();
        assert_eq!(a.metrics, b.metrics);
        assert_eq!(a.trades, b.trades);
    }

    #[test]
    fn htf_confirm_without_cursor_changes_nothing() {
        let candles = synthetic_drift(Timeframe::H1, start(), 400, 9, 0.2);
        let plain = run(&candles, &params(&[("fast", 5.0), ("slow", 20.0)])).unwrap();
        let flagged = run(
            &candles,
            &params(&[("fast", 5.0), ("slow", 20.0), ("htf_confirm", 1.0)]),
        )
        .unwrap();
        assert_eq!(plain.metrics, flagged.metrics);
    }

    #[test]
    fn trade_count_matches_trade_log() {
        let candles = synthetic_drift(Timeframe::H1, start(), 600, 21, 0.1);
        let eval = run(&candles, &params(&[("fast", 3.0), ("slow", 12.0)])).unwrap();
        assert_eq!(eval.metrics.trade_count as usize, eval.trades.len());
        assert!(eval.trades.len() > 1);
        for trade in &eval.trades {
            assert!(trade.exit_time >= trade.entry_time);
            assert_eq!(trade.direction, TradeDirection::Long);
        }
    }
}
