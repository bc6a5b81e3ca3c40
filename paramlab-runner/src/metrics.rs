//! Pure functions that turn an equity curve and a trade log into the
//! statistics the optimizer scores on.
//!
//! Markets here trade around the clock, so annualization uses calendar
//! minutes per year divided by the bar size rather than a trading-day count.

use paramlab_core::{EvaluationMetrics, Timeframe};

use crate::evaluator::TradeRecord;

const MINUTES_PER_YEAR: f64 = 365.0 * 24.0 * 60.0;

/// Bars per year for a timeframe, assuming a 24/7 market.
pub fn periods_per_year(timeframe: Timeframe) -> f64 {
    MINUTES_PER_YEAR / timeframe.minutes() as f64
}

/// All metrics for one evaluation in a single pass.
pub fn compute(
    equity: &[f64],
    trades: &[TradeRecord],
    initial_capital: f64,
    timeframe: Timeframe,
) -> EvaluationMetrics {
    let net_profit = equity.last().map_or(0.0, |last| last - initial_capital);
    EvaluationMetrics {
        net_profit,
        total_return: total_return(equity),
        sharpe: sharpe_ratio(equity, timeframe),
        max_drawdown: max_drawdown(equity),
        win_rate: win_rate(trades),
        profit_factor: profit_factor(trades),
        expectancy: expectancy(trades),
        trade_count: trades.len() as u32,
    }
}

/// Fractional return over the whole curve. Needs at least two points and a
/// positive starting value; degenerate input reads as flat.
pub fn total_return(equity: &[f64]) -> f64 {
    if equity.len() < 2 {
        return 0.0;
    }
    let initial = equity[0];
    if initial <= 0.0 {
        return 0.0;
    }
    (equity[equity.len() - 1] - initial) / initial
}

/// Per-bar fractional changes of the curve. Bars starting from a
/// non-positive value are dropped rather than producing infinities.
pub fn bar_returns(equity: &[f64]) -> Vec<f64> {
    equity
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect()
}

/// Annualized Sharpe ratio of the bar returns with a zero risk-free rate.
/// A flat curve has no variance to reward, so it reads as 0.
pub fn sharpe_ratio(equity: &[f64], timeframe: Timeframe) -> f64 {
    let returns = bar_returns(equity);
    if returns.len() < 2 {
        return 0.0;
    }
    let mean = mean_f64(&returns);
    let std = std_dev(&returns);
    if std < 1e-15 {
        return 0.0;
    }
    (mean / std) * periods_per_year(timeframe).sqrt()
}

/// Deepest peak-to-trough loss as a negative fraction, 0 for a curve that
/// never falls below its running peak.
pub fn max_drawdown(equity: &[f64]) -> f64 {
    let mut peak = f64::MIN;
    let mut worst = 0.0_f64;
    for &value in equity {
        if value > peak {
            peak = value;
        }
        if peak > 0.0 {
            let drawdown = (value - peak) / peak;
            if drawdown < worst {
                worst = drawdown;
            }
        }
    }
    worst
}

/// Fraction of trades that closed positive. No trades reads as 0.
pub fn win_rate(trades: &[TradeRecord]) -> f64 {
    if trades.is_empty() {
        return 0.0;
    }
    let winners = trades.iter().filter(|t| t.is_winner()).count();
    winners as f64 / trades.len() as f64
}

/// Gross profit over gross loss, capped at 100 so an all-winning run stays
/// finite and serializable.
pub fn profit_factor(trades: &[TradeRecord]) -> f64 {
    if trades.is_empty() {
        return 0.0;
    }
    let gross_profit: f64 = trades.iter().map(|t| t.pnl.max(0.0)).sum();
    let gross_loss: f64 = trades.iter().map(|t| (-t.pnl).max(0.0)).sum();
    if gross_loss < 1e-10 {
        if gross_profit > 0.0 {
            return 100.0;
        }
        return 0.0;
    }
    (gross_profit / gross_loss).min(100.0)
}

/// Average profit per trade in account currency.
pub fn expectancy(trades: &[TradeRecord]) -> f64 {
    if trades.is_empty() {
        return 0.0;
    }
    let net: f64 = trades.iter().map(|t| t.pnl).sum();
    net / trades.len() as f64
}

/// Value at quantile `q` of an ascending-sorted slice, with linear
/// interpolation between ranks.
pub fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let q = q.clamp(0.0, 1.0);
    let rank = q * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        return sorted[lo];
    }
    let frac = rank - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

pub(crate) fn mean_f64(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation; fewer than two values reads as 0.
pub(crate) fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = mean_f64(values);
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use crate::evaluator::TradeDirection;

    fn make_trade(pnl: f64) -> TradeRecord {
        let t = NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        TradeRecord {
            symbol: "TESTUSD".to_string(),
            direction: TradeDirection::Long,
            entry_time: t,
            exit_time: t,
            entry_price: 100.0,
            exit_price: 100.0 + pnl,
            quantity: 1.0,
            pnl,
            return_pct: pnl / 100.0,
        }
    }

    #[test]
    fn total_return_on_a_known_curve() {
        assert_eq!(total_return(&[100.0, 120.0]), 0.2);
        assert_eq!(total_return(&[100.0]), 0.0);
        assert_eq!(total_return(&[0.0, 50.0]), 0.0);
    }

    #[test]
    fn drawdown_on_a_known_curve() {
        // Peak 120, trough 90.
        let dd = max_drawdown(&[100.0, 120.0, 90.0, 130.0]);
        assert!((dd - (-0.25)).abs() < 1e-12);
        assert_eq!(max_drawdown(&[100.0, 110.0, 120.0]), 0.0);
        assert_eq!(max_drawdown(&[]), 0.0);
    }

    #[test]
    fn flat_curve_has_zero_sharpe() {
        assert_eq!(sharpe_ratio(&[100.0; 50], Timeframe::H1), 0.0);
        assert_eq!(sharpe_ratio(&[100.0, 101.0], Timeframe::H1), 0.0);
    }

    #[test]
    fn rising_curve_has_positive_sharpe() {
        let curve: Vec<f64> = (0..100)
            .map(|i| 100.0 * (1.0_f64 + 0.001).powi(i) + if i % 2 == 0 { 0.01 } else { -0.01 })
            .collect();
        assert!(sharpe_ratio(&curve, Timeframe::H1) > 0.0);
    }

    #[test]
    fn annualization_scales_with_bar_size() {
        assert_eq!(periods_per_year(Timeframe::D1), 365.0);
        assert_eq!(periods_per_year(Timeframe::H1), 365.0 * 24.0);
        let curve: Vec<f64> = (0..60).map(|i| 100.0 + (i % 7) as f64 + i as f64 * 0.3).collect();
        let h1 = sharpe_ratio(&curve, Timeframe::H1);
        let d1 = sharpe_ratio(&curve, Timeframe::D1);
        assert!((h1 / d1 - 24.0_f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn win_rate_counts_positive_trades() {
        let trades = vec![make_trade(50.0), make_trade(-20.0), make_trade(30.0)];
        assert!((win_rate(&trades) - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(win_rate(&[]), 0.0);
    }

    #[test]
    fn profit_factor_is_capped_for_flawless_runs() {
        let winners = vec![make_trade(50.0), make_trade(10.0)];
        assert_eq!(profit_factor(&winners), 100.0);
        let mixed = vec![make_trade(60.0), make_trade(-30.0)];
        assert!((profit_factor(&mixed) - 2.0).abs() < 1e-12);
        assert_eq!(profit_factor(&[]), 0.0);
        let losers = vec![make_trade(-10.0)];
        assert_eq!(profit_factor(&losers), 0.0);
    }

    #[test]
    fn expectancy_is_mean_pnl() {
        let trades = vec![make_trade(50.0), make_trade(-20.0)];
        assert!((expectancy(&trades) - 15.0).abs() < 1e-12);
        assert_eq!(expectancy(&[]), 0.0);
    }

    #[test]
    fn percentile_interpolates_between_ranks() {
        let sorted = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile(&sorted, 0.0), 1.0);
        assert_eq!(percentile(&sorted, 1.0), 4.0);
        assert_eq!(percentile(&sorted, 0.5), 2.5);
        assert!((percentile(&sorted, 0.25) - 1.75).abs() < 1e-12);
        assert_eq!(percentile(&[], 0.5), 0.0);
        assert_eq!(percentile(&[7.0], 0.9), 7.0);
    }

    #[test]
    fn std_dev_uses_sample_variance() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        // Sample variance of this classic set is 32/7.
        assert!((std_dev(&values) - (32.0_f64 / 7.0).sqrt()).abs() < 1e-12);
        assert_eq!(std_dev(&[1.0]), 0.0);
    }

    #[test]
    fn compute_assembles_all_fields() {
        let equity = [10_000.0, 10_200.0, 9_900.0, 10_500.0];
        let trades = vec![make_trade(300.0), make_trade(200.0)];
        let m = compute(&equity, &trades, 10_000.0, Timeframe::H4);
        assert_eq!(m.net_profit, 500.0);
        assert!((m.total_return - 0.05).abs() < 1e-12);
        assert_eq!(m.trade_count, 2);
        assert_eq!(m.win_rate, 1.0);
        assert_eq!(m.profit_factor, 100.0);
        assert_eq!(m.expectancy, 250.0);
        assert!(m.max_drawdown < 0.0);
    }

    #[test]
    fn empty_curve_is_all_zeroes() {
        let m = compute(&[], &[], 10_000.0, Timeframe::M15);
        assert_eq!(m.net_profit, 0.0);
        assert_eq!(m.total_return, 0.0);
        assert_eq!(m.sharpe, 0.0);
        assert_eq!(m.trade_count, 0);
    }
}
