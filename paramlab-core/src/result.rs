//! Evaluation results: the metrics one strategy evaluation produces, and the
//! per-combination record the optimization loop accumulates.

use serde::{Deserialize, Serialize};

use crate::space::ParameterSet;

/// Summary statistics for one evaluation of one parameter combination.
///
/// Conventions: `total_return` and `win_rate` are fractions, `max_drawdown`
/// is a non-positive fraction (0 means no drawdown, -0.25 means a 25% dip),
/// `net_profit` and `expectancy` are in account currency.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvaluationMetrics {
    pub net_profit: f64,
    pub total_return: f64,
    pub sharpe: f64,
    pub max_drawdown: f64,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub expectancy: f64,
    pub trade_count: u32,
}

impl EvaluationMetrics {
    /// All-zero metrics, the result of an evaluation that never traded.
    pub fn flat() -> Self {
        Self {
            net_profit: 0.0,
            total_return: 0.0,
            sharpe: 0.0,
            max_drawdown: 0.0,
            win_rate: 0.0,
            profit_factor: 0.0,
            expectancy: 0.0,
            trade_count: 0,
        }
    }
}

/// Names one field of [`EvaluationMetrics`], for objective configuration.
///
/// Higher is better for every metric under these conventions; `max_drawdown`
/// is stored negative, so values closer to zero already rank higher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricId {
    NetProfit,
    TotalReturn,
    #[default]
    Sharpe,
    MaxDrawdown,
    WinRate,
    ProfitFactor,
    Expectancy,
    TradeCount,
}

impl MetricId {
    pub fn extract(&self, metrics: &EvaluationMetrics) -> f64 {
        match self {
            Self::NetProfit => metrics.net_profit,
            Self::TotalReturn => metrics.total_return,
            Self::Sharpe => metrics.sharpe,
            Self::MaxDrawdown => metrics.max_drawdown,
            Self::WinRate => metrics.win_rate,
            Self::ProfitFactor => metrics.profit_factor,
            Self::Expectancy => metrics.expectancy,
            Self::TradeCount => f64::from(metrics.trade_count),
        }
    }
}

/// One scored grid point: which combination, what it measured, how it ranked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinationResult {
    /// Position in the space's enumeration order.
    pub index: u64,
    pub params: ParameterSet,
    pub metrics: EvaluationMetrics,
    /// Robustness score; non-finite scores are rejected by the result store.
    pub score: f64,
}
