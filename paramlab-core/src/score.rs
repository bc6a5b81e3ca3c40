//! Robustness scoring: a direction-aware weighted blend of evaluation metrics.
//!
//! Each objective squashes its raw metric through `atan(value / scale)`,
//! mapping any real value into (-1, 1) without needing to see the rest of
//! the result population first. That keeps scoring a pure per-result
//! function, which the streaming top-N design depends on.

use std::f64::consts::FRAC_PI_2;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::result::{EvaluationMetrics, MetricId};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScoreError {
    #[error("objective set is empty")]
    Empty,
    #[error("objective {metric:?}: weight must be positive and finite, got {weight}")]
    BadWeight { metric: MetricId, weight: f64 },
    #[error("objective {metric:?}: scale must be positive and finite, got {scale}")]
    BadScale { metric: MetricId, scale: f64 },
}

/// Whether larger raw values of a metric should raise or lower the score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Maximize,
    Minimize,
}

/// One scored dimension: which metric, how much it matters, and the raw value
/// at which the squash reaches half strength.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Objective {
    pub metric: MetricId,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub direction: Direction,
}

fn default_weight() -> f64 {
    1.0
}

fn default_scale() -> f64 {
    1.0
}

impl Objective {
    pub fn new(metric: MetricId, weight: f64, scale: f64) -> Self {
        Self {
            metric,
            weight,
            scale,
            direction: Direction::Maximize,
        }
    }

    /// Normalized contribution in (-1, 1). NaN propagates so downstream
    /// finiteness checks can reject the whole result.
    fn normalized(&self, metrics: &EvaluationMetrics) -> f64 {
        let raw = self.metric.extract(metrics);
        let signed = match self.direction {
            Direction::Maximize => raw,
            Direction::Minimize => -raw,
        };
        (signed / self.scale).atan() / FRAC_PI_2
    }
}

/// A validated, weighted set of objectives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectiveSet {
    objectives: Vec<Objective>,
}

impl ObjectiveSet {
    pub fn new(objectives: Vec<Objective>) -> Result<Self, ScoreError> {
        let set = Self { objectives };
        set.validate()?;
        Ok(set)
    }

    pub fn validate(&self) -> Result<(), ScoreError> {
        if self.objectives.is_empty() {
            return Err(ScoreError::Empty);
        }
        for obj in &self.objectives {
            if !obj.weight.is_finite() || obj.weight <= 0.0 {
                return Err(ScoreError::BadWeight {
                    metric: obj.metric,
                    weight: obj.weight,
                });
            }
            if !obj.scale.is_finite() || obj.scale <= 0.0 {
                return Err(ScoreError::BadScale {
                    metric: obj.metric,
                    scale: obj.scale,
                });
            }
        }
        Ok(())
    }

    pub fn objectives(&self) -> &[Objective] {
        &self.objectives
    }

    /// Weighted mean of normalized contributions, in (-1, 1).
    pub fn score(&self, metrics: &EvaluationMetrics) -> f64 {
        let mut weighted = 0.0;
        let mut total_weight = 0.0;
        for obj in &self.objectives {
            weighted += obj.weight * obj.normalized(metrics);
            total_weight += obj.weight;
        }
        weighted / total_weight
    }

    /// The stock blend: risk-adjusted return first, then raw return,
    /// drawdown containment, and trade quality.
    pub fn default_robustness() -> Self {
        Self {
            objectives: vec![
                Objective::new(MetricId::Sharpe, 0.35, 1.0),
                Objective::new(MetricId::TotalReturn, 0.25, 0.5),
                Objective::new(MetricId::MaxDrawdown, 0.25, 0.2),
                Objective::new(MetricId::ProfitFactor, 0.15, 2.0),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics_with_sharpe(sharpe: f64) -> EvaluationMetrics {
        EvaluationMetrics {
            sharpe,
            ..EvaluationMetrics::flat()
        }
    }

    #[test]
    fn score_is_bounded() {
        let set = ObjectiveSet::new(vec![Objective::new(MetricId::Sharpe, 1.0, 1.0)]).unwrap();
        for sharpe in [-1e9, -3.0, 0.0, 3.0, 1e9] {
            let s = set.score(&metrics_with_sharpe(sharpe));
            assert!(s > -1.0 && s < 1.0, "score {s} out of bounds");
        }
    }

    #[test]
    fn score_is_monotone_in_maximized_metric() {
        let set = ObjectiveSet::new(vec![Objective::new(MetricId::Sharpe, 1.0, 1.0)]).unwrap();
        let low = set.score(&metrics_with_sharpe(0.5));
        let high = set.score(&metrics_with_sharpe(2.0));
        assert!(high > low);
    }

    #[test]
    fn minimize_direction_flips_sign() {
        let mut obj = Objective::new(MetricId::TradeCount, 1.0, 100.0);
        obj.direction = Direction::Minimize;
        let set = ObjectiveSet::new(vec![obj]).unwrap();
        let few = EvaluationMetrics {
            trade_count: 5,
            ..EvaluationMetrics::flat()
        };
        let many = EvaluationMetrics {
            trade_count: 500,
            ..EvaluationMetrics::flat()
        };
        assert!(set.score(&few) > set.score(&many));
    }

    #[test]
    fn deeper_drawdown_scores_lower() {
        let set = ObjectiveSet::default_robustness();
        let shallow = EvaluationMetrics {
            max_drawdown: -0.05,
            ..EvaluationMetrics::flat()
        };
        let deep = EvaluationMetrics {
            max_drawdown: -0.40,
            ..EvaluationMetrics::flat()
        };
        assert!(set.score(&shallow) > set.score(&deep));
    }

    #[test]
    fn nan_metric_propagates_to_score() {
        let set = ObjectiveSet::new(vec![Objective::new(MetricId::Sharpe, 1.0, 1.0)]).unwrap();
        assert!(set.score(&metrics_with_sharpe(f64::NAN)).is_nan());
    }

    #[test]
    fn weights_shift_the_blend() {
        let heavy_sharpe = ObjectiveSet::new(vec![
            Objective::new(MetricId::Sharpe, 0.9, 1.0),
            Objective::new(MetricId::TotalReturn, 0.1, 0.5),
        ])
        .unwrap();
        let heavy_return = ObjectiveSet::new(vec![
            Objective::new(MetricId::Sharpe, 0.1, 1.0),
            Objective::new(MetricId::TotalReturn, 0.9, 0.5),
        ])
        .unwrap();
        let m = EvaluationMetrics {
            sharpe: 2.0,
            total_return: -0.3,
            ..EvaluationMetrics::flat()
        };
        assert!(heavy_sharpe.score(&m) > heavy_return.score(&m));
    }

    #[test]
    fn rejects_empty_set() {
        assert_eq!(ObjectiveSet::new(vec![]), Err(ScoreError::Empty));
    }

    #[test]
    fn rejects_bad_weight_and_scale() {
        assert!(matches!(
            ObjectiveSet::new(vec![Objective::new(MetricId::Sharpe, 0.0, 1.0)]),
            Err(ScoreError::BadWeight { .. })
        ));
        assert!(matches!(
            ObjectiveSet::new(vec![Objective::new(MetricId::Sharpe, 1.0, f64::NAN)]),
            Err(ScoreError::BadScale { .. })
        ));
    }

    #[test]
    fn default_robustness_validates() {
        assert!(ObjectiveSet::default_robustness().validate().is_ok());
    }
}
