//! Job specifications: the TOML document that describes one pipeline run,
//! and its compilation into an enumerable parameter space.
//!
//! A spec carries rich dimensions (numeric ranges, booleans, categorical
//! choices, each with an enabled/locked flag). Compilation lowers them to
//! the core grid: enabled, unlocked dimensions become numeric axes while
//! everything else is pinned at its default and merged into every
//! combination. Zero enumerable dimensions still yield exactly one
//! combination, the all-defaults case.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use paramlab_core::{
    CombinationIter, DateRange, Objective, ObjectiveSet, ParameterSet, ParameterSpace,
    ParameterSpec, ScoreError, SpaceError, SpecHash, Timeframe, ValidationMode,
};

use crate::job::PipelineKind;

#[derive(Debug, Error)]
pub enum SpecError {
    #[error("job spec is not valid TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("job spec could not be serialized: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("job spec names no symbols")]
    NoSymbols,
    #[error("symbol `{0}` appears more than once")]
    DuplicateSymbol(String),
    #[error("pipeline {kind} needs at least {need} symbols, got {have}")]
    NeedsSymbols {
        kind: PipelineKind,
        need: usize,
        have: usize,
    },
    #[error("date range is empty: start {start} is not before end {end}")]
    EmptyRange {
        start: NaiveDateTime,
        end: NaiveDateTime,
    },
    #[error("dimension `{name}`: {reason}")]
    Dimension { name: String, reason: String },
    #[error(transparent)]
    Space(#[from] SpaceError),
    #[error(transparent)]
    Objectives(#[from] ScoreError),
    #[error("limit `{name}`: {reason}")]
    Limit {
        name: &'static str,
        reason: String,
    },
    #[error("combination count {count} exceeds the configured ceiling {ceiling}")]
    CeilingExceeded { count: u64, ceiling: u64 },
}

/// One search dimension as written in a job file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionSpec {
    pub name: String,
    #[serde(flatten)]
    pub kind: DimensionKind,
    /// Disabled dimensions are held at default and never enumerated.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Locked dimensions stay enabled conceptually but are pinned at default.
    #[serde(default)]
    pub locked: bool,
}

impl DimensionSpec {
    pub fn numeric(name: impl Into<String>, min: f64, max: f64, step: f64, default: f64) -> Self {
        Self {
            name: name.into(),
            kind: DimensionKind::Numeric {
                min,
                max,
                step,
                default,
            },
            enabled: true,
            locked: false,
        }
    }

    pub fn boolean(name: impl Into<String>, default: bool) -> Self {
        Self {
            name: name.into(),
            kind: DimensionKind::Boolean { default },
            enabled: true,
            locked: false,
        }
    }

    pub fn categorical(name: impl Into<String>, choices: Vec<String>, default: String) -> Self {
        Self {
            name: name.into(),
            kind: DimensionKind::Categorical { choices, default },
            enabled: true,
            locked: false,
        }
    }

    /// Part of the cross-product, or pinned at default?
    pub fn is_enumerable(&self) -> bool {
        self.enabled && !self.locked
    }

    fn validate(&self) -> Result<(), SpecError> {
        if self.name.trim().is_empty() {
            return Err(SpecError::Dimension {
                name: self.name.clone(),
                reason: "name is empty".into(),
            });
        }
        match &self.kind {
            DimensionKind::Numeric {
                min,
                max,
                step,
                default,
            } => {
                if !step.is_finite() || *step <= 0.0 {
                    return Err(SpecError::Dimension {
                        name: self.name.clone(),
                        reason: format!("step must be positive and finite, got {step}"),
                    });
                }
                if !min.is_finite() || !max.is_finite() || min > max {
                    return Err(SpecError::Dimension {
                        name: self.name.clone(),
                        reason: format!("bounds must satisfy min <= max, got {min}..{max}"),
                    });
                }
                if !default.is_finite() || default < min || default > max {
                    return Err(SpecError::Dimension {
                        name: self.name.clone(),
                        reason: format!("default {default} lies outside {min}..{max}"),
                    });
                }
            }
            DimensionKind::Boolean { .. } => {}
            DimensionKind::Categorical { choices, default } => {
                if choices.is_empty() {
                    return Err(SpecError::Dimension {
                        name: self.name.clone(),
                        reason: "categorical dimension has no choices".into(),
                    });
                }
                for (i, choice) in choices.iter().enumerate() {
                    if choices[..i].contains(choice) {
                        return Err(SpecError::Dimension {
                            name: self.name.clone(),
                            reason: format!("choice `{choice}` is listed twice"),
                        });
                    }
                }
                if !choices.contains(default) {
                    return Err(SpecError::Dimension {
                        name: self.name.clone(),
                        reason: format!("default `{default}` is not one of the choices"),
                    });
                }
            }
        }
        Ok(())
    }
}

/// What kind of values a dimension takes. Booleans and categoricals are
/// lowered to integer axes (0/1 and choice indices) for enumeration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DimensionKind {
    Numeric {
        min: f64,
        max: f64,
        step: f64,
        default: f64,
    },
    Boolean {
        default: bool,
    },
    Categorical {
        choices: Vec<String>,
        default: String,
    },
}

impl DimensionKind {
    /// The pinned value when the dimension is locked or disabled.
    pub fn default_value(&self) -> f64 {
        match self {
            Self::Numeric { default, .. } => *default,
            Self::Boolean { default } => {
                if *default {
                    1.0
                } else {
                    0.0
                }
            }
            Self::Categorical { choices, default } => choices
                .iter()
                .position(|c| c == default)
                .map(|i| i as f64)
                .unwrap_or(0.0),
        }
    }

    fn axis(&self, name: &str) -> Result<ParameterSpec, SpaceError> {
        match self {
            Self::Numeric {
                min, max, step, ..
            } => ParameterSpec::new(name, *min, *max, *step),
            Self::Boolean { .. } => ParameterSpec::new(name, 0.0, 1.0, 1.0),
            Self::Categorical { choices, .. } => {
                ParameterSpec::new(name, 0.0, (choices.len() - 1) as f64, 1.0)
            }
        }
    }

    /// Human rendering of a raw grid value for reports and logs.
    pub fn render(&self, raw: f64) -> String {
        match self {
            Self::Numeric { .. } => fmt_num(raw),
            Self::Boolean { .. } => {
                if raw >= 0.5 {
                    "true".into()
                } else {
                    "false".into()
                }
            }
            Self::Categorical { choices, .. } => {
                let index = raw.round();
                if index >= 0.0 && (index as usize) < choices.len() {
                    choices[index as usize].clone()
                } else {
                    fmt_num(raw)
                }
            }
        }
    }
}

fn fmt_num(v: f64) -> String {
    if v.is_finite() && (v - v.round()).abs() < 1e-9 && v.abs() < 1e15 {
        format!("{}", v.round() as i64)
    } else {
        format!("{v}")
    }
}

/// Walk-forward and anti-lookahead settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationSpec {
    /// Strict turns lookahead breaches and window underflow into terminal
    /// errors; lenient records them and keeps going.
    pub mode: ValidationMode,
    /// In-sample window length, in bars.
    pub in_sample_bars: usize,
    /// Out-of-sample window length, in bars.
    pub out_of_sample_bars: usize,
    /// How far each fold advances. 0 means "one out-of-sample window".
    pub step_bars: usize,
    /// Higher timeframe the evaluator may consult; monitored for lookahead.
    pub higher_timeframe: Option<Timeframe>,
}

impl Default for ValidationSpec {
    fn default() -> Self {
        Self {
            mode: ValidationMode::Strict,
            in_sample_bars: 2000,
            out_of_sample_bars: 500,
            step_bars: 0,
            higher_timeframe: None,
        }
    }
}

impl ValidationSpec {
    /// Effective fold advance: explicit step, or the out-of-sample length.
    pub fn effective_step(&self) -> usize {
        if self.step_bars == 0 {
            self.out_of_sample_bars
        } else {
            self.step_bars
        }
    }
}

/// Monte Carlo resampling settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonteCarloSpec {
    pub resamples: u32,
    /// Mean geometric block length of the stationary block bootstrap.
    pub mean_block_len: usize,
}

impl Default for MonteCarloSpec {
    fn default() -> Self {
        Self {
            resamples: 1000,
            mean_block_len: 20,
        }
    }
}

/// Market-regime classification settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeSpec {
    /// Rolling window, in bars, over which trend and volatility are measured.
    pub window_bars: usize,
    /// Trend-strength cutoff: |momentum| / (vol * sqrt(window)) above this
    /// counts as trending.
    pub trend_threshold: f64,
    /// Windows whose realized volatility sits above this sample quantile are
    /// labeled high-volatility.
    pub high_vol_quantile: f64,
}

impl Default for RegimeSpec {
    fn default() -> Self {
        Self {
            window_bars: 96,
            trend_threshold: 0.8,
            high_vol_quantile: 0.75,
        }
    }
}

/// Guard rails and pacing knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitSpec {
    /// Pre-start ceiling on the combination count.
    pub max_combinations: u64,
    /// Capacity of the bounded result store.
    pub top_n: usize,
    /// Combinations per cooperative batch.
    pub combo_batch: u32,
    /// Simulated bars between yields inside one evaluation.
    pub bar_batch: u32,
    /// Fraction of failed combinations (0..=1) above which the job errors.
    pub max_failure_rate: f64,
}

impl Default for LimitSpec {
    fn default() -> Self {
        Self {
            max_combinations: 5000,
            top_n: 50,
            combo_batch: paramlab_core::pace::DEFAULT_COMBO_BATCH,
            bar_batch: paramlab_core::pace::DEFAULT_BAR_BATCH,
            max_failure_rate: 0.25,
        }
    }
}

/// A complete job specification, usually loaded from a TOML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub kind: PipelineKind,
    pub symbols: Vec<String>,
    pub timeframe: Timeframe,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    #[serde(default)]
    pub dimensions: Vec<DimensionSpec>,
    /// Empty means the stock robustness objectives.
    #[serde(default)]
    pub objectives: Vec<Objective>,
    #[serde(default)]
    pub validation: ValidationSpec,
    #[serde(default)]
    pub monte_carlo: MonteCarloSpec,
    #[serde(default)]
    pub regime: RegimeSpec,
    #[serde(default)]
    pub limits: LimitSpec,
    /// Seed for randomized pipelines; fixed default keeps runs reproducible.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Initial capital per evaluation.
    #[serde(default = "default_capital")]
    pub initial_capital: f64,
}

fn default_true() -> bool {
    true
}

fn default_capital() -> f64 {
    10_000.0
}

impl JobSpec {
    /// Bare spec with every optional block at its default.
    pub fn new(
        kind: PipelineKind,
        symbols: Vec<String>,
        timeframe: Timeframe,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Self {
        Self {
            kind,
            symbols,
            timeframe,
            start,
            end,
            dimensions: Vec::new(),
            objectives: Vec::new(),
            validation: ValidationSpec::default(),
            monte_carlo: MonteCarloSpec::default(),
            regime: RegimeSpec::default(),
            limits: LimitSpec::default(),
            seed: None,
            initial_capital: default_capital(),
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, SpecError> {
        Ok(toml::from_str(text)?)
    }

    /// Structural checks only; the combination ceiling is enforced by
    /// [`JobSpec::compile`] once the count is known.
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.symbols.is_empty() {
            return Err(SpecError::NoSymbols);
        }
        for (i, symbol) in self.symbols.iter().enumerate() {
            if self.symbols[..i].contains(symbol) {
                return Err(SpecError::DuplicateSymbol(symbol.clone()));
            }
        }
        if self.kind == PipelineKind::Portfolio && self.symbols.len() < 2 {
            return Err(SpecError::NeedsSymbols {
                kind: self.kind,
                need: 2,
                have: self.symbols.len(),
            });
        }
        if self.start >= self.end {
            return Err(SpecError::EmptyRange {
                start: self.start,
                end: self.end,
            });
        }
        for (i, dim) in self.dimensions.iter().enumerate() {
            dim.validate()?;
            if self.dimensions[..i].iter().any(|d| d.name == dim.name) {
                return Err(SpecError::Dimension {
                    name: dim.name.clone(),
                    reason: "dimension declared twice".into(),
                });
            }
        }
        self.objective_set()?;
        if self.limits.max_combinations == 0 {
            return Err(SpecError::Limit {
                name: "max_combinations",
                reason: "must be at least 1".into(),
            });
        }
        if self.limits.top_n == 0 {
            return Err(SpecError::Limit {
                name: "top_n",
                reason: "must be at least 1".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.limits.max_failure_rate) {
            return Err(SpecError::Limit {
                name: "max_failure_rate",
                reason: format!("must be within 0..=1, got {}", self.limits.max_failure_rate),
            });
        }
        if self.kind == PipelineKind::WalkForward {
            if self.validation.in_sample_bars == 0 || self.validation.out_of_sample_bars == 0 {
                return Err(SpecError::Limit {
                    name: "validation",
                    reason: "in_sample_bars and out_of_sample_bars must be positive".into(),
                });
            }
        }
        if self.kind == PipelineKind::MonteCarlo {
            if self.monte_carlo.resamples == 0 {
                return Err(SpecError::Limit {
                    name: "monte_carlo.resamples",
                    reason: "must be at least 1".into(),
                });
            }
            if self.monte_carlo.mean_block_len == 0 {
                return Err(SpecError::Limit {
                    name: "monte_carlo.mean_block_len",
                    reason: "must be at least 1".into(),
                });
            }
        }
        if self.kind == PipelineKind::Regime && self.regime.window_bars < 2 {
            return Err(SpecError::Limit {
                name: "regime.window_bars",
                reason: "must be at least 2".into(),
            });
        }
        if !self.initial_capital.is_finite() || self.initial_capital <= 0.0 {
            return Err(SpecError::Limit {
                name: "initial_capital",
                reason: format!("must be positive, got {}", self.initial_capital),
            });
        }
        Ok(())
    }

    /// Validate, lower the dimensions onto the core grid, and enforce the
    /// combination ceiling. This is the whole pre-start guard rail except
    /// for dataset coverage, which needs the historical store.
    pub fn compile(&self) -> Result<CompiledSpace, SpecError> {
        self.validate()?;

        let mut axes = Vec::new();
        let mut pinned = Vec::new();
        let mut kinds = BTreeMap::new();
        for dim in &self.dimensions {
            kinds.insert(dim.name.clone(), dim.kind.clone());
            if dim.is_enumerable() {
                axes.push(dim.kind.axis(&dim.name)?);
            } else {
                pinned.push((dim.name.clone(), dim.kind.default_value()));
            }
        }

        let space = if axes.is_empty() {
            None
        } else {
            Some(ParameterSpace::new(axes)?)
        };
        let compiled = CompiledSpace {
            space,
            pinned: pinned.into_iter().collect(),
            kinds,
        };

        let count = compiled.combination_count();
        if count > self.limits.max_combinations {
            return Err(SpecError::CeilingExceeded {
                count,
                ceiling: self.limits.max_combinations,
            });
        }
        Ok(compiled)
    }

    /// The scoring objectives, falling back to the stock robustness set.
    pub fn objective_set(&self) -> Result<ObjectiveSet, SpecError> {
        if self.objectives.is_empty() {
            Ok(ObjectiveSet::default_robustness())
        } else {
            Ok(ObjectiveSet::new(self.objectives.clone())?)
        }
    }

    pub fn range(&self) -> Result<DateRange, SpecError> {
        DateRange::new(self.start, self.end).ok_or(SpecError::EmptyRange {
            start: self.start,
            end: self.end,
        })
    }

    /// Deterministic content hash; two identical specs share one hash.
    pub fn spec_hash(&self) -> Result<SpecHash, SpecError> {
        let value = serde_json::to_value(self)?;
        Ok(SpecHash::of_canonical_json(&value))
    }
}

/// A job spec lowered onto the core grid: enumerable axes plus pinned
/// defaults merged into every combination.
#[derive(Debug, Clone)]
pub struct CompiledSpace {
    space: Option<ParameterSpace>,
    pinned: ParameterSet,
    kinds: BTreeMap<String, DimensionKind>,
}

impl CompiledSpace {
    /// 1 when nothing is enumerable (the all-defaults case).
    pub fn combination_count(&self) -> u64 {
        self.space
            .as_ref()
            .map_or(1, ParameterSpace::combination_count)
    }

    pub fn enumerable_dims(&self) -> usize {
        self.space.as_ref().map_or(0, |s| s.dims().len())
    }

    pub fn pinned(&self) -> &ParameterSet {
        &self.pinned
    }

    /// Combination at `index` with pinned defaults merged in.
    pub fn combination_at(&self, index: u64) -> Option<ParameterSet> {
        match &self.space {
            Some(space) => space.combination_at(index).map(|set| self.merge(set)),
            None if index == 0 => Some(self.pinned.clone()),
            None => None,
        }
    }

    pub fn iter(&self) -> CompiledIter<'_> {
        CompiledIter {
            owner: self,
            inner: self.space.as_ref().map(ParameterSpace::iter),
            emitted_pinned: false,
        }
    }

    /// All-defaults assignment, used by pipelines that take no grid.
    pub fn defaults(&self) -> ParameterSet {
        self.kinds
            .iter()
            .map(|(name, kind)| (name.clone(), kind.default_value()))
            .collect()
    }

    /// Raw grid values mapped back to human form (choice labels, booleans).
    pub fn render(&self, params: &ParameterSet) -> BTreeMap<String, String> {
        params
            .iter()
            .map(|(name, raw)| {
                let text = match self.kinds.get(name) {
                    Some(kind) => kind.render(raw),
                    None => fmt_num(raw),
                };
                (name.to_string(), text)
            })
            .collect()
    }

    fn merge(&self, combo: ParameterSet) -> ParameterSet {
        if self.pinned.is_empty() {
            return combo;
        }
        self.pinned
            .iter()
            .map(|(k, v)| (k.to_string(), v))
            .chain(combo.iter().map(|(k, v)| (k.to_string(), v)))
            .collect()
    }
}

/// Lazy stream of merged combinations; one assignment in memory at a time.
pub struct CompiledIter<'a> {
    owner: &'a CompiledSpace,
    inner: Option<CombinationIter<'a>>,
    emitted_pinned: bool,
}

impl Iterator for CompiledIter<'_> {
    type Item = ParameterSet;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            Some(iter) => iter.next().map(|set| self.owner.merge(set)),
            None if !self.emitted_pinned => {
                self.emitted_pinned = true;
                Some(self.owner.pinned.clone())
            }
            None => None,
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match &self.inner {
            Some(iter) => iter.size_hint(),
            None if !self.emitted_pinned => (1, Some(1)),
            None => (0, Some(0)),
        }
    }
}

impl ExactSizeIterator for CompiledIter<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use paramlab_core::MetricId;

    fn window() -> (NaiveDateTime, NaiveDateTime) {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        (start, end)
    }

    fn grid_spec() -> JobSpec {
        let (start, end) = window();
        let mut spec = JobSpec::new(
            PipelineKind::GridSearch,
            vec!["BTCUSDT".into()],
            Timeframe::M5,
            start,
            end,
        );
        spec.dimensions = vec![
            DimensionSpec::numeric("fast", 5.0, 20.0, 5.0, 10.0),
            DimensionSpec::numeric("slow", 50.0, 200.0, 50.0, 100.0),
        ];
        spec
    }

    #[test]
    fn toml_round_trip() {
        let text = r#"
            kind = "GRID_SEARCH"
            symbols = ["BTCUSDT"]
            timeframe = "M5"
            start = "2024-01-01T00:00:00"
            end = "2024-03-01T00:00:00"
            seed = 7

            [[dimensions]]
            name = "fast"
            type = "NUMERIC"
            min = 5.0
            max = 20.0
            step = 5.0
            default = 10.0

            [[dimensions]]
            name = "use_stop"
            type = "BOOLEAN"
            default = true
            locked = true

            [[dimensions]]
            name = "exit"
            type = "CATEGORICAL"
            choices = ["cross", "stop", "trail"]
            default = "cross"
            enabled = false

            [[objectives]]
            metric = "sharpe"
            weight = 0.6

            [[objectives]]
            metric = "max_drawdown"
            weight = 0.4
            scale = 0.2

            [limits]
            max_combinations = 100
            top_n = 10
        "#;

        let spec = JobSpec::from_toml_str(text).unwrap();
        assert_eq!(spec.kind, PipelineKind::GridSearch);
        assert_eq!(spec.seed, Some(7));
        assert_eq!(spec.dimensions.len(), 3);
        assert!(spec.dimensions[1].locked);
        assert!(!spec.dimensions[2].enabled);
        assert_eq!(spec.objectives[0].metric, MetricId::Sharpe);
        assert_eq!(spec.limits.top_n, 10);
        // defaulted blocks
        assert_eq!(spec.validation.mode, ValidationMode::Strict);
        assert_eq!(spec.monte_carlo.resamples, 1000);

        let rendered = toml::to_string(&spec).unwrap();
        let back = JobSpec::from_toml_str(&rendered).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn minimal_toml_applies_defaults() {
        let text = r#"
            kind = "REGIME"
            symbols = ["ETHUSDT"]
            timeframe = "H1"
            start = "2024-01-01T00:00:00"
            end = "2024-06-01T00:00:00"
        "#;
        let spec = JobSpec::from_toml_str(text).unwrap();
        assert!(spec.dimensions.is_empty());
        assert_eq!(spec.limits.max_combinations, 5000);
        assert_eq!(spec.regime.window_bars, 96);
        assert_eq!(spec.initial_capital, 10_000.0);
        spec.validate().unwrap();
    }

    #[test]
    fn compile_counts_the_cross_product() {
        let spec = grid_spec();
        let compiled = spec.compile().unwrap();
        // fast: 4 values, slow: 4 values
        assert_eq!(compiled.combination_count(), 16);
        assert_eq!(compiled.iter().count(), 16);
    }

    #[test]
    fn locked_and_disabled_dimensions_are_pinned() {
        let mut spec = grid_spec();
        spec.dimensions.push(DimensionSpec {
            locked: true,
            ..DimensionSpec::boolean("use_stop", true)
        });
        spec.dimensions.push(DimensionSpec {
            enabled: false,
            ..DimensionSpec::numeric("risk", 0.5, 2.0, 0.5, 1.0)
        });

        let compiled = spec.compile().unwrap();
        assert_eq!(compiled.combination_count(), 16);
        let first = compiled.combination_at(0).unwrap();
        assert_eq!(first.get("use_stop"), Some(1.0));
        assert_eq!(first.get("risk"), Some(1.0));
        assert_eq!(first.len(), 4);
    }

    #[test]
    fn zero_enumerable_dimensions_yield_one_combination() {
        let mut spec = grid_spec();
        for dim in &mut spec.dimensions {
            dim.locked = true;
        }
        let compiled = spec.compile().unwrap();
        assert_eq!(compiled.combination_count(), 1);

        let all: Vec<_> = compiled.iter().collect();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].get("fast"), Some(10.0));
        assert_eq!(all[0].get("slow"), Some(100.0));
        assert_eq!(compiled.combination_at(0).unwrap(), all[0]);
        assert!(compiled.combination_at(1).is_none());
    }

    #[test]
    fn boolean_and_categorical_axes_enumerate_their_arity() {
        let (start, end) = window();
        let mut spec = JobSpec::new(
            PipelineKind::GridSearch,
            vec!["BTCUSDT".into()],
            Timeframe::M5,
            start,
            end,
        );
        spec.dimensions = vec![
            DimensionSpec::boolean("use_stop", false),
            DimensionSpec::categorical(
                "exit",
                vec!["cross".into(), "stop".into(), "trail".into()],
                "stop".into(),
            ),
        ];
        let compiled = spec.compile().unwrap();
        assert_eq!(compiled.combination_count(), 6);

        let rendered = compiled.render(&compiled.combination_at(5).unwrap());
        assert_eq!(rendered["use_stop"], "true");
        assert_eq!(rendered["exit"], "trail");
    }

    #[test]
    fn numeric_default_outside_bounds_is_rejected() {
        let mut spec = grid_spec();
        spec.dimensions[0] = DimensionSpec::numeric("fast", 5.0, 20.0, 5.0, 25.0);
        assert!(matches!(
            spec.validate(),
            Err(SpecError::Dimension { name, .. }) if name == "fast"
        ));
    }

    #[test]
    fn categorical_default_must_be_a_choice() {
        let mut spec = grid_spec();
        spec.dimensions.push(DimensionSpec::categorical(
            "exit",
            vec!["cross".into()],
            "missing".into(),
        ));
        assert!(spec.validate().is_err());
    }

    #[test]
    fn duplicate_dimension_names_are_rejected() {
        let mut spec = grid_spec();
        spec.dimensions
            .push(DimensionSpec::numeric("fast", 1.0, 2.0, 1.0, 1.0));
        assert!(matches!(
            spec.validate(),
            Err(SpecError::Dimension { reason, .. }) if reason.contains("twice")
        ));
    }

    #[test]
    fn ceiling_is_enforced_at_compile() {
        let mut spec = grid_spec();
        // 100 x 100 = 10_000 combinations against a ceiling of 5_000.
        spec.dimensions = vec![
            DimensionSpec::numeric("fast", 1.0, 100.0, 1.0, 10.0),
            DimensionSpec::numeric("slow", 1.0, 100.0, 1.0, 50.0),
        ];
        spec.limits.max_combinations = 5000;
        assert!(matches!(
            spec.compile(),
            Err(SpecError::CeilingExceeded {
                count: 10_000,
                ceiling: 5000
            })
        ));
    }

    #[test]
    fn portfolio_requires_two_symbols() {
        let (start, end) = window();
        let spec = JobSpec::new(
            PipelineKind::Portfolio,
            vec!["BTCUSDT".into()],
            Timeframe::H1,
            start,
            end,
        );
        assert!(matches!(
            spec.validate(),
            Err(SpecError::NeedsSymbols { need: 2, have: 1, .. })
        ));
    }

    #[test]
    fn empty_objectives_fall_back_to_robustness_defaults() {
        let spec = grid_spec();
        let set = spec.objective_set().unwrap();
        assert_eq!(set.objectives().len(), 4);
    }

    #[test]
    fn spec_hash_is_stable_and_sensitive() {
        let spec = grid_spec();
        assert_eq!(spec.spec_hash().unwrap(), spec.spec_hash().unwrap());

        let mut other = grid_spec();
        other.limits.top_n = 5;
        assert_ne!(spec.spec_hash().unwrap(), other.spec_hash().unwrap());
    }

    #[test]
    fn reversed_range_is_rejected() {
        let (start, end) = window();
        let spec = JobSpec::new(
            PipelineKind::GridSearch,
            vec!["BTCUSDT".into()],
            Timeframe::M5,
            end,
            start,
        );
        assert!(matches!(spec.validate(), Err(SpecError::EmptyRange { .. })));
    }
}
