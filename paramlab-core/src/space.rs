//! Parameter spaces: cartesian grids enumerated lazily, one combination at a time.
//!
//! A space is a list of named numeric dimensions, each `start..=end` in `step`
//! increments. The combination count is the product of per-dimension step
//! counts and is computed without enumerating anything, so precondition checks
//! against a combination ceiling stay O(dims). Iteration decodes a mixed-radix
//! index, which also makes any combination addressable by position.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tolerance for deciding whether `end` lands on a step boundary.
const STEP_EPS: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SpaceError {
    #[error("parameter space has no dimensions")]
    Empty,
    #[error("dimension has an empty name")]
    UnnamedDimension,
    #[error("duplicate dimension `{0}`")]
    DuplicateDimension(String),
    #[error("dimension `{name}`: step must be positive and finite, got {step}")]
    BadStep { name: String, step: f64 },
    #[error("dimension `{name}`: bounds must be finite with start <= end, got {start}..{end}")]
    BadBounds { name: String, start: f64, end: f64 },
}

/// One axis of the grid: `start`, `start + step`, ... up to and including `end`
/// when `end` sits on a step boundary (within floating-point tolerance).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub start: f64,
    pub end: f64,
    pub step: f64,
}

impl ParameterSpec {
    pub fn new(
        name: impl Into<String>,
        start: f64,
        end: f64,
        step: f64,
    ) -> Result<Self, SpaceError> {
        let spec = Self {
            name: name.into(),
            start,
            end,
            step,
        };
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<(), SpaceError> {
        if self.name.trim().is_empty() {
            return Err(SpaceError::UnnamedDimension);
        }
        if !self.step.is_finite() || self.step <= 0.0 {
            return Err(SpaceError::BadStep {
                name: self.name.clone(),
                step: self.step,
            });
        }
        if !self.start.is_finite() || !self.end.is_finite() || self.start > self.end {
            return Err(SpaceError::BadBounds {
                name: self.name.clone(),
                start: self.start,
                end: self.end,
            });
        }
        Ok(())
    }

    /// Number of values on this axis. Always at least 1 for a valid spec.
    pub fn step_count(&self) -> u64 {
        ((self.end - self.start) / self.step + STEP_EPS).floor() as u64 + 1
    }

    /// Value at position `i`, clamped to `end` so accumulated floating-point
    /// drift never yields a value outside the declared bounds.
    pub fn value_at(&self, i: u64) -> Option<f64> {
        if i >= self.step_count() {
            return None;
        }
        let v = self.start + (i as f64) * self.step;
        Some(if v > self.end { self.end } else { v })
    }
}

/// One concrete assignment of every dimension, keyed by dimension name.
///
/// Backed by a BTreeMap so serialization and hashing are order-independent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ParameterSet {
    values: BTreeMap<String, f64>,
}

impl ParameterSet {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Canonical `name=value` rendering, used in logs and artifact manifests.
    pub fn label(&self) -> String {
        self.to_string()
    }
}

impl FromIterator<(String, f64)> for ParameterSet {
    fn from_iter<T: IntoIterator<Item = (String, f64)>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for ParameterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, value) in &self.values {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{name}={value}")?;
            first = false;
        }
        Ok(())
    }
}

/// A validated grid of parameter dimensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpace {
    dims: Vec<ParameterSpec>,
}

impl ParameterSpace {
    pub fn new(dims: Vec<ParameterSpec>) -> Result<Self, SpaceError> {
        if dims.is_empty() {
            return Err(SpaceError::Empty);
        }
        for (i, dim) in dims.iter().enumerate() {
            dim.validate()?;
            if dims[..i].iter().any(|d| d.name == dim.name) {
                return Err(SpaceError::DuplicateDimension(dim.name.clone()));
            }
        }
        Ok(Self { dims })
    }

    pub fn dims(&self) -> &[ParameterSpec] {
        &self.dims
    }

    /// Product of per-dimension step counts. Saturates at `u64::MAX`, which
    /// any sane combination ceiling rejects long before it matters.
    pub fn combination_count(&self) -> u64 {
        self.dims
            .iter()
            .map(ParameterSpec::step_count)
            .try_fold(1u64, |acc, n| acc.checked_mul(n))
            .unwrap_or(u64::MAX)
    }

    /// Decode the combination at `index` (row-major, first dimension slowest).
    /// O(dims); no other combination is touched.
    pub fn combination_at(&self, index: u64) -> Option<ParameterSet> {
        if index >= self.combination_count() {
            return None;
        }
        let mut remainder = index;
        let mut values = BTreeMap::new();
        for dim in self.dims.iter().rev() {
            let radix = dim.step_count();
            let pos = remainder % radix;
            remainder /= radix;
            // pos < radix, so value_at cannot miss
            values.insert(dim.name.clone(), dim.value_at(pos)?);
        }
        Some(ParameterSet { values })
    }

    /// Fresh lazy iterator over all combinations. Cheap to create, so callers
    /// that need to enumerate the same space more than once simply ask again.
    pub fn iter(&self) -> CombinationIter<'_> {
        CombinationIter {
            space: self,
            next_index: 0,
            total: self.combination_count(),
        }
    }
}

/// Lazy combination stream. Holds only a cursor, never a materialized grid.
#[derive(Debug, Clone)]
pub struct CombinationIter<'a> {
    space: &'a ParameterSpace,
    next_index: u64,
    total: u64,
}

impl CombinationIter<'_> {
    /// Index of the combination the next `next()` call will yield.
    pub fn position(&self) -> u64 {
        self.next_index
    }
}

impl Iterator for CombinationIter<'_> {
    type Item = ParameterSet;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_index >= self.total {
            return None;
        }
        let set = self.space.combination_at(self.next_index)?;
        self.next_index += 1;
        Some(set)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.total - self.next_index) as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for CombinationIter<'_> {}
