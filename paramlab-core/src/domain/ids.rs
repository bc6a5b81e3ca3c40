//! Deterministic identifiers for runs, job specs, and datasets.

use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Content hash of a canonicalized candle dataset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetHash(pub String);

impl DatasetHash {
    pub fn from_hash(hash: &str) -> Self {
        Self(hash.to_string())
    }

    /// First 12 hex chars, for log lines and artifact names.
    pub fn short(&self) -> &str {
        let n = self.0.len().min(12);
        &self.0[..n]
    }
}

impl fmt::Display for DatasetHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hash of a job specification: strategy id, parameter space, objectives,
/// data window. Two submissions of the same spec share a SpecHash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpecHash(pub String);

impl SpecHash {
    /// BLAKE3 over a canonical JSON rendering (serde_json sorts map keys,
    /// so the same logical spec always hashes identically).
    pub fn of_canonical_json(value: &serde_json::Value) -> Self {
        let hash = blake3::hash(value.to_string().as_bytes());
        Self(hash.to_hex().to_string())
    }

    pub fn short(&self) -> &str {
        let n = self.0.len().min(12);
        &self.0[..n]
    }
}

impl fmt::Display for SpecHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique handle for one pipeline run: `<kind>-<timestamp>-<hash prefix>`.
///
/// The embedded hash covers the spec hash and start instant, so two runs of
/// the same spec started at different times get distinct ids while a given
/// (spec, instant) pair is reproducible.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn generate(kind: &str, spec: &SpecHash, started_at: NaiveDateTime) -> Self {
        let nanos = started_at
            .and_utc()
            .timestamp_nanos_opt()
            .unwrap_or_default();
        let mut hasher = blake3::Hasher::new();
        hasher.update(kind.as_bytes());
        hasher.update(spec.0.as_bytes());
        hasher.update(&nanos.to_le_bytes());
        let hex = hasher.finalize().to_hex();
        Self(format!(
            "{kind}-{}-{}",
            started_at.format("%Y%m%dT%H%M%S"),
            &hex.as_str()[..10]
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn sample_instant() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(10, 30, 0)
            .unwrap()
    }

    #[test]
    fn run_id_deterministic_for_same_inputs() {
        let spec = SpecHash("abc123".into());
        let a = RunId::generate("grid", &spec, sample_instant());
        let b = RunId::generate("grid", &spec, sample_instant());
        assert_eq!(a, b);
    }

    #[test]
    fn run_id_differs_by_start_instant() {
        let spec = SpecHash("abc123".into());
        let a = RunId::generate("grid", &spec, sample_instant());
        let b = RunId::generate(
            "grid",
            &spec,
            sample_instant() + chrono::Duration::seconds(1),
        );
        assert_ne!(a, b);
    }

    #[test]
    fn run_id_carries_kind_prefix() {
        let spec = SpecHash("abc123".into());
        let id = RunId::generate("walk_forward", &spec, sample_instant());
        assert!(id.as_str().starts_with("walk_forward-"));
    }

    #[test]
    fn spec_hash_stable_across_key_order() {
        let a = SpecHash::of_canonical_json(&serde_json::json!({"b": 2, "a": 1}));
        let b = SpecHash::of_canonical_json(&serde_json::json!({"a": 1, "b": 2}));
        assert_eq!(a, b);
    }

    #[test]
    fn short_hash_is_prefix() {
        let h = DatasetHash::from_hash("0123456789abcdef0123");
        assert_eq!(h.short(), "0123456789ab");
    }
}
