//! ParamLab Core : leaf primitives of the offline optimization lab.
//!
//! Everything in this crate is side-effect free apart from the structural
//! isolation scan (which reads source trees) and tracing output:
//! - Domain types (candles, timeframes, ranges, deterministic ids)
//! - Lazily enumerated parameter spaces with O(dims) cardinality
//! - Evaluation metrics and the robustness scoring blend
//! - The bounded top-N result store
//! - Cooperative pacing for long evaluation loops
//! - The lab isolation guard (runtime flag + structural source scan)
//! - Dataset validation, timeframe rollups, and lookahead-safe
//!   multi-timeframe cursors

pub mod data;
pub mod domain;
pub mod guard;
pub mod pace;
pub mod result;
pub mod score;
pub mod space;
pub mod top_n;

pub use data::{CandleDataset, DataError, DatasetKey, ValidationMode};
pub use domain::{Candle, DatasetHash, DateRange, RunId, SpecHash, Timeframe};
pub use pace::YieldGate;
pub use result::{CombinationResult, EvaluationMetrics, MetricId};
pub use score::{Direction, Objective, ObjectiveSet, ScoreError};
pub use space::{CombinationIter, ParameterSet, ParameterSpace, ParameterSpec, SpaceError};
pub use top_n::TopNResultStore;
