//! Candle data handling: validated datasets, timeframe rollups,
//! future-proof multi-timeframe views, and synthetic series.

pub mod dataset;
pub mod mtf;
pub mod resample;
pub mod synthetic;

pub use dataset::{CandleDataset, DataError, DatasetKey, ValidationMode};
pub use mtf::{HtfSeries, LookaheadMonitor, MtfCursor};
pub use resample::{resample, ResampleError};
pub use synthetic::{synthetic_drift, synthetic_walk};
