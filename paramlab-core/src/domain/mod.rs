//! Core market-data and identity types shared across the lab.

pub mod candle;
pub mod ids;
pub mod range;
pub mod timeframe;

pub use candle::Candle;
pub use ids::{DatasetHash, RunId, SpecHash};
pub use range::DateRange;
pub use timeframe::{ParseTimeframeError, Timeframe};
