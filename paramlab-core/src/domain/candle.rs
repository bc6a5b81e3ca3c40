//! Candle: the fundamental unit of market data.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use super::timeframe::Timeframe;

/// OHLCV candle at a single timeframe.
///
/// `open_time` marks the instant the candle opened. The symbol and timeframe
/// live on the owning dataset, not on every candle, so the close time is
/// derived via [`Candle::close_time`] rather than stored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: NaiveDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Returns true if any price or volume field is NaN (void candle).
    pub fn is_void(&self) -> bool {
        self.open.is_nan()
            || self.high.is_nan()
            || self.low.is_nan()
            || self.close.is_nan()
            || self.volume.is_nan()
    }

    /// Basic OHLCV sanity check: high is the ceiling, low is the floor,
    /// prices positive, volume non-negative.
    pub fn is_sane(&self) -> bool {
        if self.is_void() {
            return false;
        }
        self.high >= self.low
            && self.high >= self.open
            && self.high >= self.close
            && self.low <= self.open
            && self.low <= self.close
            && self.open > 0.0
            && self.close > 0.0
            && self.volume >= 0.0
    }

    /// Instant at which this candle closes for the given timeframe.
    pub fn close_time(&self, timeframe: Timeframe) -> NaiveDateTime {
        self.open_time + timeframe.duration()
    }
}
