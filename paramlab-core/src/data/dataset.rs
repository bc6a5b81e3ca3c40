//! Immutable candle datasets: validated once, content-hashed, cheaply
//! sliceable by time range.

use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{Candle, DatasetHash, DateRange, Timeframe};

#[derive(Debug, Error)]
pub enum DataError {
    #[error("{symbol}/{timeframe}: candles out of order at index {index}")]
    OutOfOrder {
        symbol: String,
        timeframe: Timeframe,
        index: usize,
    },
    #[error("{symbol}/{timeframe}: duplicate open time at index {index}")]
    DuplicateTime {
        symbol: String,
        timeframe: Timeframe,
        index: usize,
    },
    #[error("{symbol}/{timeframe}: malformed candle at index {index}")]
    Malformed {
        symbol: String,
        timeframe: Timeframe,
        index: usize,
    },
}

/// How strictly incoming candle series are vetted.
///
/// `Strict` fails the load on the first malformed row. `Lenient` sorts,
/// deduplicates, and drops bad rows, reporting how many were discarded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    #[default]
    Strict,
    Lenient,
}

/// Identity of one dataset request: which symbol, at which timeframe, over
/// which window. Cache lookups key on this.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetKey {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub range: DateRange,
}

impl fmt::Display for DatasetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.symbol, self.timeframe, self.range)
    }
}

/// A validated, time-ordered candle series for one symbol and timeframe.
///
/// Construction is the only mutation point; afterwards the dataset is shared
/// read-only (typically behind an `Arc`) across every evaluation in a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleDataset {
    symbol: String,
    timeframe: Timeframe,
    candles: Vec<Candle>,
    hash: DatasetHash,
}

impl CandleDataset {
    /// Strict construction: candles must be sane and strictly ascending.
    pub fn new(
        symbol: impl Into<String>,
        timeframe: Timeframe,
        candles: Vec<Candle>,
    ) -> Result<Self, DataError> {
        let symbol = symbol.into();
        for (i, c) in candles.iter().enumerate() {
            if !c.is_sane() {
                return Err(DataError::Malformed {
                    symbol,
                    timeframe,
                    index: i,
                });
            }
            if i > 0 {
                let prev = candles[i - 1].open_time;
                if c.open_time == prev {
                    return Err(DataError::DuplicateTime {
                        symbol,
                        timeframe,
                        index: i,
                    });
                }
                if c.open_time < prev {
                    return Err(DataError::OutOfOrder {
                        symbol,
                        timeframe,
                        index: i,
                    });
                }
            }
        }
        Ok(Self::from_clean(symbol, timeframe, candles))
    }

    /// Lenient construction: sorts by open time, drops malformed candles and
    /// duplicate timestamps (first occurrence wins), and reports the drop
    /// count. Never fails.
    pub fn new_lenient(
        symbol: impl Into<String>,
        timeframe: Timeframe,
        mut candles: Vec<Candle>,
    ) -> (Self, usize) {
        let symbol = symbol.into();
        let before = candles.len();
        candles.sort_by_key(|c| c.open_time);
        let mut clean: Vec<Candle> = Vec::with_capacity(candles.len());
        for c in candles {
            if !c.is_sane() {
                continue;
            }
            if clean.last().is_some_and(|last| last.open_time == c.open_time) {
                continue;
            }
            clean.push(c);
        }
        let dropped = before - clean.len();
        if dropped > 0 {
            tracing::warn!(
                symbol,
                timeframe = %timeframe,
                dropped,
                kept = clean.len(),
                "lenient validation discarded candles"
            );
        }
        (Self::from_clean(symbol, timeframe, clean), dropped)
    }

    fn from_clean(symbol: String, timeframe: Timeframe, candles: Vec<Candle>) -> Self {
        let hash = compute_hash(&symbol, timeframe, &candles);
        Self {
            symbol,
            timeframe,
            candles,
            hash,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn hash(&self) -> &DatasetHash {
        &self.hash
    }

    pub fn first_open(&self) -> Option<NaiveDateTime> {
        self.candles.first().map(|c| c.open_time)
    }

    pub fn last_open(&self) -> Option<NaiveDateTime> {
        self.candles.last().map(|c| c.open_time)
    }

    /// Time span actually held: first open through last close.
    pub fn span(&self) -> Option<DateRange> {
        let first = self.candles.first()?;
        let last = self.candles.last()?;
        DateRange::new(first.open_time, last.close_time(self.timeframe))
    }

    /// True if this dataset fully contains `range`.
    pub fn covers(&self, range: &DateRange) -> bool {
        self.span().is_some_and(|span| span.covers(range))
    }

    /// Candles whose open time falls within `range`. Binary search on both
    /// ends; borrows, never copies.
    pub fn slice(&self, range: &DateRange) -> &[Candle] {
        let start = self.candles.partition_point(|c| c.open_time < range.start);
        let end = self.candles.partition_point(|c| c.open_time < range.end);
        &self.candles[start..end]
    }
}

fn compute_hash(symbol: &str, timeframe: Timeframe, candles: &[Candle]) -> DatasetHash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(symbol.as_bytes());
    hasher.update(timeframe.label().as_bytes());
    for c in candles {
        hasher.update(&c.open_time.and_utc().timestamp().to_le_bytes());
        for v in [c.open, c.high, c.low, c.close, c.volume] {
            hasher.update(&v.to_bits().to_le_bytes());
        }
    }
    DatasetHash(hasher.finalize().to_hex().to_string())
}
