//! Multi-timeframe views that cannot see the future.
//!
//! A replay walks base-timeframe candles one by one. Higher-timeframe series
//! are visible only through a cursor whose frontier advances with the replay
//! clock: candles at or beyond the frontier have not closed yet, and asking
//! for one records a lookahead violation instead of returning data. The
//! still-forming candle is the classic leak (its high/low already include
//! ticks the strategy could not have seen), so it is exactly what the
//! frontier excludes.

use chrono::NaiveDateTime;

use crate::data::dataset::CandleDataset;
use crate::data::resample::{resample, ResampleError};
use crate::domain::{Candle, Timeframe};

/// A higher-timeframe series derived from a base dataset.
#[derive(Debug, Clone)]
pub struct HtfSeries {
    timeframe: Timeframe,
    candles: Vec<Candle>,
}

impl HtfSeries {
    pub fn from_base(base: &CandleDataset, timeframe: Timeframe) -> Result<Self, ResampleError> {
        let candles = resample(base.candles(), base.timeframe(), timeframe)?;
        Ok(Self { timeframe, candles })
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }
}

/// Counts blocked future accesses during one evaluation.
#[derive(Debug, Default, Clone)]
pub struct LookaheadMonitor {
    violations: u64,
    first: Option<String>,
}

impl LookaheadMonitor {
    pub fn record(&mut self, detail: String) {
        if self.first.is_none() {
            self.first = Some(detail.clone());
        }
        self.violations += 1;
        tracing::warn!(detail, "lookahead access blocked");
    }

    pub fn violations(&self) -> u64 {
        self.violations
    }

    pub fn first(&self) -> Option<&str> {
        self.first.as_deref()
    }

    pub fn is_clean(&self) -> bool {
        self.violations == 0
    }
}

/// Forward-only window over an [`HtfSeries`].
///
/// `advance_to(now)` moves the frontier so that exactly the candles closed at
/// or before `now` are visible. The clock never runs backwards; a stale
/// `advance_to` is ignored.
#[derive(Debug)]
pub struct MtfCursor<'a> {
    series: &'a HtfSeries,
    frontier: usize,
    now: Option<NaiveDateTime>,
    monitor: LookaheadMonitor,
}

impl<'a> MtfCursor<'a> {
    pub fn new(series: &'a HtfSeries) -> Self {
        Self {
            series,
            frontier: 0,
            now: None,
            monitor: LookaheadMonitor::default(),
        }
    }

    /// Advance the replay clock. Candles whose close time is at or before
    /// `now` become visible.
    pub fn advance_to(&mut self, now: NaiveDateTime) {
        if self.now.is_some_and(|prev| now <= prev) {
            return;
        }
        self.now = Some(now);
        let tf = self.series.timeframe;
        self.frontier = self.series.candles[self.frontier..]
            .partition_point(|c| c.close_time(tf) <= now)
            + self.frontier;
    }

    /// All candles closed at the current clock, oldest first.
    pub fn closed(&self) -> &'a [Candle] {
        &self.series.candles[..self.frontier]
    }

    /// Most recently closed candle, if any has closed yet.
    pub fn last_closed(&self) -> Option<&'a Candle> {
        self.series.candles[..self.frontier].last()
    }

    pub fn closed_len(&self) -> usize {
        self.frontier
    }

    /// Indexed access, bounded by the frontier. An index at or beyond it is
    /// a lookahead attempt: it is recorded and `None` is returned.
    pub fn candle(&mut self, index: usize) -> Option<&'a Candle> {
        if index >= self.frontier {
            self.monitor.record(format!(
                "index {index} requested with {} candle(s) closed at {:?}",
                self.frontier, self.now
            ));
            return None;
        }
        self.series.candles.get(index)
    }

    pub fn violations(&self) -> u64 {
        self.monitor.violations()
    }

    pub fn monitor(&self) -> &LookaheadMonitor {
        &self.monitor
    }

    pub fn into_monitor(self) -> LookaheadMonitor {
        self.monitor
    }
}
