//! Roll lower-timeframe candles up into a higher timeframe.
//!
//! Buckets are aligned to the epoch, which puts H1 buckets on the hour and
//! D1 buckets at midnight. A bucket's candle opens at the bucket boundary,
//! takes its open from the first source candle and its close from the last,
//! and accumulates high/low/volume across the bucket.

use chrono::{Duration, NaiveDateTime};
use thiserror::Error;

use crate::domain::{Candle, Timeframe};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot aggregate {from} candles into {to}")]
pub struct ResampleError {
    pub from: Timeframe,
    pub to: Timeframe,
}

/// Start of the `minutes`-wide bucket containing `t`.
fn bucket_open(t: NaiveDateTime, minutes: i64) -> NaiveDateTime {
    let secs = t.and_utc().timestamp();
    let span = minutes * 60;
    t - Duration::seconds(secs.rem_euclid(span))
}

/// Aggregate `candles` (sorted, at timeframe `from`) into `to` candles.
/// Partial buckets at either edge are emitted; whether they are visible to a
/// strategy is the multi-timeframe cursor's concern, not the resampler's.
pub fn resample(
    candles: &[Candle],
    from: Timeframe,
    to: Timeframe,
) -> Result<Vec<Candle>, ResampleError> {
    if !to.aggregates(from) {
        return Err(ResampleError { from, to });
    }
    let minutes = to.minutes();
    let ratio = (minutes / from.minutes()).max(1) as usize;
    let mut out: Vec<Candle> = Vec::with_capacity(candles.len() / ratio + 1);
    for c in candles {
        let open_time = bucket_open(c.open_time, minutes);
        match out.last_mut() {
            Some(last) if last.open_time == open_time => {
                last.high = last.high.max(c.high);
                last.low = last.low.min(c.low);
                last.close = c.close;
                last.volume += c.volume;
            }
            _ => out.push(Candle {
                open_time,
                open: c.open,
                high: c.high,
                low: c.low,
                close: c.close,
                volume: c.volume,
            }),
        }
    }
    Ok(out)
}
