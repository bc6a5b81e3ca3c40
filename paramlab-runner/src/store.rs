//! Historical candle sources.
//!
//! Pipelines never read files themselves; they see a [`HistoricalStore`] and
//! receive validated [`CandleDataset`]s through the process cache. The CSV
//! backend is the on-disk layout research data is kept in
//! (`<root>/<SYMBOL>/<timeframe>.csv`); the memory backend exists for tests
//! and synthetic seeding.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use paramlab_core::data::synthetic_drift;
use paramlab_core::{Candle, CandleDataset, DataError, DateRange, Timeframe, ValidationMode};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no candle data for {symbol}/{timeframe}")]
    MissingSymbol { symbol: String, timeframe: Timeframe },
    #[error("{symbol}/{timeframe} does not cover {range}")]
    RangeUncovered {
        symbol: String,
        timeframe: Timeframe,
        range: DateRange,
    },
    #[error("candle store io at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("candle csv at {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error(transparent)]
    Data(#[from] DataError),
}

fn io_err(path: &Path, source: io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Source of historical candles, keyed by symbol and timeframe.
///
/// `load` returns the candles whose open time falls inside `range`. Strict
/// mode additionally requires the stored series to cover the whole range;
/// lenient mode settles for whatever overlap exists, as long as it is
/// non-empty.
pub trait HistoricalStore: Send + Sync {
    fn load(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        range: &DateRange,
        mode: ValidationMode,
    ) -> Result<CandleDataset, StoreError>;

    /// Time span held for the pair, `None` when the series is empty.
    fn coverage(&self, symbol: &str, timeframe: Timeframe)
        -> Result<Option<DateRange>, StoreError>;
}

fn narrow(
    dataset: &CandleDataset,
    range: &DateRange,
    mode: ValidationMode,
) -> Result<CandleDataset, StoreError> {
    let uncovered = || StoreError::RangeUncovered {
        symbol: dataset.symbol().to_string(),
        timeframe: dataset.timeframe(),
        range: *range,
    };
    if mode == ValidationMode::Strict && !dataset.covers(range) {
        return Err(uncovered());
    }
    let slice = dataset.slice(range);
    if slice.is_empty() {
        return Err(uncovered());
    }
    // The slice of a validated dataset is still ordered and sane.
    Ok(CandleDataset::new(
        dataset.symbol(),
        dataset.timeframe(),
        slice.to_vec(),
    )?)
}

// ─── CSV backend ────────────────────────────────────────────────────

/// One row of the on-disk candle format.
#[derive(Debug, Serialize, Deserialize)]
struct CsvRow {
    open_time: NaiveDateTime,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

impl From<&Candle> for CsvRow {
    fn from(c: &Candle) -> Self {
        Self {
            open_time: c.open_time,
            open: c.open,
            high: c.high,
            low: c.low,
            close: c.close,
            volume: c.volume,
        }
    }
}

impl From<CsvRow> for Candle {
    fn from(r: CsvRow) -> Self {
        Self {
            open_time: r.open_time,
            open: r.open,
            high: r.high,
            low: r.low,
            close: r.close,
            volume: r.volume,
        }
    }
}

/// Candle files under `<root>/<SYMBOL>/<timeframe>.csv`.
#[derive(Debug)]
pub struct CsvCandleStore {
    root: PathBuf,
}

impl CsvCandleStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, symbol: &str, timeframe: Timeframe) -> PathBuf {
        self.root.join(symbol).join(format!("{timeframe}.csv"))
    }

    fn read_full(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        mode: ValidationMode,
    ) -> Result<CandleDataset, StoreError> {
        let path = self.path_of(symbol, timeframe);
        if !path.is_file() {
            return Err(StoreError::MissingSymbol {
                symbol: symbol.to_string(),
                timeframe,
            });
        }
        let file = fs::File::open(&path).map_err(|e| io_err(&path, e))?;
        let mut rdr = csv::Reader::from_reader(file);
        let mut candles = Vec::new();
        for row in rdr.deserialize::<CsvRow>() {
            match row {
                Ok(row) => candles.push(Candle::from(row)),
                Err(source) => {
                    if mode == ValidationMode::Strict {
                        return Err(StoreError::Csv { path, source });
                    }
                    tracing::warn!(path = %path.display(), %source, "dropping malformed candle row");
                }
            }
        }
        match mode {
            ValidationMode::Strict => Ok(CandleDataset::new(symbol, timeframe, candles)?),
            ValidationMode::Lenient => {
                let (dataset, _dropped) = CandleDataset::new_lenient(symbol, timeframe, candles);
                Ok(dataset)
            }
        }
    }

    /// Write a dataset into the store layout, atomically. This is the
    /// seeding path used by the CLI and tests.
    pub fn write(&self, dataset: &CandleDataset) -> Result<PathBuf, StoreError> {
        let dir = self.root.join(dataset.symbol());
        fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        let path = dir.join(format!("{}.csv", dataset.timeframe()));

        let mut wtr = csv::Writer::from_writer(Vec::new());
        for candle in dataset.candles() {
            wtr.serialize(CsvRow::from(candle)).map_err(|source| StoreError::Csv {
                path: path.clone(),
                source,
            })?;
        }
        let bytes = wtr.into_inner().map_err(|e| StoreError::Io {
            path: path.clone(),
            source: io::Error::other(e.to_string()),
        })?;

        let tmp = path.with_extension("csv.tmp");
        fs::write(&tmp, bytes).map_err(|e| io_err(&tmp, e))?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(io_err(&path, e));
        }
        Ok(path)
    }

    /// Symbols that have at least one candle file.
    pub fn symbols(&self) -> Result<Vec<String>, StoreError> {
        let mut symbols = Vec::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(symbols),
            Err(e) => return Err(io_err(&self.root, e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&self.root, e))?;
            if entry.path().is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    symbols.push(name.to_string());
                }
            }
        }
        symbols.sort();
        Ok(symbols)
    }
}

impl HistoricalStore for CsvCandleStore {
    fn load(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        range: &DateRange,
        mode: ValidationMode,
    ) -> Result<CandleDataset, StoreError> {
        let full = self.read_full(symbol, timeframe, mode)?;
        narrow(&full, range, mode)
    }

    fn coverage(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<Option<DateRange>, StoreError> {
        // Lenient read: coverage queries should report what is salvageable.
        let full = self.read_full(symbol, timeframe, ValidationMode::Lenient)?;
        Ok(full.span())
    }
}

// ─── Memory backend ─────────────────────────────────────────────────

/// In-memory store. Populate it, then freeze it behind an `Arc`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    datasets: HashMap<(String, Timeframe), CandleDataset>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, dataset: CandleDataset) {
        self.datasets
            .insert((dataset.symbol().to_string(), dataset.timeframe()), dataset);
    }

    pub fn with_dataset(mut self, dataset: CandleDataset) -> Self {
        self.insert(dataset);
        self
    }
}

impl HistoricalStore for MemoryStore {
    fn load(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        range: &DateRange,
        mode: ValidationMode,
    ) -> Result<CandleDataset, StoreError> {
        let dataset = self
            .datasets
            .get(&(symbol.to_string(), timeframe))
            .ok_or_else(|| StoreError::MissingSymbol {
                symbol: symbol.to_string(),
                timeframe,
            })?;
        narrow(dataset, range, mode)
    }

    fn coverage(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<Option<DateRange>, StoreError> {
        let dataset = self
            .datasets
            .get(&(symbol.to_string(), timeframe))
            .ok_or_else(|| StoreError::MissingSymbol {
                symbol: symbol.to_string(),
                timeframe,
            })?;
        Ok(dataset.span())
    }
}

/// Seed a store with deterministic synthetic series, one per symbol. Each
/// symbol gets its own seed and drift so portfolio runs see distinct but
/// reproducible markets.
pub fn seed_synthetic(
    store: &CsvCandleStore,
    symbols: &[String],
    timeframe: Timeframe,
    start: NaiveDateTime,
    count: usize,
    base_seed: u64,
) -> Result<Vec<PathBuf>, StoreError> {
    let mut written = Vec::with_capacity(symbols.len());
    for (i, symbol) in symbols.iter().enumerate() {
        let seed = base_seed.wrapping_add(i as u64);
        let drift = match i % 3 {
            0 => 0.05,
            1 => -0.03,
            _ => 0.0,
        };
        let candles = synthetic_drift(timeframe, start, count, seed, drift);
        let dataset = CandleDataset::new(symbol.clone(), timeframe, candles)?;
        written.push(store.write(&dataset)?);
    }
    Ok(written)
}
