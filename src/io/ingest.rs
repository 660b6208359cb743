//! CSV ingestion of day-ahead, forecast, and actual power files.
//!
//! Producers write atomically (temp file, then rename), so every read here
//! is a plain synchronous snapshot. Missing forecast or actual files are an
//! expected operating condition and surface as empty snapshots, not errors.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{Duration, NaiveDateTime};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::block::{SUBSTEPS_PER_BLOCK, floor_to_15min};
use crate::runtime::{InputSource, TickInputs};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to read \"{path}\": {source}")]
    Csv { path: String, source: csv::Error },
}

impl IngestError {
    fn csv(path: &Path, source: csv::Error) -> Self {
        Self::Csv {
            path: path.display().to_string(),
            source,
        }
    }
}

/// One timestamped power sample (kW).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolarSample {
    pub timestamp: NaiveDateTime,
    pub power_kw: f64,
}

#[derive(Debug, Deserialize)]
struct DayAheadRow {
    timestamp: NaiveDateTime,
    expected_power_kw: f64,
}

#[derive(Debug, Deserialize)]
struct ForecastRow {
    timestamp: NaiveDateTime,
    solar_forecast_kw: f64,
}

#[derive(Debug, Deserialize)]
struct ActualRow {
    timestamp: NaiveDateTime,
    solar_actual_kw: f64,
}

/// The day-ahead commitment: expected 15-minute average power per block.
///
/// Lookups pad forward, mirroring how the commitment is published: a block
/// missing from the file inherits the last value before it, and only
/// timestamps outside the file's span count as missing.
#[derive(Debug, Clone, Default)]
pub struct DayAhead {
    blocks: BTreeMap<NaiveDateTime, f64>,
}

impl DayAhead {
    /// Reads the day-ahead file, deduplicating on timestamp (first wins).
    pub fn from_csv(path: &Path) -> Result<Self, IngestError> {
        let mut reader = csv::Reader::from_path(path).map_err(|e| IngestError::csv(path, e))?;
        let mut blocks = BTreeMap::new();
        for record in reader.deserialize() {
            let row: DayAheadRow = record.map_err(|e| IngestError::csv(path, e))?;
            blocks.entry(row.timestamp).or_insert(row.expected_power_kw);
        }
        Ok(Self { blocks })
    }

    #[cfg(test)]
    pub fn from_blocks(blocks: impl IntoIterator<Item = (NaiveDateTime, f64)>) -> Self {
        Self {
            blocks: blocks.into_iter().collect(),
        }
    }

    /// Drops blocks outside the dispatch day.
    pub fn clip_to_day(mut self, day_start: NaiveDateTime, day_end: NaiveDateTime) -> Self {
        self.blocks.retain(|ts, _| *ts >= day_start && *ts <= day_end);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Expected power for the block containing `ts`, forward-filled.
    pub fn expected_power_kw(&self, ts: NaiveDateTime) -> Option<f64> {
        let last = *self.blocks.keys().next_back()?;
        if ts > last + Duration::minutes(14) {
            return None;
        }
        self.blocks
            .range(..=ts)
            .next_back()
            .map(|(_, &power)| power)
    }

    /// Target energy for the block starting at `block_start` (kWh).
    pub fn target_energy_kwh(&self, block_start: NaiveDateTime) -> Option<f64> {
        self.expected_power_kw(block_start)
            .map(|p| p * crate::block::BLOCK_HOURS)
    }

    /// Synthetic 5-minute solar forecast from the commitment itself, used
    /// when no forecast file is available. Clipped non-negative.
    pub fn forward_fill_5min(&self, ts: NaiveDateTime) -> Option<f64> {
        self.expected_power_kw(floor_to_15min(ts)).map(|p| p.max(0.0))
    }
}

/// Reads a 5-minute solar forecast file, sorted and deduplicated.
pub fn read_forecast(path: &Path) -> Result<Vec<SolarSample>, IngestError> {
    let mut reader = csv::Reader::from_path(path).map_err(|e| IngestError::csv(path, e))?;
    let mut samples = Vec::new();
    for record in reader.deserialize() {
        let row: ForecastRow = record.map_err(|e| IngestError::csv(path, e))?;
        samples.push(SolarSample {
            timestamp: row.timestamp,
            power_kw: row.solar_forecast_kw,
        });
    }
    Ok(dedup_sorted(samples))
}

/// Reads a 5-minute solar actuals file, sorted and deduplicated.
pub fn read_actual(path: &Path) -> Result<Vec<SolarSample>, IngestError> {
    let mut reader = csv::Reader::from_path(path).map_err(|e| IngestError::csv(path, e))?;
    let mut samples = Vec::new();
    for record in reader.deserialize() {
        let row: ActualRow = record.map_err(|e| IngestError::csv(path, e))?;
        samples.push(SolarSample {
            timestamp: row.timestamp,
            power_kw: row.solar_actual_kw,
        });
    }
    Ok(dedup_sorted(samples))
}

fn dedup_sorted(mut samples: Vec<SolarSample>) -> Vec<SolarSample> {
    samples.sort_by_key(|s| s.timestamp);
    samples.dedup_by_key(|s| s.timestamp);
    samples
}

/// Polls per-tick forecast/actual drops from the inbox directory tree.
///
/// Producers write `forecast/forecast_<stamp>.csv` with rows for the tick
/// and the next two substeps, and `actual/actual_<stamp>.csv` with the
/// single row at the tick. When the on-time file has not landed yet the
/// newest earlier drop is used instead; when nothing usable exists the
/// snapshot is simply empty and the loop falls back per its own policy.
#[derive(Debug, Clone)]
pub struct InboxSource {
    root: PathBuf,
    dt_minutes: u32,
}

impl InboxSource {
    pub fn new(root: impl Into<PathBuf>, dt_minutes: u32) -> Self {
        Self {
            root: root.into(),
            dt_minutes,
        }
    }

    /// `<root>/day_ahead_<yyyymmdd>.csv` for the given day.
    pub fn day_ahead_path(&self, day: NaiveDateTime) -> PathBuf {
        self.root
            .join(format!("day_ahead_{}.csv", day.format("%Y%m%d")))
    }

    fn stamped_path(&self, kind: &str, t_now: NaiveDateTime) -> PathBuf {
        self.root
            .join(kind)
            .join(format!("{kind}_{}.csv", t_now.format("%Y%m%d_%H%M")))
    }

    /// The on-time drop if present, otherwise the newest stamped file in
    /// the directory. Stamps sort lexically in time order.
    fn resolve(&self, kind: &str, t_now: NaiveDateTime) -> Option<PathBuf> {
        let ontime = self.stamped_path(kind, t_now);
        if ontime.exists() {
            return Some(ontime);
        }
        let dir = self.root.join(kind);
        let mut names: Vec<PathBuf> = std::fs::read_dir(&dir)
            .ok()?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "csv"))
            .collect();
        names.sort();
        names.pop()
    }
}

impl InputSource for InboxSource {
    fn poll(&mut self, t_now: NaiveDateTime) -> TickInputs {
        let window_end =
            t_now + Duration::minutes(i64::from(self.dt_minutes) * (SUBSTEPS_PER_BLOCK as i64 - 1));
        let forecast = self
            .resolve("forecast", t_now)
            .and_then(|path| match read_forecast(&path) {
                Ok(samples) => Some(samples),
                Err(e) => {
                    debug!("unreadable forecast drop: {e}");
                    None
                }
            })
            .unwrap_or_default()
            .into_iter()
            .filter(|s| s.timestamp >= t_now && s.timestamp <= window_end)
            .collect();

        let actual = self
            .resolve("actual", t_now)
            .and_then(|path| match read_actual(&path) {
                Ok(samples) => Some(samples),
                Err(e) => {
                    debug!("unreadable actual drop: {e}");
                    None
                }
            })
            .unwrap_or_default()
            .into_iter()
            .find(|s| s.timestamp == t_now);

        TickInputs { forecast, actual }
    }
}
