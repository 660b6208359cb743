//! Append-only CSV log of committed ticks.

use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;

/// Tick log column header.
pub const TICK_LOG_HEADER: &str = "timestamp,block_start,substep_in_block,E_target_kwh,\
                                   target_power_kw,solar_forecast_kw,solar_actual_kw,\
                                   actual_available,battery_power_kw,grid_output_kw,soc_kwh";

/// Complete record of one committed tick.
#[derive(Debug, Clone, PartialEq)]
pub struct TickRecord {
    pub timestamp: NaiveDateTime,
    pub block_start: NaiveDateTime,
    pub substep_in_block: usize,
    pub e_target_kwh: f64,
    pub target_power_kw: f64,
    pub solar_forecast_kw: f64,
    pub solar_actual_kw: Option<f64>,
    pub actual_available: bool,
    pub battery_power_kw: f64,
    pub grid_output_kw: f64,
    pub soc_kwh: f64,
}

/// Append-only tick log. The file is opened, appended, and closed per row
/// so a crash between ticks never holds a handle, and each row is a single
/// atomic append.
#[derive(Debug, Clone)]
pub struct TickLog {
    path: PathBuf,
}

impl TickLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record, writing the header first on a fresh file.
    pub fn append(&self, record: &TickRecord) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let fresh = file.metadata()?.len() == 0;
        let mut writer = BufWriter::new(file);
        if fresh {
            writeln!(writer, "{TICK_LOG_HEADER}")?;
        }
        let actual = record
            .solar_actual_kw
            .map_or_else(String::new, |kw| format!("{kw:.4}"));
        writeln!(
            writer,
            "{},{},{},{:.4},{:.4},{:.4},{},{},{:.4},{:.4},{:.4}",
            record.timestamp.format("%Y-%m-%dT%H:%M:%S"),
            record.block_start.format("%Y-%m-%dT%H:%M:%S"),
            record.substep_in_block,
            record.e_target_kwh,
            record.target_power_kw,
            record.solar_forecast_kw,
            actual,
            record.actual_available,
            record.battery_power_kw,
            record.grid_output_kw,
            record.soc_kwh,
        )?;
        writer.flush()
    }
}
