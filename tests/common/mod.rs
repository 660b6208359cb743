//! Shared fixtures for end-to-end tests.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Duration, NaiveDate, NaiveDateTime};

use hybrid_ems::battery::BatteryModel;
use hybrid_ems::config::EmsConfig;
use hybrid_ems::io::ingest::DayAhead;
use hybrid_ems::io::log::TickLog;
use hybrid_ems::runtime::TimeGrid;

pub fn ts(h: u32, m: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 1, 3)
        .unwrap()
        .and_hms_opt(h, m, 0)
        .unwrap()
}

/// Base configuration used across scenarios: the built-in plant profile
/// with the ramp constraint disabled so tests opt into it explicitly.
pub fn base_config() -> EmsConfig {
    let mut cfg = EmsConfig::default();
    cfg.time.ramp_rate_kw_per_step = None;
    cfg.mpc.terminal_soc_soft_weight = 0.0;
    cfg.mpc.qp_weights.w_terminal_soc = 0.0;
    cfg
}

pub fn grid(cfg: &EmsConfig) -> TimeGrid {
    TimeGrid::from_config(&cfg.time)
}

pub fn battery(cfg: &EmsConfig) -> BatteryModel {
    BatteryModel::new(cfg.battery.to_params())
}

pub fn log_in(dir: &Path) -> TickLog {
    TickLog::new(dir.join("ticks.csv"))
}

/// Writes a day-ahead CSV with a constant expected power over the grid's
/// day and loads it back through the production reader.
pub fn constant_day_ahead(dir: &Path, grid: &TimeGrid, power_kw: f64) -> DayAhead {
    let path = dir.join("day_ahead.csv");
    let mut rows = String::from("timestamp,expected_power_kw\n");
    let mut ts = grid.day_start;
    while ts <= grid.day_end {
        rows.push_str(&format!(
            "{},{power_kw:.2}\n",
            ts.format("%Y-%m-%dT%H:%M:%S")
        ));
        ts += Duration::minutes(15);
    }
    fs::write(&path, rows).unwrap();
    DayAhead::from_csv(&path)
        .unwrap()
        .clip_to_day(grid.day_start, grid.day_end)
}

/// Writes a constant full-day 5-minute series and returns its path.
pub fn constant_series(dir: &Path, grid: &TimeGrid, column: &str, power_kw: f64) -> PathBuf {
    let path = dir.join(format!("{column}.csv"));
    let mut rows = format!("timestamp,{column}\n");
    for ts in grid.ticks() {
        rows.push_str(&format!(
            "{},{power_kw:.2}\n",
            ts.format("%Y-%m-%dT%H:%M:%S")
        ));
    }
    fs::write(&path, rows).unwrap();
    path
}
