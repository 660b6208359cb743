//! Seeded synthetic input streams for demos and end-to-end tests.
//!
//! Produces the same file shapes the plant's real producers drop into the
//! inbox: a full-day 15-minute day-ahead commitment, per-tick 3-row
//! forecast files, per-tick single-row actual files, and full-day
//! forecast/actual series for replay. All writes honor the atomic
//! temp-file-then-rename contract.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{Duration, NaiveDateTime, Timelike};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::block::SUBSTEPS_PER_BLOCK;
use crate::runtime::TimeGrid;

/// Shape of the synthetic PV day.
#[derive(Debug, Clone)]
pub struct MimicParams {
    /// Clear-sky peak output (kW).
    pub peak_kw: f64,
    /// Hour of peak output.
    pub mu_hour: f64,
    /// Width of the generation bell in hours.
    pub sigma_hour: f64,
    /// Day-ahead commitment as a fraction of the clear-sky bell.
    pub day_ahead_scale: f64,
    /// Forecast noise amplitude as a fraction of the bell.
    pub forecast_noise: f64,
    /// Actual-vs-forecast noise amplitude as a fraction of the forecast.
    pub actual_noise: f64,
    /// RNG seed.
    pub seed: u64,
}

impl Default for MimicParams {
    fn default() -> Self {
        Self {
            peak_kw: 45_000.0,
            mu_hour: 12.5,
            sigma_hour: 3.5,
            day_ahead_scale: 0.95,
            forecast_noise: 0.2,
            actual_noise: 0.1,
            seed: 42,
        }
    }
}

/// Paths written by [`StreamMimic::generate_day`].
#[derive(Debug, Clone)]
pub struct MimicFiles {
    pub day_ahead: PathBuf,
    pub forecast_day: PathBuf,
    pub actual_day: PathBuf,
}

/// Synthetic producer for one dispatch day.
#[derive(Debug)]
pub struct StreamMimic {
    params: MimicParams,
    rng: StdRng,
}

impl StreamMimic {
    pub fn new(params: MimicParams) -> Self {
        let rng = StdRng::seed_from_u64(params.seed);
        Self { params, rng }
    }

    /// Clear-sky bell at the given hour of day, zero outside daylight.
    pub fn bell_kw(&self, hour: f64) -> f64 {
        if !(6.0..=18.5).contains(&hour) {
            return 0.0;
        }
        let z = (hour - self.params.mu_hour) / self.params.sigma_hour;
        self.params.peak_kw * (-0.5 * z * z).exp()
    }

    fn hour_of(ts: NaiveDateTime) -> f64 {
        f64::from(ts.hour()) + f64::from(ts.minute()) / 60.0
    }

    /// Writes the full inbox for one day under `root`:
    /// `day_ahead_<date>.csv`, `forecast/forecast_<stamp>.csv` and
    /// `actual/actual_<stamp>.csv` per tick, plus full-day
    /// `forecast_day.csv` / `actual_day.csv` for replay runs.
    pub fn generate_day(&mut self, root: &Path, grid: &TimeGrid) -> io::Result<MimicFiles> {
        fs::create_dir_all(root.join("forecast"))?;
        fs::create_dir_all(root.join("actual"))?;

        let day_ahead = self.write_day_ahead(root, grid)?;

        let step = Duration::minutes(i64::from(grid.dt_minutes_rtu));
        let mut forecast_day = String::from("timestamp,solar_forecast_kw\n");
        let mut actual_day = String::from("timestamp,solar_actual_kw\n");

        for t_now in grid.ticks() {
            let mut rows = String::from("timestamp,solar_forecast_kw\n");
            let mut forecast_now = 0.0;
            for k in 0..SUBSTEPS_PER_BLOCK as i64 {
                let ts = t_now + step * k as i32;
                let base = self.bell_kw(Self::hour_of(ts));
                let noise: f64 = self.rng.random_range(-0.5..0.5);
                let kw = (base + noise * self.params.forecast_noise * base).max(0.0);
                if k == 0 {
                    forecast_now = kw;
                    forecast_day.push_str(&format!(
                        "{},{kw:.2}\n",
                        ts.format("%Y-%m-%dT%H:%M:%S")
                    ));
                }
                rows.push_str(&format!("{},{kw:.2}\n", ts.format("%Y-%m-%dT%H:%M:%S")));
            }
            let stamp = t_now.format("%Y%m%d_%H%M");
            atomic_write(&root.join("forecast").join(format!("forecast_{stamp}.csv")), &rows)?;

            let noise: f64 = self.rng.random_range(-0.5..0.5);
            let actual_kw = (forecast_now + noise * self.params.actual_noise * forecast_now).max(0.0);
            let actual_rows = format!(
                "timestamp,solar_actual_kw\n{},{actual_kw:.2}\n",
                t_now.format("%Y-%m-%dT%H:%M:%S")
            );
            atomic_write(&root.join("actual").join(format!("actual_{stamp}.csv")), &actual_rows)?;
            actual_day.push_str(&format!(
                "{},{actual_kw:.2}\n",
                t_now.format("%Y-%m-%dT%H:%M:%S")
            ));
        }

        let forecast_day_path = root.join("forecast_day.csv");
        atomic_write(&forecast_day_path, &forecast_day)?;
        let actual_day_path = root.join("actual_day.csv");
        atomic_write(&actual_day_path, &actual_day)?;

        Ok(MimicFiles {
            day_ahead,
            forecast_day: forecast_day_path,
            actual_day: actual_day_path,
        })
    }

    /// Full-day 15-minute day-ahead commitment at `day_ahead_scale` of the
    /// clear-sky bell.
    fn write_day_ahead(&self, root: &Path, grid: &TimeGrid) -> io::Result<PathBuf> {
        let day = grid.day_start.date();
        let mut rows = String::from("timestamp,expected_power_kw\n");
        let mut ts = day.and_hms_opt(0, 0, 0).expect("midnight is valid");
        let end = day.and_hms_opt(23, 45, 0).expect("23:45 is valid");
        while ts <= end {
            let kw = self.bell_kw(Self::hour_of(ts)) * self.params.day_ahead_scale;
            rows.push_str(&format!("{},{kw:.2}\n", ts.format("%Y-%m-%dT%H:%M:%S")));
            ts += Duration::minutes(15);
        }
        let path = root.join(format!("day_ahead_{}.csv", day.format("%Y%m%d")));
        atomic_write(&path, &rows)?;
        Ok(path)
    }
}

/// Writes `contents` to `<path>.tmp` and renames it into place, so readers
/// never observe a half-written file.
fn atomic_write(path: &Path, contents: &str) -> io::Result<()> {
    let tmp = path.with_extension("csv.tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)
}
