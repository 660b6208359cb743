//! Per-tick orchestration of the control loop.

use chrono::{Duration, NaiveDateTime};
use thiserror::Error;
use tracing::{info, warn};

use crate::battery::BatteryModel;
use crate::block::{BlockFrame, SUBSTEPS_PER_BLOCK, floor_to_15min, is_aligned};
use crate::config::TimeConfig;
use crate::control::{ControlContext, Controller};
use crate::io::ingest::{DayAhead, SolarSample};
use crate::io::log::{TickLog, TickRecord};

/// The dispatch day's step grid.
#[derive(Debug, Clone)]
pub struct TimeGrid {
    /// First tick (inclusive).
    pub day_start: NaiveDateTime,
    /// Last tick (inclusive).
    pub day_end: NaiveDateTime,
    /// Real-time step in minutes.
    pub dt_minutes_rtu: u32,
    /// Day-ahead block length in minutes.
    pub dt_minutes_day_ahead: u32,
}

impl TimeGrid {
    pub fn from_config(time: &TimeConfig) -> Self {
        Self {
            day_start: time.day_start,
            day_end: time.day_end,
            dt_minutes_rtu: time.dt_minutes_rtu,
            dt_minutes_day_ahead: time.dt_minutes_day_ahead,
        }
    }

    /// Real-time step length in hours.
    pub fn dt_hours(&self) -> f64 {
        f64::from(self.dt_minutes_rtu) / 60.0
    }

    /// Whether `ts` sits on the real-time grid.
    pub fn is_aligned(&self, ts: NaiveDateTime) -> bool {
        is_aligned(ts, self.dt_minutes_rtu)
    }

    /// Real-time steps from `t_now` through `day_end`, current included.
    pub fn remaining_steps_day(&self, t_now: NaiveDateTime) -> usize {
        if t_now > self.day_end {
            return 0;
        }
        let seconds = (self.day_end - t_now).num_seconds();
        (seconds / (i64::from(self.dt_minutes_rtu) * 60) + 1).max(0) as usize
    }

    /// Every tick of the dispatch day in order.
    pub fn ticks(&self) -> impl Iterator<Item = NaiveDateTime> + '_ {
        let step = Duration::minutes(i64::from(self.dt_minutes_rtu));
        std::iter::successors(Some(self.day_start), move |t| Some(*t + step))
            .take_while(|t| *t <= self.day_end)
    }
}

/// Snapshot of the external inputs available at one tick.
#[derive(Debug, Clone, Default)]
pub struct TickInputs {
    /// Forecast rows for the tick and the following substeps.
    pub forecast: Vec<SolarSample>,
    /// Metered sample at the tick, when it has landed.
    pub actual: Option<SolarSample>,
}

/// Supplier of per-tick input snapshots.
///
/// Polling never fails: whatever could not be obtained is simply absent
/// from the snapshot, and the loop applies its own fallback policy.
pub trait InputSource {
    fn poll(&mut self, t_now: NaiveDateTime) -> TickInputs;
}

/// Replays full-day forecast/actual series as per-tick snapshots, as if a
/// producer had dropped the files on time at every step.
#[derive(Debug, Clone)]
pub struct ReplaySource {
    forecast: Vec<SolarSample>,
    actual: Vec<SolarSample>,
    dt_minutes: u32,
}

impl ReplaySource {
    pub fn new(forecast: Vec<SolarSample>, actual: Vec<SolarSample>, dt_minutes: u32) -> Self {
        Self {
            forecast,
            actual,
            dt_minutes,
        }
    }
}

impl InputSource for ReplaySource {
    fn poll(&mut self, t_now: NaiveDateTime) -> TickInputs {
        let window_end = t_now
            + Duration::minutes(i64::from(self.dt_minutes) * (SUBSTEPS_PER_BLOCK as i64 - 1));
        TickInputs {
            forecast: self
                .forecast
                .iter()
                .filter(|s| s.timestamp >= t_now && s.timestamp <= window_end)
                .copied()
                .collect(),
            actual: self.actual.iter().find(|s| s.timestamp == t_now).copied(),
        }
    }
}

/// Why a tick could not be committed. A failed tick leaves the battery
/// state untouched; the next tick starts clean.
#[derive(Debug, Error, PartialEq)]
pub enum TickError {
    #[error("no day-ahead target for the block starting {0}")]
    InputMissing(NaiveDateTime),
    #[error("tick time {0} is not on the {1}-minute real-time grid")]
    TimeMisaligned(NaiveDateTime, u32),
}

/// Per-tick orchestrator: polls inputs, frames the current block, asks the
/// controller for a setpoint, commits the battery step, and appends the
/// log row.
///
/// The loop exclusively owns the battery state. Everything fallible runs
/// before the commit, so an errored tick has no side effects beyond log
/// output.
pub struct ControlLoop<C: Controller, S: InputSource> {
    grid: TimeGrid,
    battery: BatteryModel,
    controller: C,
    source: S,
    day_ahead: DayAhead,
    log: TickLog,
}

impl<C: Controller, S: InputSource> ControlLoop<C, S> {
    pub fn new(
        grid: TimeGrid,
        battery: BatteryModel,
        controller: C,
        source: S,
        day_ahead: DayAhead,
        log: TickLog,
    ) -> Self {
        Self {
            grid,
            battery,
            controller,
            source,
            day_ahead,
            log,
        }
    }

    pub fn battery(&self) -> &BatteryModel {
        &self.battery
    }

    pub fn grid(&self) -> &TimeGrid {
        &self.grid
    }

    /// Executes one tick at `t_now`.
    pub fn tick(&mut self, t_now: NaiveDateTime) -> Result<TickRecord, TickError> {
        if !self.grid.is_aligned(t_now) {
            return Err(TickError::TimeMisaligned(t_now, self.grid.dt_minutes_rtu));
        }
        let block_start = floor_to_15min(t_now);
        let e_target_kwh = self
            .day_ahead
            .target_energy_kwh(block_start)
            .ok_or(TickError::InputMissing(block_start))?;

        let inputs = self.source.poll(t_now);
        let forecast: Vec<(NaiveDateTime, f64)> = if inputs.forecast.is_empty() {
            warn!(%t_now, "forecast unavailable, forward-filling from day-ahead");
            self.synthesize_forecast(t_now)
        } else {
            inputs
                .forecast
                .iter()
                .map(|s| (s.timestamp, s.power_kw))
                .collect()
        };
        // Online contract: at most the metered row for the tick itself.
        let actuals: Vec<(NaiveDateTime, f64)> = inputs
            .actual
            .filter(|s| s.timestamp == t_now)
            .map(|s| (s.timestamp, s.power_kw))
            .into_iter()
            .collect();

        let frame = BlockFrame::assemble(
            block_start,
            e_target_kwh,
            &forecast,
            &actuals,
            t_now,
            self.grid.dt_minutes_rtu,
        )
        .ok_or(TickError::TimeMisaligned(t_now, self.grid.dt_minutes_rtu))?;

        let ctx = ControlContext {
            battery: &self.battery.params,
            dt_hours: self.grid.dt_hours(),
            remaining_steps_day: self.grid.remaining_steps_day(t_now),
        };
        let p_kw = self
            .controller
            .compute_current_setpoint(&self.battery.state, &frame, &ctx);

        let current = frame.current();
        let solar_now_kw = current.best_known_kw();
        let grid_output_kw = solar_now_kw + p_kw;

        // Everything fallible is behind us; commit the step.
        self.battery.step(p_kw, self.grid.dt_minutes_rtu);

        let record = TickRecord {
            timestamp: t_now,
            block_start,
            substep_in_block: current.substep_in_block,
            e_target_kwh,
            target_power_kw: frame.target_power_kw(),
            solar_forecast_kw: current.solar_forecast_kw,
            solar_actual_kw: current.solar_actual_kw,
            actual_available: current.actual_available(),
            battery_power_kw: p_kw,
            grid_output_kw,
            soc_kwh: self.battery.state.energy_kwh,
        };
        if let Err(e) = self.log.append(&record) {
            warn!(%t_now, "tick log append failed: {e}");
        }
        info!(
            %t_now,
            p_bess_kw = format_args!("{p_kw:.0}"),
            grid_kw = format_args!("{grid_output_kw:.0}"),
            soc_kwh = format_args!("{:.0}", record.soc_kwh),
            "tick committed"
        );
        Ok(record)
    }

    /// Runs every tick of the day back to back, skipping failed ticks.
    pub fn run_day(&mut self) -> Vec<TickRecord> {
        let ticks: Vec<NaiveDateTime> = self.grid.ticks().collect();
        let mut records = Vec::with_capacity(ticks.len());
        for t_now in ticks {
            match self.tick(t_now) {
                Ok(record) => records.push(record),
                Err(e) => warn!(%t_now, "tick skipped: {e}"),
            }
        }
        records
    }

    /// Fallback forecast rows from the day-ahead commitment.
    fn synthesize_forecast(&self, t_now: NaiveDateTime) -> Vec<(NaiveDateTime, f64)> {
        let step = Duration::minutes(i64::from(self.grid.dt_minutes_rtu));
        (0..SUBSTEPS_PER_BLOCK as i64)
            .filter_map(|k| {
                let ts = t_now + step * k as i32;
                self.day_ahead.forward_fill_5min(ts).map(|kw| (ts, kw))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::battery::BatteryParams;
    use crate::control::HeuristicController;
    use approx::assert_relative_eq;
    use chrono::NaiveDate;

    fn ts(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 1, 3)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn grid() -> TimeGrid {
        TimeGrid {
            day_start: ts(6, 0),
            day_end: ts(19, 0),
            dt_minutes_rtu: 5,
            dt_minutes_day_ahead: 15,
        }
    }

    fn battery() -> BatteryModel {
        BatteryModel::new(BatteryParams {
            energy_capacity_kwh: 100_000.0,
            soc_init_kwh: 50_000.0,
            soc_min_kwh: 10_000.0,
            soc_max_kwh: 90_000.0,
            p_discharge_max_kw: 25_000.0,
            p_charge_max_kw: 25_000.0,
            eta_charge: 0.95,
            eta_discharge: 0.95,
            soc_terminal_kwh: 50_000.0,
        })
    }

    fn flat_forecast(kw: f64) -> Vec<SolarSample> {
        grid()
            .ticks()
            .map(|timestamp| SolarSample {
                timestamp,
                power_kw: kw,
            })
            .collect()
    }

    fn make_loop(
        day_ahead: DayAhead,
        forecast: Vec<SolarSample>,
        actual: Vec<SolarSample>,
        log_path: &std::path::Path,
    ) -> ControlLoop<HeuristicController, ReplaySource> {
        ControlLoop::new(
            grid(),
            battery(),
            HeuristicController::new(None, 0.0),
            ReplaySource::new(forecast, actual, 5),
            day_ahead,
            TickLog::new(log_path),
        )
    }

    #[test]
    fn remaining_steps_counts_current_step() {
        let g = grid();
        assert_eq!(g.remaining_steps_day(ts(19, 0)), 1);
        assert_eq!(g.remaining_steps_day(ts(18, 55)), 2);
        assert_eq!(g.remaining_steps_day(ts(6, 0)), 157);
        assert_eq!(g.remaining_steps_day(ts(19, 5)), 0);
    }

    #[test]
    fn ticks_cover_the_day_inclusive() {
        let g = grid();
        let ticks: Vec<_> = g.ticks().collect();
        assert_eq!(ticks.first().copied(), Some(ts(6, 0)));
        assert_eq!(ticks.last().copied(), Some(ts(19, 0)));
        assert_eq!(ticks.len(), 157);
    }

    #[test]
    fn misaligned_tick_fails_without_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let da = DayAhead::from_blocks([(ts(9, 0), 40_000.0)]);
        let mut cl = make_loop(da, flat_forecast(0.0), vec![], &dir.path().join("t.csv"));
        let soc_before = cl.battery().state.energy_kwh;
        let err = cl.tick(ts(9, 2)).unwrap_err();
        assert_eq!(err, TickError::TimeMisaligned(ts(9, 2), 5));
        assert_eq!(cl.battery().state.energy_kwh, soc_before);
        assert_eq!(cl.battery().state.last_p_kw, 0.0);
    }

    #[test]
    fn missing_day_ahead_target_skips_the_tick() {
        let dir = tempfile::tempdir().unwrap();
        let da = DayAhead::from_blocks([(ts(9, 0), 40_000.0)]);
        let mut cl = make_loop(da, flat_forecast(0.0), vec![], &dir.path().join("t.csv"));
        let err = cl.tick(ts(6, 0)).unwrap_err();
        assert_eq!(err, TickError::InputMissing(ts(6, 0)));
        assert_eq!(cl.battery().state.energy_kwh, 50_000.0);
    }

    #[test]
    fn tick_commits_battery_and_reports_grid_output() {
        let dir = tempfile::tempdir().unwrap();
        let da = DayAhead::from_blocks([(ts(9, 0), 40_000.0)]);
        let mut cl = make_loop(
            da,
            flat_forecast(40_000.0),
            vec![],
            &dir.path().join("t.csv"),
        );
        let record = cl.tick(ts(9, 0)).unwrap();
        // Solar covers the target exactly: battery rests, SOC unchanged.
        assert_relative_eq!(record.battery_power_kw, 0.0, epsilon = 1e-9);
        assert_relative_eq!(record.grid_output_kw, 40_000.0, epsilon = 1e-9);
        assert_relative_eq!(cl.battery().state.energy_kwh, 50_000.0, epsilon = 1e-9);
        assert_eq!(record.substep_in_block, 0);
    }

    #[test]
    fn actual_at_tick_overrides_forecast_in_grid_output() {
        let dir = tempfile::tempdir().unwrap();
        let da = DayAhead::from_blocks([(ts(9, 0), 40_000.0)]);
        let actual = vec![SolarSample {
            timestamp: ts(9, 0),
            power_kw: 41_000.0,
        }];
        let mut cl = make_loop(
            da,
            flat_forecast(40_000.0),
            actual,
            &dir.path().join("t.csv"),
        );
        let record = cl.tick(ts(9, 0)).unwrap();
        assert!(record.actual_available);
        assert_relative_eq!(
            record.grid_output_kw,
            41_000.0 + record.battery_power_kw,
            epsilon = 1e-9
        );
    }

    #[test]
    fn empty_forecast_forward_fills_from_day_ahead() {
        let dir = tempfile::tempdir().unwrap();
        let da = DayAhead::from_blocks([(ts(9, 0), 40_000.0)]);
        let mut cl = make_loop(da, vec![], vec![], &dir.path().join("t.csv"));
        let record = cl.tick(ts(9, 0)).unwrap();
        // The synthesized forecast equals the day-ahead power, so the
        // block is already on target without the battery.
        assert_relative_eq!(record.solar_forecast_kw, 40_000.0, epsilon = 1e-9);
        assert_relative_eq!(record.battery_power_kw, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn under_generation_discharges_toward_target() {
        let dir = tempfile::tempdir().unwrap();
        let da = DayAhead::from_blocks([(ts(9, 0), 40_000.0)]);
        let mut cl = make_loop(
            da,
            flat_forecast(20_000.0),
            vec![],
            &dir.path().join("t.csv"),
        );
        let record = cl.tick(ts(9, 0)).unwrap();
        assert_relative_eq!(record.battery_power_kw, 20_000.0, epsilon = 1e-6);
        assert_relative_eq!(record.grid_output_kw, 40_000.0, epsilon = 1e-6);
        assert!(cl.battery().state.energy_kwh < 50_000.0);
    }

    #[test]
    fn run_day_appends_log_rows_in_tick_order() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("t.csv");
        let blocks: Vec<_> = (0..53)
            .map(|k| (ts(6, 0) + Duration::minutes(15 * k), 12_000.0))
            .collect();
        let da = DayAhead::from_blocks(blocks);
        let mut cl = make_loop(da, flat_forecast(12_000.0), vec![], &log_path);
        let records = cl.run_day();
        assert_eq!(records.len(), 157);
        assert!(cl.battery().within_bounds());

        let content = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(content.lines().count(), 158);
        let mut prev = None;
        for r in &records {
            if let Some(p) = prev {
                assert!(r.timestamp > p);
            }
            prev = Some(r.timestamp);
        }
    }
}
