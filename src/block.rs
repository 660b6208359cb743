//! 15-minute block framing of the 5-minute real-time timeline.

use chrono::{Duration, NaiveDateTime, Timelike};

/// Number of 5-minute substeps inside one contractual block.
pub const SUBSTEPS_PER_BLOCK: usize = 3;

/// Block length on the day-ahead grid.
pub const BLOCK_MINUTES: u32 = 15;

/// Block length in hours, used to convert expected power to block energy.
pub const BLOCK_HOURS: f64 = 0.25;

/// Floors a timestamp to the start of its 15-minute block, e.g. 06:07 to 06:00.
pub fn floor_to_15min(ts: NaiveDateTime) -> NaiveDateTime {
    let minute = (ts.minute() / BLOCK_MINUTES) * BLOCK_MINUTES;
    ts.with_minute(minute)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

/// Whether a timestamp sits exactly on the grid of `dt_minutes` steps.
pub fn is_aligned(ts: NaiveDateTime, dt_minutes: u32) -> bool {
    dt_minutes > 0 && ts.minute() % dt_minutes == 0 && ts.second() == 0 && ts.nanosecond() == 0
}

/// One 5-minute sub-interval of a block.
#[derive(Debug, Clone)]
pub struct Substep {
    pub timestamp: NaiveDateTime,
    /// Position inside the block: 0 at :00, 1 at :05, 2 at :10.
    pub substep_in_block: usize,
    /// Forecast PV power, non-negative (kW).
    pub solar_forecast_kw: f64,
    /// Metered PV power when the reading has arrived (kW).
    pub solar_actual_kw: Option<f64>,
}

impl Substep {
    pub fn actual_available(&self) -> bool {
        self.solar_actual_kw.is_some()
    }

    /// Actual where available, forecast otherwise.
    pub fn best_known_kw(&self) -> f64 {
        self.solar_actual_kw.unwrap_or(self.solar_forecast_kw)
    }
}

/// Per-tick view of the current block: target energy, the three ordered
/// substeps, and where the tick sits among them.
///
/// Substeps strictly before `current_index` are elapsed ("past"); the
/// substep at `current_index` and after are still dispatchable ("future").
#[derive(Debug, Clone)]
pub struct BlockFrame {
    pub block_start: NaiveDateTime,
    /// Contracted energy for this block (kWh).
    pub e_target_kwh: f64,
    substeps: Vec<Substep>,
    pub current_index: usize,
}

impl BlockFrame {
    /// Assembles the frame for the block containing `t_now`.
    ///
    /// Three substep rows are laid out at `block_start` + 0/5/10 minutes.
    /// Forecast samples are matched by timestamp, defaulted to zero where
    /// missing, and clipped non-negative. Actual samples attach wherever
    /// their timestamp matches a substep row; in online operation the loop
    /// supplies at most the row for `t_now`. Returns `None` when `t_now`
    /// does not land on any of the three substep rows.
    pub fn assemble(
        block_start: NaiveDateTime,
        e_target_kwh: f64,
        forecast: &[(NaiveDateTime, f64)],
        actuals: &[(NaiveDateTime, f64)],
        t_now: NaiveDateTime,
        dt_minutes: u32,
    ) -> Option<Self> {
        let mut substeps = Vec::with_capacity(SUBSTEPS_PER_BLOCK);
        let mut current_index = None;
        for k in 0..SUBSTEPS_PER_BLOCK {
            let timestamp = block_start + Duration::minutes(i64::from(dt_minutes) * k as i64);
            let solar_forecast_kw = forecast
                .iter()
                .find(|(ts, _)| *ts == timestamp)
                .map_or(0.0, |(_, kw)| kw.max(0.0));
            let solar_actual_kw = actuals
                .iter()
                .find(|(ts, _)| *ts == timestamp)
                .map(|(_, kw)| kw.max(0.0));
            if timestamp == t_now {
                current_index = Some(k);
            }
            substeps.push(Substep {
                timestamp,
                substep_in_block: k,
                solar_forecast_kw,
                solar_actual_kw,
            });
        }
        current_index.map(|current_index| Self {
            block_start,
            e_target_kwh,
            substeps,
            current_index,
        })
    }

    pub fn substeps(&self) -> &[Substep] {
        &self.substeps
    }

    /// Elapsed substeps of the block.
    pub fn past(&self) -> &[Substep] {
        &self.substeps[..self.current_index]
    }

    /// The current substep and everything after it.
    pub fn future(&self) -> &[Substep] {
        &self.substeps[self.current_index..]
    }

    pub fn current(&self) -> &Substep {
        &self.substeps[self.current_index]
    }

    /// Remaining dispatchable substeps, in 1..=3.
    pub fn n_future(&self) -> usize {
        SUBSTEPS_PER_BLOCK - self.current_index
    }

    /// Solar energy already banked into the block: actuals where metered,
    /// forecast otherwise (kWh).
    pub fn e_solar_past_kwh(&self, dt_hours: f64) -> f64 {
        self.past().iter().map(Substep::best_known_kw).sum::<f64>() * dt_hours
    }

    /// Forecast solar energy over the remaining substeps (kWh).
    pub fn e_solar_future_kwh(&self, dt_hours: f64) -> f64 {
        self.future()
            .iter()
            .map(|s| s.solar_forecast_kw)
            .sum::<f64>()
            * dt_hours
    }

    /// Constant power equivalent of the block target (kW).
    pub fn target_power_kw(&self) -> f64 {
        self.e_target_kwh / BLOCK_HOURS
    }
}
