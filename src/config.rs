//! TOML-based EMS configuration.

use std::fs;
use std::path::Path;

use chrono::NaiveDateTime;
use serde::Deserialize;
use thiserror::Error;

use crate::battery::BatteryParams;
use crate::block::is_aligned;
use crate::control::qp::QpWeights;

/// Configuration error with field path and constraint description.
#[derive(Debug, Error)]
#[error("config error: {field}: {message}")]
pub struct ConfigError {
    /// Dotted field path (e.g. `"battery.soc_min_kwh"`).
    pub field: String,
    /// Human-readable constraint description.
    pub message: String,
}

impl ConfigError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Top-level EMS configuration parsed from TOML.
///
/// All fields default to the built-in plant profile, so a config file only
/// needs to state what differs. Load with [`EmsConfig::from_toml_file`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmsConfig {
    /// Day window, step sizes, and ramp limit.
    pub time: TimeConfig,
    /// Battery plant parameters.
    pub battery: BatteryConfig,
    /// Controller selection and objective weights.
    pub mpc: MpcConfig,
    /// Per-day tariff inputs for revenue evaluation.
    pub tariff: TariffConfig,
    /// Output locations.
    pub tracking: TrackingConfig,
}

/// Day window and timing parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeConfig {
    /// IANA timezone identifier for the plant's wall clock.
    pub timezone: String,
    /// First tick of the dispatch day (local, ISO-8601).
    pub day_start: NaiveDateTime,
    /// Last tick of the dispatch day (local, ISO-8601, inclusive).
    pub day_end: NaiveDateTime,
    /// Real-time step in minutes.
    pub dt_minutes_rtu: u32,
    /// Day-ahead block length in minutes.
    pub dt_minutes_day_ahead: u32,
    /// Cap on the controller horizon in real-time steps. The horizon never
    /// crosses the current block, so values above 3 have no extra effect.
    pub mpc_horizon_steps: usize,
    /// Maximum setpoint change between consecutive steps (kW). `None`
    /// disables the ramp constraint.
    pub ramp_rate_kw_per_step: Option<f64>,
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self {
            timezone: "Asia/Bangkok".to_string(),
            day_start: "2026-01-03T06:00:00".parse().expect("valid timestamp"),
            day_end: "2026-01-03T19:00:00".parse().expect("valid timestamp"),
            dt_minutes_rtu: 5,
            dt_minutes_day_ahead: 15,
            mpc_horizon_steps: 24,
            ramp_rate_kw_per_step: Some(2000.0),
        }
    }
}

/// Battery plant parameters, mirrored into [`BatteryParams`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatteryConfig {
    pub energy_capacity_kwh: f64,
    pub soc_init_kwh: f64,
    pub soc_min_kwh: f64,
    pub soc_max_kwh: f64,
    pub p_discharge_max_kw: f64,
    pub p_charge_max_kw: f64,
    pub eta_charge: f64,
    pub eta_discharge: f64,
    pub soc_terminal_kwh: f64,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            energy_capacity_kwh: 100_000.0,
            soc_init_kwh: 50_000.0,
            soc_min_kwh: 10_000.0,
            soc_max_kwh: 90_000.0,
            p_discharge_max_kw: 25_000.0,
            p_charge_max_kw: 25_000.0,
            eta_charge: 0.95,
            eta_discharge: 0.95,
            soc_terminal_kwh: 50_000.0,
        }
    }
}

impl BatteryConfig {
    pub fn to_params(&self) -> BatteryParams {
        BatteryParams {
            energy_capacity_kwh: self.energy_capacity_kwh,
            soc_init_kwh: self.soc_init_kwh,
            soc_min_kwh: self.soc_min_kwh,
            soc_max_kwh: self.soc_max_kwh,
            p_discharge_max_kw: self.p_discharge_max_kw,
            p_charge_max_kw: self.p_charge_max_kw,
            eta_charge: self.eta_charge,
            eta_discharge: self.eta_discharge,
            soc_terminal_kwh: self.soc_terminal_kwh,
        }
    }
}

/// Controller selection and tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MpcConfig {
    /// `true` selects the QP controller, `false` the closed-form heuristic.
    pub use_qp: bool,
    /// Heuristic terminal-SOC bias coefficient, >= 0.
    pub terminal_soc_soft_weight: f64,
    /// QP objective weights.
    pub qp_weights: QpWeights,
}

impl Default for MpcConfig {
    fn default() -> Self {
        Self {
            use_qp: true,
            terminal_soc_soft_weight: 0.5,
            qp_weights: QpWeights::default(),
        }
    }
}

/// Per-day tariff inputs used by the revenue evaluator. These fill in for
/// columns absent from the metered-energy file; they never feed back into
/// dispatch.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TariffConfig {
    /// Feed-in tariff rate (currency per kWh).
    pub fit_rate: f64,
    /// Contracted base energy per block (kWh).
    pub contract_kwh: Option<f64>,
    /// Planned base energy per block for the overnight window (kWh).
    pub egat_plan_kwh: Option<f64>,
    /// Whether the peak window compares against the plan instead of the
    /// contract.
    pub has_egat_plan_in_win3: Option<bool>,
}

impl Default for TariffConfig {
    fn default() -> Self {
        Self {
            fit_rate: 5.0,
            contract_kwh: None,
            egat_plan_kwh: None,
            has_egat_plan_in_win3: None,
        }
    }
}

/// Output locations.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrackingConfig {
    /// Directory receiving the tick log and revenue output.
    pub log_dir: String,
    /// Accepted for compatibility with older deployments; plot rendering
    /// is handled by external tooling.
    pub save_plots: bool,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            log_dir: "logs".to_string(),
            save_plots: false,
        }
    }
}

impl EmsConfig {
    /// Parses a configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the file cannot be read or the TOML is
    /// invalid.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| {
            ConfigError::new("config", format!("cannot read \"{}\": {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parses a configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the TOML is invalid or contains unknown
    /// fields.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|e| ConfigError::new("toml", e.to_string()))
    }

    /// Validates all fields and returns the list of violations.
    ///
    /// Returns an empty vector if the configuration is valid.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        let t = &self.time;

        if t.timezone.parse::<chrono_tz::Tz>().is_err() {
            errors.push(ConfigError::new(
                "time.timezone",
                format!("unknown timezone \"{}\"", t.timezone),
            ));
        }
        if t.dt_minutes_rtu == 0 || 60 % t.dt_minutes_rtu != 0 {
            errors.push(ConfigError::new(
                "time.dt_minutes_rtu",
                "must be a positive divisor of 60",
            ));
        }
        if t.dt_minutes_day_ahead == 0
            || t.dt_minutes_rtu == 0
            || t.dt_minutes_day_ahead % t.dt_minutes_rtu != 0
        {
            errors.push(ConfigError::new(
                "time.dt_minutes_day_ahead",
                "must be a positive multiple of time.dt_minutes_rtu",
            ));
        }
        if t.day_start >= t.day_end {
            errors.push(ConfigError::new("time.day_start", "must be < time.day_end"));
        }
        if t.dt_minutes_rtu > 0 && !is_aligned(t.day_start, t.dt_minutes_rtu) {
            errors.push(ConfigError::new(
                "time.day_start",
                "must sit on the real-time step grid",
            ));
        }
        if t.mpc_horizon_steps == 0 {
            errors.push(ConfigError::new("time.mpc_horizon_steps", "must be > 0"));
        }
        if let Some(ramp) = t.ramp_rate_kw_per_step {
            if ramp <= 0.0 {
                errors.push(ConfigError::new(
                    "time.ramp_rate_kw_per_step",
                    "must be > 0 when set",
                ));
            }
        }

        let b = &self.battery;
        if b.energy_capacity_kwh <= 0.0 {
            errors.push(ConfigError::new(
                "battery.energy_capacity_kwh",
                "must be > 0",
            ));
        }
        if b.eta_charge <= 0.0 || b.eta_charge > 1.0 {
            errors.push(ConfigError::new("battery.eta_charge", "must be in (0, 1]"));
        }
        if b.eta_discharge <= 0.0 || b.eta_discharge > 1.0 {
            errors.push(ConfigError::new("battery.eta_discharge", "must be in (0, 1]"));
        }
        if b.p_discharge_max_kw < 0.0 {
            errors.push(ConfigError::new(
                "battery.p_discharge_max_kw",
                "must be >= 0",
            ));
        }
        if b.p_charge_max_kw < 0.0 {
            errors.push(ConfigError::new("battery.p_charge_max_kw", "must be >= 0"));
        }
        if b.soc_min_kwh < 0.0 || b.soc_min_kwh > b.soc_max_kwh {
            errors.push(ConfigError::new(
                "battery.soc_min_kwh",
                "must satisfy 0 <= soc_min <= soc_max",
            ));
        }
        if b.soc_max_kwh > b.energy_capacity_kwh {
            errors.push(ConfigError::new(
                "battery.soc_max_kwh",
                "must be <= battery.energy_capacity_kwh",
            ));
        }
        if b.soc_init_kwh < b.soc_min_kwh || b.soc_init_kwh > b.soc_max_kwh {
            errors.push(ConfigError::new(
                "battery.soc_init_kwh",
                "must lie within [soc_min, soc_max]",
            ));
        }
        if b.soc_terminal_kwh < b.soc_min_kwh || b.soc_terminal_kwh > b.soc_max_kwh {
            errors.push(ConfigError::new(
                "battery.soc_terminal_kwh",
                "must lie within [soc_min, soc_max]",
            ));
        }

        let m = &self.mpc;
        if m.terminal_soc_soft_weight < 0.0 {
            errors.push(ConfigError::new(
                "mpc.terminal_soc_soft_weight",
                "must be >= 0",
            ));
        }
        for (field, value) in [
            ("mpc.qp_weights.w_track", m.qp_weights.w_track),
            ("mpc.qp_weights.w_mag", m.qp_weights.w_mag),
            ("mpc.qp_weights.w_smooth", m.qp_weights.w_smooth),
            ("mpc.qp_weights.w_block_energy", m.qp_weights.w_block_energy),
            ("mpc.qp_weights.w_terminal_soc", m.qp_weights.w_terminal_soc),
        ] {
            if value < 0.0 {
                errors.push(ConfigError::new(field, "must be >= 0"));
            }
        }

        if self.tariff.fit_rate < 0.0 {
            errors.push(ConfigError::new("tariff.fit_rate", "must be >= 0"));
        }
        if self.tracking.log_dir.is_empty() {
            errors.push(ConfigError::new("tracking.log_dir", "must not be empty"));
        }

        errors
    }
}
