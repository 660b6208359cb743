//! Battery energy model with charge/discharge efficiencies.

/// Tolerance applied when checking the stored energy against the SOC window.
pub const SOC_BOUND_EPS_KWH: f64 = 1e-6;

/// Immutable battery plant parameters.
///
/// All powers are AC-side (grid-facing) and follow the plant sign
/// convention: positive = discharging to the grid, negative = charging
/// from the grid. Field validation lives in the configuration layer so a
/// bad file is rejected before any state is constructed.
#[derive(Debug, Clone)]
pub struct BatteryParams {
    /// Total energy capacity (kWh).
    pub energy_capacity_kwh: f64,
    /// Stored energy at day start (kWh).
    pub soc_init_kwh: f64,
    /// Lower operating bound on stored energy (kWh).
    pub soc_min_kwh: f64,
    /// Upper operating bound on stored energy (kWh).
    pub soc_max_kwh: f64,
    /// Maximum discharge power (kW, positive magnitude).
    pub p_discharge_max_kw: f64,
    /// Maximum charge power (kW, positive magnitude).
    pub p_charge_max_kw: f64,
    /// Charge efficiency in (0, 1].
    pub eta_charge: f64,
    /// Discharge efficiency in (0, 1].
    pub eta_discharge: f64,
    /// Desired end-of-day stored energy, used as a soft objective (kWh).
    pub soc_terminal_kwh: f64,
}

impl BatteryParams {
    /// Predicts the stored energy after applying `p_kw` for `dt_hours`.
    ///
    /// Discharging drains `p / eta_discharge`; charging banks
    /// `|p| * eta_charge`. Matches the update applied by
    /// [`BatteryModel::step`] without mutating anything.
    pub fn next_energy_kwh(&self, energy_kwh: f64, p_kw: f64, dt_hours: f64) -> f64 {
        if p_kw >= 0.0 {
            energy_kwh - dt_hours * (p_kw / self.eta_discharge)
        } else {
            energy_kwh - dt_hours * (p_kw * self.eta_charge)
        }
    }
}

/// Mutable battery state, owned by the control loop for one plant day.
#[derive(Debug, Clone)]
pub struct BatteryState {
    /// Currently stored energy (kWh).
    pub energy_kwh: f64,
    /// AC-side power applied at the previous step (kW).
    pub last_p_kw: f64,
}

impl BatteryState {
    /// Fresh state at day start: initial SOC, battery at rest.
    pub fn new(params: &BatteryParams) -> Self {
        Self {
            energy_kwh: params.soc_init_kwh,
            last_p_kw: 0.0,
        }
    }
}

/// Battery parameters plus state, advanced one committed step at a time.
///
/// The model integrates energy only; it does not clip the setpoint.
/// Keeping the setpoint inside power, ramp, and SOC limits is the
/// controller's job, so an out-of-bounds command here indicates a
/// controller bug rather than an operating condition to silently absorb.
#[derive(Debug, Clone)]
pub struct BatteryModel {
    pub params: BatteryParams,
    pub state: BatteryState,
}

impl BatteryModel {
    pub fn new(params: BatteryParams) -> Self {
        let state = BatteryState::new(&params);
        Self { params, state }
    }

    /// Commits one step: integrates stored energy and records the setpoint.
    pub fn step(&mut self, p_kw: f64, dt_minutes: u32) {
        let dt_hours = f64::from(dt_minutes) / 60.0;
        self.state.energy_kwh = self
            .params
            .next_energy_kwh(self.state.energy_kwh, p_kw, dt_hours);
        self.state.last_p_kw = p_kw;
    }

    /// Whether the stored energy sits inside the SOC window, with a small
    /// tolerance for float round-off accumulated over a day of steps.
    pub fn within_bounds(&self) -> bool {
        self.state.energy_kwh >= self.params.soc_min_kwh - SOC_BOUND_EPS_KWH
            && self.state.energy_kwh <= self.params.soc_max_kwh + SOC_BOUND_EPS_KWH
    }
}
