//! Block-energy controllers and the QP machinery behind them.

pub mod heuristic;
pub mod qp;
pub mod solver;

pub use heuristic::HeuristicController;
pub use qp::QpController;

use crate::battery::{BatteryParams, BatteryState};
use crate::block::BlockFrame;

/// Per-tick inputs shared by every controller besides the block frame.
#[derive(Debug, Clone)]
pub struct ControlContext<'a> {
    /// Battery plant limits and efficiencies.
    pub battery: &'a BatteryParams,
    /// Real-time step length in hours.
    pub dt_hours: f64,
    /// Real-time steps left in the dispatch day, current step included.
    pub remaining_steps_day: usize,
}

/// A dispatch policy for the current real-time step.
///
/// Implementations are stateless value types: everything they need arrives
/// through the arguments, and the returned setpoint is the only output.
/// Positive = discharge to grid, negative = charge from grid.
pub trait Controller {
    /// Computes the battery setpoint for the frame's current substep (kW).
    fn compute_current_setpoint(
        &self,
        state: &BatteryState,
        frame: &BlockFrame,
        ctx: &ControlContext<'_>,
    ) -> f64;
}

/// Clips a setpoint to the plant's charge/discharge power limits.
pub(crate) fn clamp_to_power_limits(p_kw: f64, battery: &BatteryParams) -> f64 {
    p_kw.clamp(-battery.p_charge_max_kw, battery.p_discharge_max_kw)
}

/// Minimally adjusts a setpoint so the next SOC stays inside the window.
///
/// A discharge that would cross `soc_min` is reduced to the largest power
/// that lands exactly on the bound; a charge that would cross `soc_max` is
/// shrunk symmetrically. The result is re-clipped to the power limits.
pub(crate) fn clamp_to_soc_window(
    p_kw: f64,
    energy_kwh: f64,
    battery: &BatteryParams,
    dt_hours: f64,
) -> f64 {
    let mut p = p_kw;
    if p >= 0.0 {
        let e_next = battery.next_energy_kwh(energy_kwh, p, dt_hours);
        if e_next < battery.soc_min_kwh {
            let p_allowed =
                ((energy_kwh - battery.soc_min_kwh) * battery.eta_discharge / dt_hours).max(0.0);
            p = p.min(p_allowed);
        }
    } else {
        let e_next = battery.next_energy_kwh(energy_kwh, p, dt_hours);
        if e_next > battery.soc_max_kwh {
            let p_allowed =
                ((energy_kwh - battery.soc_max_kwh) / (dt_hours * battery.eta_charge)).min(0.0);
            p = p.max(p_allowed);
        }
    }
    clamp_to_power_limits(p, battery)
}
