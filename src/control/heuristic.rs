//! Closed-form block-energy allocator.

use super::{ControlContext, Controller, clamp_to_power_limits, clamp_to_soc_window};
use crate::battery::BatteryState;
use crate::block::BlockFrame;

/// Spreads the residual block energy evenly over the remaining substeps.
///
/// The desired power is the battery energy still needed to hit the block
/// target, divided by the remaining time. An optional soft bias steers the
/// SOC toward its end-of-day target by spreading the SOC error over the
/// rest of the day. Ramp, power, and SOC limits are applied in that order;
/// the controller saturates silently and never fails.
#[derive(Debug, Clone)]
pub struct HeuristicController {
    /// Maximum setpoint change per step (kW); `None` disables the ramp.
    pub ramp_rate_kw_per_step: Option<f64>,
    /// Terminal-SOC bias coefficient, >= 0. Zero disables the bias.
    pub terminal_weight: f64,
}

impl HeuristicController {
    pub fn new(ramp_rate_kw_per_step: Option<f64>, terminal_weight: f64) -> Self {
        Self {
            ramp_rate_kw_per_step,
            terminal_weight: terminal_weight.max(0.0),
        }
    }

    fn apply_ramp(&self, p_des: f64, last_p_kw: f64) -> f64 {
        match self.ramp_rate_kw_per_step {
            Some(ramp) => p_des.clamp(last_p_kw - ramp, last_p_kw + ramp),
            None => p_des,
        }
    }
}

impl Controller for HeuristicController {
    fn compute_current_setpoint(
        &self,
        state: &BatteryState,
        frame: &BlockFrame,
        ctx: &ControlContext<'_>,
    ) -> f64 {
        let dt_h = ctx.dt_hours;

        // Residual energy the battery must supply by block end: target minus
        // banked solar (actuals where metered) minus forecast solar to come.
        let e_solar_past = frame.e_solar_past_kwh(dt_h);
        let e_solar_future = frame.e_solar_future_kwh(dt_h);
        let e_bess_needed = frame.e_target_kwh - (e_solar_past + e_solar_future);

        let n_future = frame.n_future() as f64;
        let mut p_des = e_bess_needed / (n_future * dt_h);

        // Positive SOC error (above target) biases toward discharging.
        if self.terminal_weight > 0.0 && ctx.remaining_steps_day > 0 {
            let e_soc_err = state.energy_kwh - ctx.battery.soc_terminal_kwh;
            p_des += self.terminal_weight * e_soc_err / (ctx.remaining_steps_day as f64 * dt_h);
        }

        let p = self.apply_ramp(p_des, state.last_p_kw);
        let p = clamp_to_power_limits(p, ctx.battery);
        clamp_to_soc_window(p, state.energy_kwh, ctx.battery, dt_h)
    }
}
