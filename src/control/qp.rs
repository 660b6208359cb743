//! Receding-horizon QP dispatch over the remaining substeps of a block.

use nalgebra::{DMatrix, DVector};
use serde::Deserialize;
use tracing::warn;

use super::solver::{self, DEFAULT_MAX_ITERATIONS, QpProblem};
use super::{ControlContext, Controller, clamp_to_power_limits, clamp_to_soc_window};
use crate::battery::{BatteryParams, BatteryState};
use crate::block::BlockFrame;

/// Tiny diagonal added to the Hessian. The split variables make the
/// objective merely positive semi-definite (nothing penalizes raising
/// `p_pos` and `p_neg` together), and the KKT factorization needs strict
/// definiteness.
const HESSIAN_REGULARIZATION: f64 = 1e-8;

/// Non-negative weights of the QP objective.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QpWeights {
    /// Per-substep tracking of the block's constant target power.
    pub w_track: f64,
    /// Penalty on setpoint magnitude; also what makes the minimizer
    /// satisfy `p_pos * p_neg = 0` without an explicit complementarity
    /// constraint.
    pub w_mag: f64,
    /// Penalty on setpoint changes between consecutive substeps.
    pub w_smooth: f64,
    /// End-of-block delivered-energy mismatch.
    pub w_block_energy: f64,
    /// Distance of the horizon-final SOC from the terminal target.
    pub w_terminal_soc: f64,
}

impl Default for QpWeights {
    fn default() -> Self {
        Self {
            w_track: 1.0,
            w_mag: 1e-5,
            w_smooth: 1e-3,
            w_block_energy: 1.0,
            w_terminal_soc: 0.0005,
        }
    }
}

/// Convex-QP controller over the remaining substeps of the current block.
///
/// Decision variables are split per substep into non-negative discharge
/// and charge components so the efficiency-weighted SOC recursion stays
/// linear. Only the first move is committed; the problem is re-solved from
/// fresh inputs at the next tick. Any solver failure degrades to a zero
/// setpoint, which is always safe for the plant.
#[derive(Debug, Clone)]
pub struct QpController {
    pub weights: QpWeights,
    /// Maximum setpoint change per step (kW); `None` disables the ramp
    /// rows.
    pub ramp_rate_kw_per_step: Option<f64>,
    /// Horizon cap in substeps. The horizon never crosses the current
    /// block, so only values below 3 change anything.
    pub horizon_steps: usize,
    /// Active-set iteration budget.
    pub max_iterations: usize,
}

impl QpController {
    pub fn new(
        weights: QpWeights,
        ramp_rate_kw_per_step: Option<f64>,
        horizon_steps: usize,
    ) -> Self {
        Self {
            weights,
            ramp_rate_kw_per_step,
            horizon_steps,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    /// Horizon length for this frame, in 1..=3.
    fn horizon(&self, frame: &BlockFrame) -> usize {
        frame.n_future().min(self.horizon_steps.max(1))
    }

    /// Builds and solves the QP; `None` means "no usable solution".
    fn solve_setpoint(
        &self,
        state: &BatteryState,
        frame: &BlockFrame,
        ctx: &ControlContext<'_>,
    ) -> Option<f64> {
        let battery = ctx.battery;
        let dt_h = ctx.dt_hours;
        let r = self.horizon(frame);
        let n = 2 * r;
        let future = &frame.future()[..r];
        let solar_fc: Vec<f64> = future.iter().map(|s| s.solar_forecast_kw).collect();
        let target_power = frame.target_power_kw();
        let e0 = state.energy_kwh;

        let mut hessian = DMatrix::<f64>::zeros(n, n);
        let mut gradient = DVector::<f64>::zeros(n);

        // Coefficient vector of p_k in the split space.
        let p_row = |k: usize| {
            let mut v = DVector::<f64>::zeros(n);
            v[k] = 1.0;
            v[r + k] = -1.0;
            v
        };

        let w = &self.weights;
        for k in 0..r {
            add_squared_term(
                &mut hessian,
                &mut gradient,
                w.w_track,
                &p_row(k),
                solar_fc[k] - target_power,
            );
            add_squared_term(&mut hessian, &mut gradient, w.w_mag, &p_row(k), 0.0);
        }
        for k in 1..r {
            let v = p_row(k) - p_row(k - 1);
            add_squared_term(&mut hessian, &mut gradient, w.w_smooth, &v, 0.0);
        }

        // End-of-block energy: forecast solar plus battery throughput
        // should land on the target. Elapsed solar is already inside
        // `e_target - e_solar_past`, held fixed outside the QP.
        let e_solar_future: f64 = solar_fc.iter().sum::<f64>() * dt_h;
        let mut v_energy = DVector::<f64>::zeros(n);
        for k in 0..r {
            v_energy[k] = dt_h;
            v_energy[r + k] = -dt_h;
        }
        add_squared_term(
            &mut hessian,
            &mut gradient,
            w.w_block_energy,
            &v_energy,
            e_solar_future - frame.e_target_kwh,
        );

        if w.w_terminal_soc > 0.0 {
            // E[r] as an affine function of the split variables.
            let mut v_soc = DVector::<f64>::zeros(n);
            for k in 0..r {
                v_soc[k] = -dt_h / battery.eta_discharge;
                v_soc[r + k] = dt_h * battery.eta_charge;
            }
            add_squared_term(
                &mut hessian,
                &mut gradient,
                w.w_terminal_soc,
                &v_soc,
                e0 - battery.soc_terminal_kwh,
            );
        }

        for i in 0..n {
            hessian[(i, i)] += 2.0 * HESSIAN_REGULARIZATION;
        }

        let (constraints, bounds) = self.constraint_rows(state, battery, dt_h, r);
        let problem = QpProblem {
            hessian,
            gradient,
            constraints,
            bounds,
        };
        let x0 = seed_point(state, battery, self.ramp_rate_kw_per_step, dt_h, r);
        let x = solver::solve_qp(&problem, x0, self.max_iterations)?;
        Some(x[0] - x[r])
    }

    /// Box, ramp, and SOC-recursion rows in `Ax <= b` form.
    fn constraint_rows(
        &self,
        state: &BatteryState,
        battery: &BatteryParams,
        dt_h: f64,
        r: usize,
    ) -> (DMatrix<f64>, DVector<f64>) {
        let n = 2 * r;
        let mut rows: Vec<Vec<f64>> = Vec::new();
        let mut bounds: Vec<f64> = Vec::new();
        let mut push = |coeffs: Vec<f64>, bound: f64| {
            rows.push(coeffs);
            bounds.push(bound);
        };

        // Split-variable boxes.
        for k in 0..r {
            let mut row = vec![0.0; n];
            row[k] = 1.0;
            push(row, battery.p_discharge_max_kw);
            let mut row = vec![0.0; n];
            row[r + k] = 1.0;
            push(row, battery.p_charge_max_kw);
        }
        for i in 0..n {
            let mut row = vec![0.0; n];
            row[i] = -1.0;
            push(row, 0.0);
        }

        // Ramp between consecutive setpoints, anchored at the last
        // committed one.
        if let Some(ramp) = self.ramp_rate_kw_per_step {
            let mut row = vec![0.0; n];
            row[0] = 1.0;
            row[r] = -1.0;
            push(row.clone(), state.last_p_kw + ramp);
            let neg: Vec<f64> = row.iter().map(|c| -c).collect();
            push(neg, ramp - state.last_p_kw);
            for k in 1..r {
                let mut row = vec![0.0; n];
                row[k] = 1.0;
                row[r + k] = -1.0;
                row[k - 1] = -1.0;
                row[r + k - 1] = 1.0;
                push(row.clone(), ramp);
                let neg: Vec<f64> = row.iter().map(|c| -c).collect();
                push(neg, ramp);
            }
        }

        // SOC window after each substep, via the linear recursion
        // E[j] = E0 - dt * sum(p_pos/eta_d) + dt * sum(p_neg * eta_c).
        for j in 1..=r {
            let mut upper = vec![0.0; n];
            for k in 0..j {
                upper[k] = -dt_h / battery.eta_discharge;
                upper[r + k] = dt_h * battery.eta_charge;
            }
            let lower: Vec<f64> = upper.iter().map(|c| -c).collect();
            push(upper, battery.soc_max_kwh - state.energy_kwh);
            push(lower, state.energy_kwh - battery.soc_min_kwh);
        }

        let m = rows.len();
        let flat: Vec<f64> = rows.into_iter().flatten().collect();
        (
            DMatrix::from_row_slice(m, n, &flat),
            DVector::from_vec(bounds),
        )
    }
}

impl Controller for QpController {
    fn compute_current_setpoint(
        &self,
        state: &BatteryState,
        frame: &BlockFrame,
        ctx: &ControlContext<'_>,
    ) -> f64 {
        match self.solve_setpoint(state, frame, ctx) {
            Some(p_kw) => p_kw,
            None => {
                warn!(
                    block_start = %frame.block_start,
                    "QP solve failed, falling back to zero setpoint"
                );
                0.0
            }
        }
    }
}

/// Accumulates `w * (v . x + c)^2` into the quadratic form.
fn add_squared_term(
    hessian: &mut DMatrix<f64>,
    gradient: &mut DVector<f64>,
    weight: f64,
    v: &DVector<f64>,
    c: f64,
) {
    if weight == 0.0 {
        return;
    }
    let n = v.len();
    for i in 0..n {
        if v[i] == 0.0 {
            continue;
        }
        for j in 0..n {
            hessian[(i, j)] += 2.0 * weight * v[i] * v[j];
        }
        gradient[i] += 2.0 * weight * c * v[i];
    }
}

/// Ramp-feasible starting point that coasts the setpoint toward zero,
/// clipped against power limits and the SOC window step by step. If even
/// this near-rest trajectory is infeasible the solver rejects it and the
/// controller falls back.
fn seed_point(
    state: &BatteryState,
    battery: &BatteryParams,
    ramp: Option<f64>,
    dt_h: f64,
    r: usize,
) -> DVector<f64> {
    let mut x0 = DVector::<f64>::zeros(2 * r);
    let mut prev = state.last_p_kw;
    let mut energy = state.energy_kwh;
    for k in 0..r {
        let mut p = match ramp {
            Some(rr) => 0.0_f64.clamp(prev - rr, prev + rr),
            None => 0.0,
        };
        p = clamp_to_power_limits(p, battery);
        p = clamp_to_soc_window(p, energy, battery, dt_h);
        x0[k] = p.max(0.0);
        x0[r + k] = (-p).max(0.0);
        energy = battery.next_energy_kwh(energy, p, dt_h);
        prev = p;
    }
    x0
}
