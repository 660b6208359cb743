//! Dense convex-QP solver for the receding-horizon dispatch problems.
//!
//! Minimizes `0.5 xᵀHx + gᵀx` subject to `Ax <= b` with a primal
//! active-set method. The problems solved here are tiny (at most six
//! variables and a few dozen rows), so dense `nalgebra` factorizations of
//! the KKT system are both simple and fast. The iteration cap doubles as
//! the solve budget: a problem that has not converged by then is reported
//! as failed and the caller falls back to a zero setpoint.

use nalgebra::{DMatrix, DVector};

/// Default iteration cap, far above what the dispatch QPs ever need.
pub const DEFAULT_MAX_ITERATIONS: usize = 50;

/// Constraint slack below which a row counts as satisfied/active.
const FEASIBILITY_TOL: f64 = 1e-7;

/// Step norm below which the equality-constrained subproblem is stationary.
const STEP_TOL: f64 = 1e-9;

/// Multiplier tolerance for declaring optimality.
const LAMBDA_TOL: f64 = 1e-9;

/// A convex quadratic program in standard inequality form.
///
/// `hessian` must be symmetric positive definite; callers regularize
/// degenerate objectives before building the problem.
#[derive(Debug, Clone)]
pub struct QpProblem {
    pub hessian: DMatrix<f64>,
    pub gradient: DVector<f64>,
    /// Constraint rows, one per inequality `a_i . x <= b_i`.
    pub constraints: DMatrix<f64>,
    pub bounds: DVector<f64>,
}

impl QpProblem {
    fn is_feasible(&self, x: &DVector<f64>) -> bool {
        let residual = &self.constraints * x - &self.bounds;
        residual.iter().all(|&r| r <= FEASIBILITY_TOL)
    }
}

/// Solves the QP starting from a feasible `x0`.
///
/// Returns `None` when `x0` is infeasible, a KKT system turns out
/// singular, or the iteration cap is exhausted. Those cases are treated
/// identically by the dispatch layer: no solution, fall back.
pub fn solve_qp(
    problem: &QpProblem,
    x0: DVector<f64>,
    max_iterations: usize,
) -> Option<DVector<f64>> {
    let n = problem.gradient.len();
    let m = problem.bounds.len();
    debug_assert_eq!(problem.hessian.nrows(), n);
    debug_assert_eq!(problem.constraints.nrows(), m);

    if !problem.is_feasible(&x0) {
        tracing::debug!("active-set start point infeasible");
        return None;
    }

    let mut x = x0;
    let mut working: Vec<usize> = Vec::new();

    for _ in 0..max_iterations {
        let (step, multipliers) = solve_kkt(problem, &x, &working)?;

        if step.norm() <= STEP_TOL {
            // Stationary on the working set: optimal once every active
            // multiplier is non-negative, otherwise release the most
            // negative constraint and continue.
            match most_negative(&multipliers) {
                None => return Some(x),
                Some(idx) => {
                    working.swap_remove(idx);
                }
            }
        } else {
            let (alpha, blocker) = max_step(problem, &x, &step, &working);
            x += &step * alpha;
            if let Some(row) = blocker {
                working.push(row);
            }
        }
    }

    tracing::debug!("active-set iteration cap reached");
    None
}

/// Solves the equality-constrained subproblem on the working set.
///
/// Returns the step `d` minimizing the objective at `x + d` with the
/// working rows held as equalities, together with their multipliers.
fn solve_kkt(
    problem: &QpProblem,
    x: &DVector<f64>,
    working: &[usize],
) -> Option<(DVector<f64>, DVector<f64>)> {
    let n = problem.gradient.len();
    let mw = working.len();
    let mut kkt = DMatrix::<f64>::zeros(n + mw, n + mw);
    kkt.view_mut((0, 0), (n, n)).copy_from(&problem.hessian);
    for (j, &row) in working.iter().enumerate() {
        for i in 0..n {
            let a = problem.constraints[(row, i)];
            kkt[(i, n + j)] = a;
            kkt[(n + j, i)] = a;
        }
    }

    let grad_at_x = &problem.hessian * x + &problem.gradient;
    let mut rhs = DVector::<f64>::zeros(n + mw);
    rhs.rows_mut(0, n).copy_from(&(-&grad_at_x));

    let sol = kkt.lu().solve(&rhs)?;
    let step = sol.rows(0, n).into_owned();
    let multipliers = sol.rows(n, mw).into_owned();
    Some((step, multipliers))
}

/// Index (into the working set) of the most negative multiplier, if any
/// falls below the optimality tolerance.
fn most_negative(multipliers: &DVector<f64>) -> Option<usize> {
    let mut worst: Option<(usize, f64)> = None;
    for (j, &lambda) in multipliers.iter().enumerate() {
        if lambda < -LAMBDA_TOL && worst.is_none_or(|(_, w)| lambda < w) {
            worst = Some((j, lambda));
        }
    }
    worst.map(|(j, _)| j)
}

/// Largest step length along `d` that stays feasible, together with the
/// first blocking row when the full step is cut short.
fn max_step(
    problem: &QpProblem,
    x: &DVector<f64>,
    d: &DVector<f64>,
    working: &[usize],
) -> (f64, Option<usize>) {
    let mut alpha = 1.0;
    let mut blocker = None;
    for row in 0..problem.bounds.len() {
        if working.contains(&row) {
            continue;
        }
        let a_dot_d: f64 = problem.constraints.row(row).transpose().dot(d);
        if a_dot_d > FEASIBILITY_TOL {
            let slack = problem.bounds[row] - problem.constraints.row(row).transpose().dot(x);
            let limit = (slack / a_dot_d).max(0.0);
            if limit < alpha {
                alpha = limit;
                blocker = Some(row);
            }
        }
    }
    (alpha, blocker)
}
