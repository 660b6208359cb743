//! Feed-in tariff evaluation over 15-minute delivered-energy blocks.
//!
//! Pure scoring of a delivered schedule: windows, caps, shortfall
//! penalties, and the boundary-block adjustments. Nothing here feeds back
//! into dispatch.

use std::fmt;

use chrono::{NaiveDateTime, NaiveTime, Timelike};
use thiserror::Error;

/// Energy factor applied to the three boundary blocks whose metered span
/// covers only minutes 01..=15 of the contractual sub-clause.
pub const ADJUST_FACTOR: f64 = 14.0 / 15.0;

/// Shortfall penalty as a fraction of the FiT rate.
pub const PENALTY_RATE: f64 = 0.12;

/// Window assigned to the 18:00 boundary block. The contract text is
/// ambiguous between the evening peak and the overnight window; this
/// deployment books it overnight, with the 14/15 adjustment applied.
pub const EVENING_BOUNDARY_WINDOW: TariffWindow = TariffWindow::W2;

/// Tariff window of a 15-minute block, determined by its start time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TariffWindow {
    /// Daytime contract window, 09:00 to 16:00.
    W1,
    /// Overnight plan window, before 06:00 and from 18:00.
    W2,
    /// Morning and evening peaks, 06:00 to 09:00 and 16:00 to 18:00.
    W3,
}

impl TariffWindow {
    /// Numeric id used in exported rows.
    pub fn id(self) -> u8 {
        match self {
            Self::W1 => 1,
            Self::W2 => 2,
            Self::W3 => 3,
        }
    }
}

impl fmt::Display for TariffWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "W{}", self.id())
    }
}

/// Inputs for one 15-minute block.
#[derive(Debug, Clone)]
pub struct IntervalInput {
    /// Block start, aligned to the 15-minute grid.
    pub ts_start: NaiveDateTime,
    /// Metered delivered energy for the block (kWh).
    pub e_metered_kwh: f64,
    /// Feed-in tariff rate (currency per kWh).
    pub fit_rate: f64,
    /// Contracted base energy (kWh); required for W1 and for W3 without a
    /// plan.
    pub contract_kwh: Option<f64>,
    /// Planned base energy (kWh); required for W2 and for W3 with a plan.
    pub egat_plan_kwh: Option<f64>,
    /// Whether W3 blocks compare against the plan instead of the contract.
    pub has_egat_plan_in_win3: Option<bool>,
}

/// Settlement outcome for one 15-minute block.
#[derive(Debug, Clone, PartialEq)]
pub struct IntervalResult {
    pub window: TariffWindow,
    /// Whether the 14/15 boundary adjustment applied.
    pub adjusted_subinterval: bool,
    /// Energy after adjustment, the quantity settled against base (kWh).
    pub e_use_kwh: f64,
    pub base_kwh: f64,
    /// Energy actually paid for, capped at base (kWh).
    pub payable_kwh: f64,
    pub shortfall_kwh: f64,
    pub penalty_currency: f64,
    pub payment_currency: f64,
}

#[derive(Debug, Error, PartialEq)]
pub enum TariffError {
    #[error("timestamp {0} is not aligned to the 15-minute block grid")]
    Misaligned(NaiveDateTime),
    #[error("{field} is required for window {window}")]
    MissingWindowInput {
        window: TariffWindow,
        field: &'static str,
    },
    #[error("timestamp {0} does not fall into any tariff window")]
    UnclassifiedWindow(NaiveDateTime),
}

const MORNING_BOUNDARY: NaiveTime = NaiveTime::from_hms_opt(6, 0, 0).unwrap();
const DAY_WINDOW_START: NaiveTime = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
const AFTERNOON_BOUNDARY: NaiveTime = NaiveTime::from_hms_opt(16, 0, 0).unwrap();
const EVENING_BOUNDARY: NaiveTime = NaiveTime::from_hms_opt(18, 0, 0).unwrap();

/// Classifies a block by its start time.
///
/// Windows are closed on the left and open on the right at the transition
/// hours. The three boundary blocks at exactly 06:00, 16:00, and 18:00
/// carry the 14/15 adjustment; 16:00 stays in W1 and 18:00 goes to
/// [`EVENING_BOUNDARY_WINDOW`].
pub fn classify(ts_start: NaiveDateTime) -> Result<(TariffWindow, bool), TariffError> {
    if ts_start.minute() % 15 != 0 || ts_start.second() != 0 || ts_start.nanosecond() != 0 {
        return Err(TariffError::Misaligned(ts_start));
    }
    let tod = ts_start.time();
    let adjusted =
        tod == MORNING_BOUNDARY || tod == AFTERNOON_BOUNDARY || tod == EVENING_BOUNDARY;

    if tod == EVENING_BOUNDARY {
        return Ok((EVENING_BOUNDARY_WINDOW, true));
    }
    if tod >= DAY_WINDOW_START && tod <= AFTERNOON_BOUNDARY {
        return Ok((TariffWindow::W1, adjusted));
    }
    if tod < MORNING_BOUNDARY || tod > EVENING_BOUNDARY {
        return Ok((TariffWindow::W2, false));
    }
    if (tod >= MORNING_BOUNDARY && tod < DAY_WINDOW_START)
        || (tod > AFTERNOON_BOUNDARY && tod < EVENING_BOUNDARY)
    {
        return Ok((TariffWindow::W3, adjusted));
    }
    Err(TariffError::UnclassifiedWindow(ts_start))
}

/// Base energy for a block, by window.
fn base_for_window(window: TariffWindow, input: &IntervalInput) -> Result<f64, TariffError> {
    let missing = |field| TariffError::MissingWindowInput { window, field };
    match window {
        TariffWindow::W1 => input.contract_kwh.ok_or_else(|| missing("contract_kwh")),
        TariffWindow::W2 => input.egat_plan_kwh.ok_or_else(|| missing("egat_plan_kwh")),
        TariffWindow::W3 => {
            let has_plan = input
                .has_egat_plan_in_win3
                .ok_or_else(|| missing("has_egat_plan_in_win3"))?;
            if has_plan {
                input.egat_plan_kwh.ok_or_else(|| missing("egat_plan_kwh"))
            } else {
                input.contract_kwh.ok_or_else(|| missing("contract_kwh"))
            }
        }
    }
}

/// Settles one 15-minute block.
///
/// Payment is capped at the base energy; delivery below base is paid in
/// full but penalized at [`PENALTY_RATE`] of the FiT on the shortfall.
pub fn compute_payment(input: &IntervalInput) -> Result<IntervalResult, TariffError> {
    let (window, adjusted) = classify(input.ts_start)?;
    let e_use = input.e_metered_kwh * if adjusted { ADJUST_FACTOR } else { 1.0 };
    let base = base_for_window(window, input)?;

    let (payable, shortfall, penalty) = if e_use > base {
        (base, 0.0, 0.0)
    } else {
        let shortfall = (base - e_use).max(0.0);
        (e_use, shortfall, shortfall * input.fit_rate * PENALTY_RATE)
    };

    Ok(IntervalResult {
        window,
        adjusted_subinterval: adjusted,
        e_use_kwh: e_use,
        base_kwh: base,
        payable_kwh: payable,
        shortfall_kwh: shortfall,
        penalty_currency: penalty,
        payment_currency: payable * input.fit_rate - penalty,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::NaiveDate;

    fn ts(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 1, 3)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn input(h: u32, m: u32, e_metered: f64) -> IntervalInput {
        IntervalInput {
            ts_start: ts(h, m),
            e_metered_kwh: e_metered,
            fit_rate: 5.0,
            contract_kwh: Some(90.0),
            egat_plan_kwh: Some(90.0),
            has_egat_plan_in_win3: Some(false),
        }
    }

    #[test]
    fn window_ranges_are_half_open() {
        assert_eq!(classify(ts(9, 0)).unwrap(), (TariffWindow::W1, false));
        assert_eq!(classify(ts(15, 45)).unwrap(), (TariffWindow::W1, false));
        assert_eq!(classify(ts(0, 0)).unwrap(), (TariffWindow::W2, false));
        assert_eq!(classify(ts(5, 45)).unwrap(), (TariffWindow::W2, false));
        assert_eq!(classify(ts(23, 45)).unwrap(), (TariffWindow::W2, false));
        assert_eq!(classify(ts(6, 15)).unwrap(), (TariffWindow::W3, false));
        assert_eq!(classify(ts(8, 45)).unwrap(), (TariffWindow::W3, false));
        assert_eq!(classify(ts(16, 15)).unwrap(), (TariffWindow::W3, false));
        assert_eq!(classify(ts(17, 45)).unwrap(), (TariffWindow::W3, false));
    }

    #[test]
    fn boundary_blocks_carry_adjustment() {
        assert_eq!(classify(ts(6, 0)).unwrap(), (TariffWindow::W3, true));
        assert_eq!(classify(ts(16, 0)).unwrap(), (TariffWindow::W1, true));
        assert_eq!(classify(ts(18, 0)).unwrap(), (TariffWindow::W2, true));
    }

    #[test]
    fn only_boundary_blocks_are_adjusted() {
        for (h, m) in [(6, 15), (9, 0), (15, 45), (16, 15), (18, 15), (0, 0)] {
            let (_, adjusted) = classify(ts(h, m)).unwrap();
            assert!(!adjusted, "{h:02}:{m:02} must not be adjusted");
        }
    }

    #[test]
    fn misaligned_timestamp_is_rejected() {
        assert_eq!(
            classify(ts(9, 5)),
            Err(TariffError::Misaligned(ts(9, 5)))
        );
    }

    #[test]
    fn adjusted_block_caps_at_base() {
        // 100 kWh metered at 06:00 settles as 100 * 14/15 = 93.33, above
        // the 90 kWh base: payment is the capped base at full rate.
        let r = compute_payment(&input(6, 0, 100.0)).unwrap();
        assert!(r.adjusted_subinterval);
        assert_relative_eq!(r.e_use_kwh, 100.0 * 14.0 / 15.0, epsilon = 1e-9);
        assert_relative_eq!(r.payable_kwh, 90.0, epsilon = 1e-9);
        assert_eq!(r.penalty_currency, 0.0);
        assert_relative_eq!(r.payment_currency, 450.0, epsilon = 1e-9);
    }

    #[test]
    fn over_delivery_is_capped() {
        let r = compute_payment(&input(10, 0, 120.0)).unwrap();
        assert_relative_eq!(r.payment_currency, 90.0 * 5.0, epsilon = 1e-9);
        assert_eq!(r.shortfall_kwh, 0.0);
    }

    #[test]
    fn under_delivery_pays_energy_minus_penalty() {
        let r = compute_payment(&input(10, 0, 70.0)).unwrap();
        assert_relative_eq!(r.payable_kwh, 70.0, epsilon = 1e-9);
        assert_relative_eq!(r.shortfall_kwh, 20.0, epsilon = 1e-9);
        assert_relative_eq!(r.penalty_currency, 20.0 * 5.0 * 0.12, epsilon = 1e-9);
        assert_relative_eq!(
            r.payment_currency,
            70.0 * 5.0 - 20.0 * 5.0 * 0.12,
            epsilon = 1e-9
        );
    }

    #[test]
    fn payment_is_continuous_at_base() {
        let r = compute_payment(&input(10, 0, 90.0)).unwrap();
        assert_relative_eq!(r.payment_currency, 90.0 * 5.0, epsilon = 1e-9);
        assert_eq!(r.penalty_currency, 0.0);
    }

    #[test]
    fn w1_requires_contract() {
        let mut i = input(10, 0, 80.0);
        i.contract_kwh = None;
        assert_eq!(
            compute_payment(&i),
            Err(TariffError::MissingWindowInput {
                window: TariffWindow::W1,
                field: "contract_kwh",
            })
        );
    }

    #[test]
    fn w2_requires_plan() {
        let mut i = input(2, 0, 80.0);
        i.egat_plan_kwh = None;
        assert_eq!(
            compute_payment(&i),
            Err(TariffError::MissingWindowInput {
                window: TariffWindow::W2,
                field: "egat_plan_kwh",
            })
        );
    }

    #[test]
    fn w3_base_follows_plan_flag() {
        let mut i = input(7, 0, 80.0);
        i.contract_kwh = Some(100.0);
        i.egat_plan_kwh = Some(60.0);

        i.has_egat_plan_in_win3 = Some(true);
        let with_plan = compute_payment(&i).unwrap();
        assert_eq!(with_plan.base_kwh, 60.0);

        i.has_egat_plan_in_win3 = Some(false);
        let with_contract = compute_payment(&i).unwrap();
        assert_eq!(with_contract.base_kwh, 100.0);

        i.has_egat_plan_in_win3 = None;
        assert_eq!(
            compute_payment(&i),
            Err(TariffError::MissingWindowInput {
                window: TariffWindow::W3,
                field: "has_egat_plan_in_win3",
            })
        );
    }

    #[test]
    fn sixteen_hundred_settles_in_the_w1_arm() {
        // The 16:00 block is W1 for base selection even though its
        // adjustment comes from the peak-window clause.
        let mut i = input(16, 0, 80.0);
        i.contract_kwh = Some(100.0);
        i.egat_plan_kwh = None;
        let r = compute_payment(&i).unwrap();
        assert_eq!(r.window, TariffWindow::W1);
        assert!(r.adjusted_subinterval);
        assert_eq!(r.base_kwh, 100.0);
    }
}
