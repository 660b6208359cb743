//! Post-hoc tracking quality summary over a day of tick records.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDateTime;

use crate::io::log::TickRecord;

/// Aggregate tracking metrics, computed after the fact from the tick log
/// so the report always agrees with the rows on disk.
#[derive(Debug, Clone)]
pub struct TrackingSummary {
    /// Mean absolute power-domain tracking error (kW).
    pub mae_tracking_kw: f64,
    /// Root-mean-square power-domain tracking error (kW).
    pub rmse_tracking_kw: f64,
    /// Total battery energy throughput (kWh, sum of |power| * dt).
    pub battery_throughput_kwh: f64,
    /// Delivered-minus-target energy per block (kWh).
    pub block_energy_error_kwh: BTreeMap<NaiveDateTime, f64>,
    /// SOC after the final tick (kWh).
    pub final_soc_kwh: f64,
}

impl TrackingSummary {
    /// Computes all metrics from the complete tick record vector.
    pub fn from_records(records: &[TickRecord], dt_hours: f64) -> Self {
        if records.is_empty() {
            return Self {
                mae_tracking_kw: 0.0,
                rmse_tracking_kw: 0.0,
                battery_throughput_kwh: 0.0,
                block_energy_error_kwh: BTreeMap::new(),
                final_soc_kwh: 0.0,
            };
        }

        let n = records.len() as f64;
        let mut abs_sum = 0.0;
        let mut sq_sum = 0.0;
        let mut throughput = 0.0;
        let mut delivered: BTreeMap<NaiveDateTime, (f64, f64)> = BTreeMap::new();

        for r in records {
            let err = r.grid_output_kw - r.target_power_kw;
            abs_sum += err.abs();
            sq_sum += err * err;
            throughput += r.battery_power_kw.abs() * dt_hours;
            let entry = delivered.entry(r.block_start).or_insert((0.0, r.e_target_kwh));
            entry.0 += r.grid_output_kw * dt_hours;
        }

        let block_energy_error_kwh = delivered
            .into_iter()
            .map(|(block, (e_delivered, e_target))| (block, e_delivered - e_target))
            .collect();

        Self {
            mae_tracking_kw: abs_sum / n,
            rmse_tracking_kw: (sq_sum / n).sqrt(),
            battery_throughput_kwh: throughput,
            block_energy_error_kwh,
            final_soc_kwh: records[records.len() - 1].soc_kwh,
        }
    }

    /// Block with the largest absolute energy miss, if any.
    pub fn worst_block(&self) -> Option<(NaiveDateTime, f64)> {
        self.block_energy_error_kwh
            .iter()
            .max_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))
            .map(|(ts, err)| (*ts, *err))
    }
}

impl fmt::Display for TrackingSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- Tracking Summary ---")?;
        writeln!(f, "MAE tracking error:  {:>10.1} kW", self.mae_tracking_kw)?;
        writeln!(f, "RMSE tracking error: {:>10.1} kW", self.rmse_tracking_kw)?;
        writeln!(
            f,
            "Battery throughput:  {:>10.1} kWh",
            self.battery_throughput_kwh
        )?;
        writeln!(f, "Final SOC:           {:>10.1} kWh", self.final_soc_kwh)?;
        match self.worst_block() {
            Some((block, err)) => write!(
                f,
                "Worst block:         {} ({err:+.1} kWh)",
                block.format("%H:%M")
            ),
            None => write!(f, "Worst block:         n/a"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::NaiveDate;

    fn record(minute_of_day: u32, grid_kw: f64, target_kw: f64, p_kw: f64) -> TickRecord {
        let day = NaiveDate::from_ymd_opt(2026, 1, 3).unwrap();
        let timestamp = day.and_hms_opt(minute_of_day / 60, minute_of_day % 60, 0).unwrap();
        TickRecord {
            timestamp,
            block_start: crate::block::floor_to_15min(timestamp),
            substep_in_block: ((minute_of_day % 15) / 5) as usize,
            e_target_kwh: target_kw * 0.25,
            target_power_kw: target_kw,
            solar_forecast_kw: grid_kw - p_kw,
            solar_actual_kw: None,
            actual_available: false,
            battery_power_kw: p_kw,
            grid_output_kw: grid_kw,
            soc_kwh: 50_000.0,
        }
    }

    #[test]
    fn empty_records_summarize_to_zeros() {
        let s = TrackingSummary::from_records(&[], 1.0 / 12.0);
        assert_eq!(s.mae_tracking_kw, 0.0);
        assert!(s.worst_block().is_none());
    }

    #[test]
    fn perfect_tracking_has_zero_errors() {
        let records: Vec<_> = (0..3)
            .map(|k| record(9 * 60 + 5 * k, 40_000.0, 40_000.0, 0.0))
            .collect();
        let s = TrackingSummary::from_records(&records, 1.0 / 12.0);
        assert_eq!(s.mae_tracking_kw, 0.0);
        assert_eq!(s.rmse_tracking_kw, 0.0);
        assert_eq!(s.battery_throughput_kwh, 0.0);
        let worst = s.worst_block().unwrap();
        assert_relative_eq!(worst.1, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn block_energy_error_sums_substeps() {
        // One block delivering 30 MW against a 40 MW target misses by
        // 10 MW * 0.25 h = 2500 kWh.
        let records: Vec<_> = (0..3)
            .map(|k| record(9 * 60 + 5 * k, 30_000.0, 40_000.0, 5000.0))
            .collect();
        let s = TrackingSummary::from_records(&records, 1.0 / 12.0);
        assert_relative_eq!(s.mae_tracking_kw, 10_000.0, epsilon = 1e-9);
        let worst = s.worst_block().unwrap();
        assert_relative_eq!(worst.1, -2500.0, epsilon = 1e-6);
        assert_relative_eq!(s.battery_throughput_kwh, 3.0 * 5000.0 / 12.0, epsilon = 1e-9);
    }

    #[test]
    fn worst_block_picks_largest_absolute_miss() {
        let mut records: Vec<_> = (0..3)
            .map(|k| record(9 * 60 + 5 * k, 39_000.0, 40_000.0, 0.0))
            .collect();
        records.extend((0..3).map(|k| record(10 * 60 + 5 * k, 30_000.0, 40_000.0, 0.0)));
        let s = TrackingSummary::from_records(&records, 1.0 / 12.0);
        let (block, err) = s.worst_block().unwrap();
        assert_eq!(
            block,
            NaiveDate::from_ymd_opt(2026, 1, 3)
                .unwrap()
                .and_hms_opt(10, 0, 0)
                .unwrap()
        );
        assert!(err < -2000.0);
    }
}
