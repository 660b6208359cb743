//! CSV batch interface for the tariff evaluator.
//!
//! Reads a metered 15-minute energy file, settles every block, and writes
//! the per-block results. Sits entirely outside the control loop.

use std::path::Path;

use chrono::NaiveDateTime;
use serde::Deserialize;
use tracing::warn;

use super::ingest::IngestError;
use crate::config::TariffConfig;
use crate::tariff::{self, IntervalInput, IntervalResult};

#[derive(Debug, Deserialize)]
struct RevenueRow {
    ts_start: NaiveDateTime,
    e_read_kwh: f64,
    fit_rate: Option<f64>,
    contract_kwh: Option<f64>,
    egat_plan_kwh: Option<f64>,
    has_egat_plan_in_win3: Option<bool>,
}

/// Reads metered blocks, filling per-row gaps from the `[tariff]` config
/// section.
///
/// Required columns: `ts_start`, `e_read_kwh`. Optional per-row overrides:
/// `fit_rate`, `contract_kwh`, `egat_plan_kwh`, `has_egat_plan_in_win3`.
pub fn read_intervals(path: &Path, defaults: &TariffConfig) -> Result<Vec<IntervalInput>, IngestError> {
    let to_err = |e| IngestError::Csv {
        path: path.display().to_string(),
        source: e,
    };
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(to_err)?;
    let mut inputs = Vec::new();
    for record in reader.deserialize() {
        let row: RevenueRow = record.map_err(to_err)?;
        inputs.push(IntervalInput {
            ts_start: row.ts_start,
            e_metered_kwh: row.e_read_kwh,
            fit_rate: row.fit_rate.unwrap_or(defaults.fit_rate),
            contract_kwh: row.contract_kwh.or(defaults.contract_kwh),
            egat_plan_kwh: row.egat_plan_kwh.or(defaults.egat_plan_kwh),
            has_egat_plan_in_win3: row
                .has_egat_plan_in_win3
                .or(defaults.has_egat_plan_in_win3),
        });
    }
    Ok(inputs)
}

/// Settles every block, skipping (with a warning) blocks the evaluator
/// rejects; a rejected block earns nothing.
pub fn settle_intervals(
    inputs: &[IntervalInput],
) -> Vec<(IntervalInput, IntervalResult)> {
    let mut settled = Vec::with_capacity(inputs.len());
    for input in inputs {
        match tariff::compute_payment(input) {
            Ok(result) => settled.push((input.clone(), result)),
            Err(e) => warn!(ts_start = %input.ts_start, "block not settled: {e}"),
        }
    }
    settled
}

/// Writes settled blocks with their inputs to a results CSV.
pub fn write_results(
    path: &Path,
    settled: &[(IntervalInput, IntervalResult)],
) -> std::io::Result<()> {
    use std::io::Write;
    let mut writer = std::io::BufWriter::new(std::fs::File::create(path)?);
    writeln!(
        writer,
        "ts_start,e_read_kwh,fit_rate,window_id,adjusted_subinterval,e_use_kwh,\
         base_kwh,payable_kwh,shortfall_kwh,penalty_currency,payment_currency"
    )?;
    for (input, result) in settled {
        writeln!(
            writer,
            "{},{:.4},{:.4},{},{},{:.4},{:.4},{:.4},{:.4},{:.4},{:.4}",
            input.ts_start.format("%Y-%m-%dT%H:%M:%S"),
            input.e_metered_kwh,
            input.fit_rate,
            result.window.id(),
            result.adjusted_subinterval,
            result.e_use_kwh,
            result.base_kwh,
            result.payable_kwh,
            result.shortfall_kwh,
            result.penalty_currency,
            result.payment_currency,
        )?;
    }
    writer.flush()
}

/// Sum of payments over settled blocks.
pub fn total_payment(settled: &[(IntervalInput, IntervalResult)]) -> f64 {
    settled.iter().map(|(_, r)| r.payment_currency).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::fs;

    fn defaults() -> TariffConfig {
        TariffConfig {
            fit_rate: 5.0,
            contract_kwh: Some(90.0),
            egat_plan_kwh: Some(80.0),
            has_egat_plan_in_win3: Some(false),
        }
    }

    #[test]
    fn rows_inherit_config_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metered.csv");
        fs::write(
            &path,
            "ts_start,e_read_kwh\n\
             2026-01-03T09:00:00,85.0\n\
             2026-01-03T02:00:00,70.0\n",
        )
        .unwrap();
        let inputs = read_intervals(&path, &defaults()).unwrap();
        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs[0].fit_rate, 5.0);
        assert_eq!(inputs[0].contract_kwh, Some(90.0));

        let settled = settle_intervals(&inputs);
        assert_eq!(settled.len(), 2);
        // 85 against the 90 contract in W1, 70 against the 80 plan in W2.
        assert_relative_eq!(
            total_payment(&settled),
            (85.0 * 5.0 - 5.0 * 5.0 * 0.12) + (70.0 * 5.0 - 10.0 * 5.0 * 0.12),
            epsilon = 1e-9
        );
    }

    #[test]
    fn per_row_overrides_win() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metered.csv");
        fs::write(
            &path,
            "ts_start,e_read_kwh,fit_rate,contract_kwh,egat_plan_kwh,has_egat_plan_in_win3\n\
             2026-01-03T09:00:00,100.0,7.0,95.0,,\n",
        )
        .unwrap();
        let inputs = read_intervals(&path, &defaults()).unwrap();
        assert_eq!(inputs[0].fit_rate, 7.0);
        assert_eq!(inputs[0].contract_kwh, Some(95.0));
        // Empty cells fall back to the config defaults.
        assert_eq!(inputs[0].egat_plan_kwh, Some(80.0));
    }

    #[test]
    fn unsettleable_blocks_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metered.csv");
        fs::write(
            &path,
            "ts_start,e_read_kwh\n\
             2026-01-03T09:00:00,85.0\n\
             2026-01-03T09:07:00,85.0\n",
        )
        .unwrap();
        let inputs = read_intervals(&path, &defaults()).unwrap();
        let settled = settle_intervals(&inputs);
        assert_eq!(settled.len(), 1);
    }

    #[test]
    fn results_round_trip_through_csv() {
        let dir = tempfile::tempdir().unwrap();
        let input_path = dir.path().join("metered.csv");
        fs::write(
            &input_path,
            "ts_start,e_read_kwh\n2026-01-03T06:00:00,100.0\n",
        )
        .unwrap();
        let inputs = read_intervals(&input_path, &defaults()).unwrap();
        let settled = settle_intervals(&inputs);

        let out = dir.path().join("revenue.csv");
        write_results(&out, &settled).unwrap();
        let content = fs::read_to_string(&out).unwrap();
        let mut lines = content.lines();
        assert!(lines.next().unwrap().starts_with("ts_start,e_read_kwh"));
        let row = lines.next().unwrap();
        // 06:00 is the adjusted morning boundary block in W3.
        assert!(row.contains(",3,true,"), "row was: {row}");
    }
}
