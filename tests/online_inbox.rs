//! Online-mode plumbing: inbox polling, fallbacks, and the tick log.

mod common;

use std::fs;

use approx::assert_relative_eq;

use hybrid_ems::control::HeuristicController;
use hybrid_ems::io::ingest::{DayAhead, InboxSource};
use hybrid_ems::mimic::{MimicParams, StreamMimic};
use hybrid_ems::runtime::{ControlLoop, TickError};

use common::{base_config, battery, constant_day_ahead, grid, log_in, ts};

fn inbox_loop(
    dir: &std::path::Path,
    cfg: &hybrid_ems::config::EmsConfig,
    day_ahead: DayAhead,
) -> ControlLoop<HeuristicController, InboxSource> {
    ControlLoop::new(
        grid(cfg),
        battery(cfg),
        HeuristicController::new(None, 0.0),
        InboxSource::new(dir, cfg.time.dt_minutes_rtu),
        day_ahead,
        log_in(dir),
    )
}

#[test]
fn ticks_consume_per_tick_inbox_drops() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = base_config();
    let g = grid(&cfg);
    let files = StreamMimic::new(MimicParams::default())
        .generate_day(dir.path(), &g)
        .unwrap();
    let day_ahead = DayAhead::from_csv(&files.day_ahead)
        .unwrap()
        .clip_to_day(g.day_start, g.day_end);

    let mut cl = inbox_loop(dir.path(), &cfg, day_ahead);
    let r0 = cl.tick(ts(6, 0)).unwrap();
    let r1 = cl.tick(ts(6, 5)).unwrap();

    // The 06:00 actual drop exists, so the first tick runs on metered PV.
    assert!(r0.actual_available);
    assert!(r1.actual_available);
    assert_eq!(r0.substep_in_block, 0);
    assert_eq!(r1.substep_in_block, 1);

    let log = fs::read_to_string(dir.path().join("ticks.csv")).unwrap();
    assert_eq!(log.lines().count(), 3);
}

#[test]
fn missing_forecast_falls_back_to_day_ahead() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = base_config();
    let g = grid(&cfg);
    // Inbox exists but holds no forecast or actual drops at all.
    let day_ahead = constant_day_ahead(dir.path(), &g, 30_000.0);

    let mut cl = inbox_loop(dir.path(), &cfg, day_ahead);
    let record = cl.tick(ts(9, 0)).unwrap();

    // Forward-filled forecast equals the commitment, so the controller
    // sees a block already on target.
    assert_relative_eq!(record.solar_forecast_kw, 30_000.0, epsilon = 1e-9);
    assert!(!record.actual_available);
    assert_relative_eq!(record.battery_power_kw, 0.0, epsilon = 1e-6);
}

#[test]
fn missing_actual_is_not_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = base_config();
    let g = grid(&cfg);
    let day_ahead = constant_day_ahead(dir.path(), &g, 30_000.0);

    // Forecast drop present, actual absent.
    let fdir = dir.path().join("forecast");
    fs::create_dir_all(&fdir).unwrap();
    fs::write(
        fdir.join("forecast_20260103_0900.csv"),
        "timestamp,solar_forecast_kw\n\
         2026-01-03T09:00:00,28000.0\n\
         2026-01-03T09:05:00,28000.0\n\
         2026-01-03T09:10:00,28000.0\n",
    )
    .unwrap();

    let mut cl = inbox_loop(dir.path(), &cfg, day_ahead);
    let record = cl.tick(ts(9, 0)).unwrap();
    assert!(!record.actual_available);
    assert_relative_eq!(record.solar_forecast_kw, 28_000.0, epsilon = 1e-9);
    // 2 MW short of the 30 MW commitment: the battery covers it.
    assert_relative_eq!(record.battery_power_kw, 2000.0, epsilon = 1e-6);
}

#[test]
fn failed_tick_does_not_poison_the_next_one() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = base_config();
    let g = grid(&cfg);
    // Commitment only covers 09:00 onward.
    let path = dir.path().join("day_ahead.csv");
    fs::write(
        &path,
        "timestamp,expected_power_kw\n2026-01-03T09:00:00,30000.0\n",
    )
    .unwrap();
    let day_ahead = DayAhead::from_csv(&path)
        .unwrap()
        .clip_to_day(g.day_start, g.day_end);

    let mut cl = inbox_loop(dir.path(), &cfg, day_ahead);

    let err = cl.tick(ts(6, 0)).unwrap_err();
    assert_eq!(err, TickError::InputMissing(ts(6, 0)));
    assert_relative_eq!(cl.battery().state.energy_kwh, cfg.battery.soc_init_kwh);

    // The next tick inside the covered window commits normally.
    let record = cl.tick(ts(9, 0)).unwrap();
    assert_eq!(record.substep_in_block, 0);
    assert!(cl.battery().within_bounds());
}
