//! EMS entry point: CLI wiring and config-driven loop construction.

use std::path::{Path, PathBuf};
use std::process;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hybrid_ems::battery::BatteryModel;
use hybrid_ems::config::EmsConfig;
use hybrid_ems::control::{Controller, HeuristicController, QpController};
use hybrid_ems::io::ingest::{DayAhead, InboxSource, read_actual, read_forecast};
use hybrid_ems::io::log::TickLog;
use hybrid_ems::io::revenue;
use hybrid_ems::mimic::{MimicParams, StreamMimic};
use hybrid_ems::runtime::{ControlLoop, InputSource, ReplaySource, TimeGrid};
use hybrid_ems::summary::TrackingSummary;

/// Parsed CLI arguments.
struct CliArgs {
    config_path: Option<PathBuf>,
    data_dir: PathBuf,
    day_ahead: Option<PathBuf>,
    forecast: Option<PathBuf>,
    actual: Option<PathBuf>,
    out: Option<PathBuf>,
    seed_override: Option<u64>,
    replay: bool,
    gen_inputs: bool,
    revenue_input: Option<PathBuf>,
}

fn print_help() {
    eprintln!("hybrid-ems — PV + BESS dispatch against day-ahead block-energy commitments");
    eprintln!();
    eprintln!("Usage: hybrid-ems [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --config <path>      Load configuration from TOML (built-in profile otherwise)");
    eprintln!("  --data-dir <dir>     Inbox root for input streams (default: data/inbox)");
    eprintln!("  --replay             Replay the configured day from full-day CSVs, no pacing");
    eprintln!("  --day-ahead <path>   Day-ahead CSV (default: <data-dir>/day_ahead_<date>.csv)");
    eprintln!("  --forecast <path>    Full-day forecast CSV for replay (default: <data-dir>/forecast_day.csv)");
    eprintln!("  --actual <path>      Full-day actuals CSV for replay (default: <data-dir>/actual_day.csv)");
    eprintln!("  --gen-inputs         Generate a synthetic input day into <data-dir> and exit");
    eprintln!("  --seed <u64>         Seed for --gen-inputs");
    eprintln!("  --revenue <path>     Settle a metered 15-min energy CSV and exit");
    eprintln!("  --out <path>         Output path for --revenue results");
    eprintln!("  --help               Show this help message");
}

fn parse_args() -> CliArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut cli = CliArgs {
        config_path: None,
        data_dir: PathBuf::from("data/inbox"),
        day_ahead: None,
        forecast: None,
        actual: None,
        out: None,
        seed_override: None,
        replay: false,
        gen_inputs: false,
        revenue_input: None,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                process::exit(0);
            }
            "--replay" => cli.replay = true,
            "--gen-inputs" => cli.gen_inputs = true,
            "--config" => cli.config_path = Some(path_value(&args, &mut i)),
            "--data-dir" => cli.data_dir = path_value(&args, &mut i),
            "--day-ahead" => cli.day_ahead = Some(path_value(&args, &mut i)),
            "--forecast" => cli.forecast = Some(path_value(&args, &mut i)),
            "--actual" => cli.actual = Some(path_value(&args, &mut i)),
            "--out" => cli.out = Some(path_value(&args, &mut i)),
            "--revenue" => cli.revenue_input = Some(path_value(&args, &mut i)),
            "--seed" => {
                i += 1;
                match args.get(i).and_then(|s| s.parse::<u64>().ok()) {
                    Some(seed) => cli.seed_override = Some(seed),
                    None => {
                        eprintln!("error: --seed requires a u64 argument");
                        process::exit(1);
                    }
                }
            }
            other => {
                eprintln!("error: unknown argument \"{other}\"");
                print_help();
                process::exit(1);
            }
        }
        i += 1;
    }

    cli
}

fn path_value(args: &[String], i: &mut usize) -> PathBuf {
    let flag = args[*i].clone();
    *i += 1;
    match args.get(*i) {
        Some(value) => PathBuf::from(value),
        None => {
            eprintln!("error: {flag} requires a path argument");
            process::exit(1);
        }
    }
}

/// Loads the day-ahead commitment, clipped to the dispatch day.
fn load_day_ahead(path: &Path, grid: &TimeGrid) -> DayAhead {
    let day_ahead = match DayAhead::from_csv(path) {
        Ok(da) => da.clip_to_day(grid.day_start, grid.day_end),
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    };
    if day_ahead.is_empty() {
        eprintln!(
            "error: \"{}\" holds no day-ahead blocks inside the configured day",
            path.display()
        );
        process::exit(1);
    }
    day_ahead
}

/// Builds the tick log, discarding any stale file from a previous run.
fn fresh_log(cfg: &EmsConfig) -> TickLog {
    let log_dir = Path::new(&cfg.tracking.log_dir);
    if let Err(e) = std::fs::create_dir_all(log_dir) {
        eprintln!("error: cannot create log dir \"{}\": {e}", log_dir.display());
        process::exit(1);
    }
    let path = log_dir.join("online_mpc_results.csv");
    if path.exists()
        && let Err(e) = std::fs::remove_file(&path)
    {
        eprintln!("error: cannot reset \"{}\": {e}", path.display());
        process::exit(1);
    }
    TickLog::new(path)
}

/// Replays the whole day back to back and prints the tracking summary.
fn run_replay<C: Controller>(
    cfg: &EmsConfig,
    controller: C,
    day_ahead: DayAhead,
    source: ReplaySource,
) {
    let grid = TimeGrid::from_config(&cfg.time);
    let dt_hours = grid.dt_hours();
    let battery = BatteryModel::new(cfg.battery.to_params());
    let log = fresh_log(cfg);
    let log_path = log.path().to_path_buf();
    let mut control_loop = ControlLoop::new(grid, battery, controller, source, day_ahead, log);
    let records = control_loop.run_day();
    let summary = TrackingSummary::from_records(&records, dt_hours);
    println!("{summary}");
    println!("Tick log: {}", log_path.display());
}

/// Runs the day against the wall clock, sleeping to each tick boundary.
fn run_online<C: Controller, S: InputSource>(
    cfg: &EmsConfig,
    controller: C,
    day_ahead: DayAhead,
    source: S,
) {
    let grid = TimeGrid::from_config(&cfg.time);
    let dt_hours = grid.dt_hours();
    let battery = BatteryModel::new(cfg.battery.to_params());
    let ticks: Vec<_> = grid.ticks().collect();
    let mut control_loop =
        ControlLoop::new(grid, battery, controller, source, day_ahead, fresh_log(cfg));

    let mut records = Vec::with_capacity(ticks.len());
    for t_now in ticks {
        sleep_until(t_now);
        match control_loop.tick(t_now) {
            Ok(record) => records.push(record),
            Err(e) => warn!(%t_now, "tick skipped: {e}"),
        }
    }
    let summary = TrackingSummary::from_records(&records, dt_hours);
    println!("{summary}");
}

/// Sleeps until the wall clock reaches `t`; returns immediately when `t`
/// is already past (catch-up after a slow tick).
fn sleep_until(t: chrono::NaiveDateTime) {
    let now = chrono::Local::now().naive_local();
    if t > now
        && let Ok(wait) = (t - now).to_std()
    {
        std::thread::sleep(wait);
    }
}

fn settle_revenue(cfg: &EmsConfig, input: &Path, out: Option<&Path>) {
    let inputs = match revenue::read_intervals(input, &cfg.tariff) {
        Ok(inputs) => inputs,
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    };
    let settled = revenue::settle_intervals(&inputs);
    let default_out = Path::new(&cfg.tracking.log_dir).join("revenue_results.csv");
    let out = out.unwrap_or(&default_out);
    if let Some(parent) = out.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Err(e) = revenue::write_results(out, &settled) {
        eprintln!("error: cannot write \"{}\": {e}", out.display());
        process::exit(1);
    }
    println!(
        "Settled {} of {} blocks, total payment {:.2}",
        settled.len(),
        inputs.len(),
        revenue::total_payment(&settled)
    );
    println!("Results written to {}", out.display());
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = parse_args();

    let cfg = match cli.config_path {
        Some(ref path) => match EmsConfig::from_toml_file(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("{e}");
                process::exit(1);
            }
        },
        None => EmsConfig::default(),
    };

    let errors = cfg.validate();
    if !errors.is_empty() {
        for e in &errors {
            eprintln!("{e}");
        }
        process::exit(1);
    }
    if cfg.tracking.save_plots {
        info!("tracking.save_plots is set; plot rendering is left to external tooling");
    }

    let grid = TimeGrid::from_config(&cfg.time);

    if cli.gen_inputs {
        let params = MimicParams {
            seed: cli.seed_override.unwrap_or(MimicParams::default().seed),
            ..MimicParams::default()
        };
        match StreamMimic::new(params).generate_day(&cli.data_dir, &grid) {
            Ok(files) => {
                println!("Synthetic day written under {}", cli.data_dir.display());
                println!("  day-ahead: {}", files.day_ahead.display());
                println!("  forecast:  {}", files.forecast_day.display());
                println!("  actuals:   {}", files.actual_day.display());
            }
            Err(e) => {
                eprintln!("error: input generation failed: {e}");
                process::exit(1);
            }
        }
        return;
    }

    if let Some(ref input) = cli.revenue_input {
        settle_revenue(&cfg, input, cli.out.as_deref());
        return;
    }

    let inbox = InboxSource::new(cli.data_dir.clone(), cfg.time.dt_minutes_rtu);
    let day_ahead_path = cli
        .day_ahead
        .clone()
        .unwrap_or_else(|| inbox.day_ahead_path(grid.day_start));
    let day_ahead = load_day_ahead(&day_ahead_path, &grid);

    if cli.replay {
        let forecast_path = cli
            .forecast
            .clone()
            .unwrap_or_else(|| cli.data_dir.join("forecast_day.csv"));
        let actual_path = cli
            .actual
            .clone()
            .unwrap_or_else(|| cli.data_dir.join("actual_day.csv"));
        let forecast = match read_forecast(&forecast_path) {
            Ok(samples) => samples,
            Err(e) => {
                eprintln!("error: {e}");
                process::exit(1);
            }
        };
        // Actuals are optional in replay just as they are online.
        let actual = read_actual(&actual_path).unwrap_or_default();
        let source = ReplaySource::new(forecast, actual, cfg.time.dt_minutes_rtu);

        if cfg.mpc.use_qp {
            let controller = QpController::new(
                cfg.mpc.qp_weights.clone(),
                cfg.time.ramp_rate_kw_per_step,
                cfg.time.mpc_horizon_steps,
            );
            run_replay(&cfg, controller, day_ahead, source);
        } else {
            let controller = HeuristicController::new(
                cfg.time.ramp_rate_kw_per_step,
                cfg.mpc.terminal_soc_soft_weight,
            );
            run_replay(&cfg, controller, day_ahead, source);
        }
        return;
    }

    if cfg.mpc.use_qp {
        let controller = QpController::new(
            cfg.mpc.qp_weights.clone(),
            cfg.time.ramp_rate_kw_per_step,
            cfg.time.mpc_horizon_steps,
        );
        run_online(&cfg, controller, day_ahead, inbox);
    } else {
        let controller = HeuristicController::new(
            cfg.time.ramp_rate_kw_per_step,
            cfg.mpc.terminal_soc_soft_weight,
        );
        run_online(&cfg, controller, day_ahead, inbox);
    }
}
