//! # ndviewer
//!
//! Part of the ndviewer crate family.
//!
//! This is the live areaDetector image viewer with a GUI using [egui](https://github.com/emilk/egui).
//!
//! ## Install
//!
//! Use `cargo install --path ./ndviewer`
//!
//! ## Use
//!
//! ```bash
//! ndviewer --pv 13SIM1:image1:
//! ```
//!
//! Run against the built in simulated IOC with `--sim`. The last PV is remembered between
//! sessions.
//!
//! ## Options
//!
//! - `--pv`: Image PV (areaDetector NDStdArrays prefix) to connect to at start
//! - `--max-fps`: Redraw limit, 0 for unlimited
//! - `--hist-fps`: Histogram refresh rate
//! - `--display-bin`: Fixed display decimation, 0 picks one from the window size
//! - `--auto-every`: Recompute autoscale levels every N frames
//! - `--proc-config`: Processing pipeline JSON file
//! - `--no-plugins`: Disable the processing pipeline
//! - `--log-file`, `--log-level`: Log destination and verbosity
//!
//! Beamline tools are selected with `beamline.yaml` in the working directory.

mod app;
mod plot;
mod tools;

use app::ViewerApp;
use clap::{Arg, ArgAction, Command};
use std::path::PathBuf;
use std::sync::Arc;

use libndviewer::bpm::BpmConfig;
use libndviewer::config::ViewerOptions;
use libndviewer::mosaic::ScanConfig;
use libndviewer::pattern::Pattern;
use libndviewer::pv::{CaToolsPv, PvClient, PvValue, SimulatedPv};

const DEFAULT_LOG_FILE: &str = "./ndviewer.log";
const DEFAULT_SIM_PV: &str = "13SIM1:image1:";

fn parse_options() -> ViewerOptions {
    let defaults = ViewerOptions::default();
    let matches = Command::new("ndviewer")
        .about("Live viewer for EPICS areaDetector images")
        .arg(Arg::new("pv").long("pv").help("Image PV to connect to"))
        .arg(
            Arg::new("max-fps")
                .long("max-fps")
                .value_parser(clap::value_parser!(f64))
                .default_value("0")
                .help("Maximum redraw rate, 0 for unlimited"),
        )
        .arg(
            Arg::new("hist-fps")
                .long("hist-fps")
                .value_parser(clap::value_parser!(f64))
                .default_value("4.0")
                .help("Histogram refresh rate"),
        )
        .arg(
            Arg::new("display-bin")
                .long("display-bin")
                .value_parser(clap::value_parser!(usize))
                .default_value("0")
                .help("Display decimation, 0 for automatic"),
        )
        .arg(
            Arg::new("auto-every")
                .long("auto-every")
                .value_parser(clap::value_parser!(u64))
                .default_value("10")
                .help("Recompute autoscale levels every N frames"),
        )
        .arg(
            Arg::new("proc-config")
                .long("proc-config")
                .default_value("pipelines/processors.json")
                .help("Processing pipeline configuration"),
        )
        .arg(
            Arg::new("no-plugins")
                .long("no-plugins")
                .action(ArgAction::SetTrue)
                .help("Disable the processing pipeline"),
        )
        .arg(Arg::new("log-file").long("log-file").help("Path to the log file"))
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .default_value("INFO")
                .help("Log level (TRACE, DEBUG, INFO, WARN, ERROR)"),
        )
        .arg(
            Arg::new("sim")
                .long("sim")
                .action(ArgAction::SetTrue)
                .help("Use the simulated IOC instead of EPICS"),
        )
        .get_matches();

    ViewerOptions {
        pv: matches.get_one::<String>("pv").cloned(),
        max_fps: *matches.get_one::<f64>("max-fps").unwrap_or(&defaults.max_fps),
        hist_fps: *matches.get_one::<f64>("hist-fps").unwrap_or(&defaults.hist_fps),
        display_bin: *matches
            .get_one::<usize>("display-bin")
            .unwrap_or(&defaults.display_bin),
        auto_every: *matches
            .get_one::<u64>("auto-every")
            .unwrap_or(&defaults.auto_every),
        proc_config: matches
            .get_one::<String>("proc-config")
            .map(PathBuf::from)
            .unwrap_or(defaults.proc_config),
        no_plugins: matches.get_flag("no-plugins"),
        log_file: matches.get_one::<String>("log-file").map(PathBuf::from),
        log_level: matches
            .get_one::<String>("log-level")
            .cloned()
            .unwrap_or(defaults.log_level),
        sim: matches.get_flag("sim"),
    }
}

/// Unknown names fall back to info
fn level_filter(level: &str) -> spdlog::LevelFilter {
    let level = match level.to_ascii_lowercase().as_str() {
        "trace" => spdlog::Level::Trace,
        "debug" => spdlog::Level::Debug,
        "warn" | "warning" => spdlog::Level::Warn,
        "error" => spdlog::Level::Error,
        "critical" => spdlog::Level::Critical,
        _ => spdlog::Level::Info,
    };
    spdlog::LevelFilter::MoreSevereEqual(level)
}

/// The simulated IOC: pattern cameras plus the motors and PVs the beamline tools expect
fn simulated_client(pv: Option<&str>) -> SimulatedPv {
    let scan = ScanConfig::default();
    let bpm = BpmConfig::default();
    let mut values = vec![
        (scan.motor_x.clone(), PvValue::Number(0.0)),
        (scan.motor_y.clone(), PvValue::Number(0.0)),
        (bpm.location_pv.clone(), PvValue::Text(bpm.trigger_value.clone())),
        (bpm.beam_current_pv.clone(), PvValue::Number(100.0)),
    ];
    for motor in bpm.motors.iter() {
        values.push((motor.pv.clone(), PvValue::Number(0.0)));
    }
    let mut image_pvs = vec![DEFAULT_SIM_PV, scan.image_pv.as_str(), bpm.image_pv.as_str()];
    if let Some(pv) = pv {
        image_pvs.push(pv);
    }
    SimulatedPv::demo(&image_pvs, Pattern::Circles, values)
}

/// The program entry point
fn main() {
    let mut options = parse_options();
    let log_path = options
        .log_file
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_FILE));

    // Setup logging to a file and the terminal
    let file_sink = Arc::new(
        spdlog::sink::FileSink::builder()
            .path(log_path.clone())
            .formatter(Box::new(spdlog::formatter::PatternFormatter::new(
                spdlog::formatter::pattern!(
                    "[{date_short} {time_short}] - [thread: {tid}] - [{^{level}}] - {payload}{eol}"
                ),
            )))
            .truncate(true)
            .build()
            .unwrap(),
    );
    let stdout_sink = Arc::new(
        spdlog::sink::StdStreamSink::builder()
            .std_stream(spdlog::sink::StdStream::Stdout)
            .build()
            .unwrap(),
    );
    let logger = Arc::new(
        spdlog::Logger::builder()
            .level_filter(level_filter(&options.log_level))
            .flush_level_filter(spdlog::LevelFilter::All)
            .sink(file_sink)
            .sink(stdout_sink)
            .build()
            .unwrap(),
    );
    spdlog::set_default_logger(logger);
    spdlog::info!("Starting ndviewer");

    let client: Arc<dyn PvClient> = if options.sim {
        spdlog::info!("Using the simulated IOC");
        if options.pv.is_none() {
            options.pv = Some(String::from(DEFAULT_SIM_PV));
        }
        Arc::new(simulated_client(options.pv.as_deref()))
    } else {
        Arc::new(CaToolsPv::default())
    };

    let native_options = eframe::NativeOptions {
        viewport: eframe::egui::ViewportBuilder::default()
            .with_title("ndviewer")
            .with_inner_size(eframe::epaint::vec2(1400.0, 900.0))
            .with_min_inner_size(eframe::epaint::vec2(800.0, 600.0)),
        ..Default::default()
    };
    match eframe::run_native(
        "ndviewer",
        native_options,
        Box::new(|cc| Ok(Box::new(ViewerApp::new(cc, options, client, log_path)))),
    ) {
        Ok(()) => (),
        Err(e) => spdlog::error!("Eframe error: {}", e),
    }
}
