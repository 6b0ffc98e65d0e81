use clap::{Arg, ArgAction, ArgMatches, Command};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use indicatif_log_bridge::LogWrapper;
use ndarray::Array2;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use libndviewer::beamline::{BeamlineConfig, BeamlineRegistry};
use libndviewer::bpm::{run_monitor, BpmConfig, BpmEvent};
use libndviewer::frame::{Frame, PixelType};
use libndviewer::imageio::{load_image, save_frame, save_npy, save_text};
use libndviewer::metrics::{compute_all, DEFAULT_BINS};
use libndviewer::mosaic::{run_scan, ScanConfig, SharedCanvas};
use libndviewer::pattern::Pattern;
use libndviewer::pipeline::{ProcessorPipeline, ProcessorRegistry};
use libndviewer::processors::meta_for;
use libndviewer::pv::{CaToolsPv, PvClient, PvValue, SimulatedPv};
use libndviewer::scan_status::{ScanStatus, StatusKind};

fn path_arg() -> Arg {
    Arg::new("path")
        .short('p')
        .long("path")
        .required(true)
        .help("Path to the configuration file")
}

fn sim_arg() -> Arg {
    Arg::new("sim")
        .long("sim")
        .action(ArgAction::SetTrue)
        .help("Use the simulated IOC instead of EPICS")
}

fn config_path(matches: &ArgMatches) -> PathBuf {
    matches
        .get_one::<String>("path")
        .map(PathBuf::from)
        .unwrap_or_default()
}

fn make_client(sim: Option<SimulatedPv>) -> Arc<dyn PvClient> {
    match sim {
        Some(sim) => {
            log::info!("Using the simulated IOC");
            Arc::new(sim)
        }
        None => Arc::new(CaToolsPv::default()),
    }
}

fn new_template(kind: &str, path: &Path) {
    log::info!("Making a template {kind} config at {}...", path.display());
    let result = match kind {
        "scan" => ScanConfig::default().write_config_file(path),
        "bpm" => BpmConfig::default().write_config_file(path),
        _ => BeamlineConfig::default().write_config_file(path),
    };
    match result {
        Ok(()) => log::info!("Done."),
        Err(e) => log::error!("{e}"),
    }
}

fn save_mosaic(path: &Path, mosaic: &Array2<u16>) {
    let result = match path.extension().and_then(|e| e.to_str()) {
        Some("npy") => save_npy(path, mosaic),
        Some("txt") => save_text(path, &mosaic.mapv(f64::from)),
        _ => save_frame(
            path,
            &Frame::from_data(PixelType::U16, mosaic.mapv(f64::from)),
            None,
        ),
    };
    match result {
        Ok(()) => log::info!("Mosaic written to {}", path.display()),
        Err(e) => log::error!("Failed to save mosaic: {e}"),
    }
}

fn scan(matches: &ArgMatches, pb_manager: &MultiProgress) {
    let config_path = config_path(matches);
    log::info!("Loading config from {}...", config_path.display());
    let config = match ScanConfig::read_config_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            log::error!("{e}");
            return;
        }
    };
    let output = matches
        .get_one::<String>("output")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("mosaic.npy"));
    log::info!("Image PV: {}", config.image_pv);
    log::info!("Motors: X {} Y {}", config.motor_x, config.motor_y);
    log::info!(
        "Grid: {} x {} ({} positions), estimated at most {:.1} minutes",
        config.grid_columns(),
        config.y_count,
        config.total_positions(),
        config.estimated_duration().as_secs_f64() / 60.0
    );

    let sim = matches.get_flag("sim").then(|| {
        let mut values = vec![
            (config.motor_x.clone(), PvValue::Number(config.x_start)),
            (config.motor_y.clone(), PvValue::Number(config.y_start)),
        ];
        if let Some(rotation) = config.rotation_pv.as_ref() {
            values.push((rotation.clone(), PvValue::Number(0.0)));
        }
        SimulatedPv::demo(&[config.image_pv.as_str()], Pattern::Circles, values)
    });
    let client = make_client(sim);

    let pb = pb_manager.add(ProgressBar::new(config.total_positions() as u64));
    pb.set_style(
        ProgressStyle::with_template("{msg:10} [{bar:40}] {pos}/{len}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    let (tx, rx) = mpsc::channel::<ScanStatus>();
    let stop = Arc::new(AtomicBool::new(false));
    let canvas = SharedCanvas::default();
    let worker_stop = stop.clone();
    let handle = std::thread::spawn(move || {
        run_scan(&config, client.as_ref(), &worker_stop, &tx, &canvas)
    });

    loop {
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(status) => {
                let msg = match status.kind {
                    StatusKind::Moving => "Moving",
                    StatusKind::Acquiring => "Acquiring",
                    StatusKind::Done => "Done",
                    StatusKind::Failed => "Failed",
                };
                pb.set_message(msg);
                pb.set_position(status.position as u64);
            }
            Err(mpsc::RecvTimeoutError::Timeout) => (),
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
        if handle.is_finished() {
            // drain what is left
            while let Ok(status) = rx.try_recv() {
                pb.set_position(status.position as u64);
            }
            break;
        }
    }
    pb.finish();

    match handle.join() {
        Ok(Ok(mosaic)) => {
            log::info!("Scan complete, mosaic is {} x {}", mosaic.ncols(), mosaic.nrows());
            save_mosaic(&output, &mosaic);
        }
        Ok(Err(e)) => log::error!("Scan failed with error: {e}"),
        Err(_) => log::error!("Failed to join scan task!"),
    }
}

fn describe_event(event: &BpmEvent) {
    match event {
        BpmEvent::Waiting(location) => log::debug!("Waiting, HDF5 location is {location}"),
        BpmEvent::InvalidCurrent => log::warn!("Invalid beam current, skipping measurement"),
        BpmEvent::NoImage => log::warn!("Unable to read image"),
        BpmEvent::Reference {
            intensity,
            beam_current,
        } => log::info!("Reference established: {intensity:.2} (current {beam_current:.3})"),
        BpmEvent::Reading(reading) => log::info!(
            "Intensity {:.2} ({:+.2}% of reference {:.2})",
            reading.intensity,
            reading.change_percent,
            reading.reference
        ),
        BpmEvent::DarkReference(intensity) => {
            log::warn!("Intensity {intensity:.2} too low for a reference, skipping")
        }
        BpmEvent::SkippedLow(change) => {
            log::warn!("Skipping low intensity image ({change:+.2}%)")
        }
        BpmEvent::Correction { reading, moved } => {
            if *moved {
                log::info!(
                    "Intensity dropped {:+.2}%, motors adjusted",
                    reading.change_percent
                );
            } else {
                log::info!(
                    "Intensity dropped {:+.2}%, test mode so motors were not moved",
                    reading.change_percent
                );
            }
        }
        BpmEvent::Error(e) => log::error!("{e}"),
    }
}

fn bpm(matches: &ArgMatches) {
    let config_path = config_path(matches);
    log::info!("Loading config from {}...", config_path.display());
    let config = match BpmConfig::read_config_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            log::error!("{e}");
            return;
        }
    };
    let max_polls = matches.get_one::<usize>("max-polls").copied();
    log::info!("Image PV: {}", config.image_pv);
    log::info!("Threshold: {}%", config.threshold_percent);
    log::info!("Test mode: {}", config.test_mode);

    let sim = matches.get_flag("sim").then(|| {
        let mut values = vec![
            (
                config.location_pv.clone(),
                PvValue::Text(config.trigger_value.clone()),
            ),
            (config.beam_current_pv.clone(), PvValue::Number(100.0)),
        ];
        for motor in config.motors.iter() {
            values.push((motor.pv.clone(), PvValue::Number(0.0)));
        }
        SimulatedPv::demo(&[config.image_pv.as_str()], Pattern::MovingDot, values)
    });
    let client = make_client(sim);

    let (tx, rx) = mpsc::channel::<BpmEvent>();
    let handle = std::thread::spawn(move || {
        let stop = AtomicBool::new(false);
        let reset = AtomicBool::new(false);
        run_monitor(&config, client.as_ref(), &stop, &reset, &tx, max_polls)
    });
    // The loop ends once the worker drops its sender
    for event in rx.iter() {
        describe_event(&event);
    }
    match handle.join() {
        Ok(Ok(())) => log::info!("Beam monitor stopped."),
        Ok(Err(e)) => log::error!("Beam monitor failed with error: {e}"),
        Err(_) => log::error!("Failed to join beam monitor task!"),
    }
}

fn process(matches: &ArgMatches) {
    let proc_config = matches
        .get_one::<String>("proc-config")
        .map(PathBuf::from)
        .unwrap_or_default();
    let outdir = matches
        .get_one::<String>("output")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let inputs: Vec<PathBuf> = matches
        .get_many::<String>("inputs")
        .map(|vals| vals.map(PathBuf::from).collect())
        .unwrap_or_default();
    if let Err(e) = std::fs::create_dir_all(&outdir) {
        log::error!("Could not create output directory {}: {e}", outdir.display());
        return;
    }

    let registry = Arc::new(ProcessorRegistry::with_builtins());
    let mut pipeline = ProcessorPipeline::from_config(&proc_config, registry);
    log::info!(
        "Pipeline from {}: {:?}",
        proc_config.display(),
        pipeline.processor_names()
    );
    let total_size: u64 = inputs
        .iter()
        .filter_map(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .sum();
    log::info!(
        "Processing {} images ({})",
        inputs.len(),
        human_bytes::human_bytes(total_size as f64)
    );

    let mut n_done = 0;
    for input in inputs.iter() {
        let frame = match load_image(input) {
            Ok(f) => f,
            Err(e) => {
                log::error!("Could not load {}: {e}", input.display());
                continue;
            }
        };
        let mut meta = meta_for(&frame);
        let processed = match pipeline.apply(frame, &mut meta) {
            Ok(f) => f,
            Err(e) => {
                log::error!("Processing {} failed: {e}", input.display());
                continue;
            }
        };
        let name = input
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| String::from("frame"));
        let out_path = outdir.join(format!("{name}.npy"));
        match save_npy(&out_path, &processed.data) {
            Ok(()) => n_done += 1,
            Err(e) => log::error!("Could not write {}: {e}", out_path.display()),
        }
    }
    log::info!("Processed {n_done} of {} images.", inputs.len());
}

fn metrics(matches: &ArgMatches) {
    let image_path = matches
        .get_one::<String>("image")
        .map(PathBuf::from)
        .unwrap_or_default();
    let bins = matches
        .get_one::<usize>("bins")
        .copied()
        .unwrap_or(DEFAULT_BINS);
    let frame = match load_image(&image_path) {
        Ok(f) => f,
        Err(e) => {
            log::error!("{e}");
            return;
        }
    };
    let reference = match matches.get_one::<String>("reference") {
        Some(p) => match load_image(Path::new(p)) {
            Ok(f) => Some(f),
            Err(e) => {
                log::error!("{e}");
                return;
            }
        },
        None => None,
    };
    match compute_all(&frame, bins, reference.as_ref()) {
        Ok(metrics) => {
            log::info!("Metrics for {}:", image_path.display());
            for (name, value) in metrics.entries() {
                log::info!("  {name:24} {value:.6}");
            }
        }
        Err(e) => log::error!("{e}"),
    }
}

fn beamlines(matches: &ArgMatches) {
    let config = match matches.get_one::<String>("path") {
        Some(p) => match BeamlineConfig::read_config_file(Path::new(p)) {
            Ok(c) => c,
            Err(e) => {
                log::error!("{e}");
                return;
            }
        },
        None => BeamlineConfig::default(),
    };
    let registry = BeamlineRegistry::with_builtins();
    log::info!("Available beamlines:");
    for name in registry.available_beamlines() {
        log::info!("  {name}");
    }
    log::info!(
        "Active beamline: {}",
        config.active_beamline.as_deref().unwrap_or("None")
    );
    for tool in registry.load(&config) {
        log::info!("  {} - {}", tool.name, tool.description);
    }
}

fn main() {
    // Create a cli
    let matches = Command::new("ndviewer_cli")
        .about("Headless tools of the ndviewer family")
        .arg_required_else_help(true)
        .subcommand(
            Command::new("new-scan")
                .about("Make a template motor scan configuration yaml file")
                .arg(path_arg()),
        )
        .subcommand(
            Command::new("new-bpm")
                .about("Make a template beam monitor configuration yaml file")
                .arg(path_arg()),
        )
        .subcommand(
            Command::new("new-beamline")
                .about("Make a template beamline selection yaml file")
                .arg(path_arg()),
        )
        .subcommand(
            Command::new("scan")
                .about("Run a motor scan and stitch the mosaic")
                .arg(path_arg())
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .default_value("mosaic.npy")
                        .help("Mosaic output (.npy, .txt or .tiff)"),
                )
                .arg(sim_arg()),
        )
        .subcommand(
            Command::new("bpm")
                .about("Run the soft beam position monitor")
                .arg(path_arg())
                .arg(sim_arg())
                .arg(
                    Arg::new("max-polls")
                        .long("max-polls")
                        .value_parser(clap::value_parser!(usize))
                        .help("Stop after this many polls"),
                ),
        )
        .subcommand(
            Command::new("process")
                .about("Run images through a processing pipeline")
                .arg(
                    Arg::new("proc-config")
                        .long("proc-config")
                        .required(true)
                        .help("Pipeline configuration JSON"),
                )
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .default_value(".")
                        .help("Output directory"),
                )
                .arg(
                    Arg::new("inputs")
                        .num_args(1..)
                        .required(true)
                        .help("Input .npy images"),
                ),
        )
        .subcommand(
            Command::new("metrics")
                .about("Compute the information metrics of an image")
                .arg(Arg::new("image").required(true).help("Image (.npy or .txt)"))
                .arg(
                    Arg::new("reference")
                        .long("reference")
                        .help("Reference image for mutual information"),
                )
                .arg(
                    Arg::new("bins")
                        .long("bins")
                        .value_parser(clap::value_parser!(usize))
                        .default_value("256"),
                ),
        )
        .subcommand(
            Command::new("beamlines")
                .about("List beamlines and the tools a configuration loads")
                .arg(
                    Arg::new("path")
                        .short('p')
                        .long("path")
                        .help("Beamline selection yaml file"),
                ),
        )
        .get_matches();

    // Initialize feedback
    let logger = simplelog::TermLogger::new(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    let pb_manager = MultiProgress::new();

    LogWrapper::new(pb_manager.clone(), logger)
        .try_init()
        .expect("Could not create logging/progress!");

    match matches.subcommand() {
        Some(("new-scan", sub)) => new_template("scan", &config_path(sub)),
        Some(("new-bpm", sub)) => new_template("bpm", &config_path(sub)),
        Some(("new-beamline", sub)) => new_template("beamline", &config_path(sub)),
        Some(("scan", sub)) => scan(sub, &pb_manager),
        Some(("bpm", sub)) => bpm(sub),
        Some(("process", sub)) => process(sub),
        Some(("metrics", sub)) => metrics(sub),
        Some(("beamlines", sub)) => beamlines(sub),
        _ => log::error!("Unknown command"),
    }
}
