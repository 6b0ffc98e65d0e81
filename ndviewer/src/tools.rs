use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use eframe::egui::{self, Color32, DragValue, ProgressBar, RichText, TextureHandle};
use egui_plot::{Line, Plot, PlotPoints};
use ndarray::Array2;
use rfd::FileDialog;

use libndviewer::bpm::{run_monitor, BpmConfig, BpmEvent};
use libndviewer::display::autoscale_levels;
use libndviewer::error::{BpmError, ScanError};
use libndviewer::frame::{Frame, PixelType};
use libndviewer::imageio::{save_frame, save_npy};
use libndviewer::metrics::{compute_all, ImageMetrics, MetricsTracker, DEFAULT_BINS};
use libndviewer::mosaic::{fetch_image, run_scan, ScanConfig, ScanMode, SharedCanvas};
use libndviewer::pv::PvClient;
use libndviewer::roi::describe_stats;
use libndviewer::scan_status::{ScanStatus, StatusKind};

use super::plot::{draw_image, update_texture};

const PREVIEW_INTERVAL: Duration = Duration::from_millis(500);
const LOG_LINES: usize = 200;

fn current_dir() -> std::path::PathBuf {
    std::env::current_dir().unwrap_or_default()
}

fn pick_yaml() -> Option<std::path::PathBuf> {
    FileDialog::new()
        .set_directory(current_dir())
        .add_filter("YAML file", &["yaml", "yml"])
        .pick_file()
}

fn save_yaml() -> Option<std::path::PathBuf> {
    FileDialog::new()
        .set_directory(current_dir())
        .add_filter("YAML file", &["yaml", "yml"])
        .save_file()
}

/// Motor scan with live mosaic preview
pub struct MotorScanWindow {
    pub open: bool,
    config: ScanConfig,
    worker: Option<JoinHandle<Result<Array2<u16>, ScanError>>>,
    stop: Arc<AtomicBool>,
    worker_rx: mpsc::Receiver<ScanStatus>,
    worker_tx: mpsc::Sender<ScanStatus>,
    status: ScanStatus,
    canvas: SharedCanvas,
    mosaic: Option<Array2<u16>>,
    texture: Option<TextureHandle>,
    last_preview: Option<Instant>,
    test_image_size: Option<(usize, usize)>,
}

impl MotorScanWindow {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel::<ScanStatus>();
        Self {
            open: false,
            config: ScanConfig::default(),
            worker: None,
            stop: Arc::new(AtomicBool::new(false)),
            worker_rx: rx,
            worker_tx: tx,
            status: ScanStatus::default(),
            canvas: SharedCanvas::default(),
            mosaic: None,
            texture: None,
            last_preview: None,
            test_image_size: None,
        }
    }

    fn start_scan(&mut self, client: Arc<dyn PvClient>) {
        if self.worker.is_some() {
            return;
        }
        self.stop.store(false, Ordering::SeqCst);
        self.status = ScanStatus::new(0, self.config.total_positions(), StatusKind::Moving);
        let config = self.config.clone();
        let stop = self.stop.clone();
        let tx = self.worker_tx.clone();
        let canvas = self.canvas.clone();
        spdlog::info!("Starting motor scan over {} positions", config.total_positions());
        self.worker = Some(std::thread::spawn(move || {
            run_scan(&config, client.as_ref(), &stop, &tx, &canvas)
        }));
    }

    fn poll_messages(&mut self) {
        while let Ok(status) = self.worker_rx.try_recv() {
            self.status = status;
        }
    }

    /// Join a finished worker and show the final mosaic. Returns true if it failed.
    fn join_finished(&mut self, ctx: &egui::Context) -> bool {
        match self.worker.as_ref() {
            Some(worker) if worker.is_finished() => (),
            _ => return false,
        }
        let worker = match self.worker.take() {
            Some(w) => w,
            None => return false,
        };
        match worker.join() {
            Ok(Ok(mosaic)) => {
                spdlog::info!("Motor scan complete, mosaic {:?}", mosaic.dim());
                let data = mosaic.mapv(f64::from);
                update_texture(ctx, &mut self.texture, "mosaic", &data, autoscale_levels(&data));
                self.mosaic = Some(mosaic);
                self.last_preview = None;
                false
            }
            Ok(Err(e)) => {
                spdlog::error!("Motor scan error: {e}");
                self.last_preview = None;
                self.refresh_preview(ctx);
                true
            }
            Err(_) => {
                spdlog::error!("An error occured joining the scan worker!");
                true
            }
        }
    }

    fn refresh_preview(&mut self, ctx: &egui::Context) {
        let now = Instant::now();
        if self
            .last_preview
            .is_some_and(|last| now.duration_since(last) < PREVIEW_INTERVAL)
        {
            return;
        }
        self.last_preview = Some(now);
        let data = match self.canvas.lock().as_ref() {
            Some(c) => c.mapv(f64::from),
            None => return,
        };
        update_texture(ctx, &mut self.texture, "mosaic", &data, autoscale_levels(&data));
    }

    fn test_image(&mut self, ctx: &egui::Context, client: &dyn PvClient) -> bool {
        match fetch_image(client, &self.config.image_pv) {
            Ok(image) => {
                let (h, w) = image.dim();
                self.test_image_size = Some((w, h));
                let data = image.mapv(f64::from);
                update_texture(ctx, &mut self.texture, "mosaic", &data, autoscale_levels(&data));
                *self.canvas.lock() = Some(image);
                false
            }
            Err(e) => {
                spdlog::error!("Failed to acquire test image: {e}");
                true
            }
        }
    }

    fn save_mosaic(&self, path: &Path) -> bool {
        let mosaic = match self.mosaic.as_ref() {
            Some(m) => m,
            None => return false,
        };
        let result = match path.extension().and_then(|e| e.to_str()) {
            Some("npy") => save_npy(path, mosaic),
            _ => save_frame(
                path,
                &Frame::from_data(PixelType::U16, mosaic.mapv(f64::from)),
                None,
            ),
        };
        match result {
            Ok(()) => false,
            Err(e) => {
                spdlog::error!("Could not save mosaic to {}: {e}", path.display());
                true
            }
        }
    }

    fn config_grid(&mut self, ui: &mut egui::Ui) {
        let config = &mut self.config;
        egui::Grid::new("ScanConfigGrid").show(ui, |ui| {
            ui.label("X motor PV");
            ui.text_edit_singleline(&mut config.motor_x);
            ui.end_row();
            ui.label("Y motor PV");
            ui.text_edit_singleline(&mut config.motor_y);
            ui.end_row();
            ui.label("Image PV");
            ui.text_edit_singleline(&mut config.image_pv);
            ui.end_row();

            ui.label("X start / step (mm) / count");
            ui.horizontal(|ui| {
                ui.add(DragValue::new(&mut config.x_start).speed(0.01));
                ui.add(DragValue::new(&mut config.x_step).speed(0.01));
                ui.add(DragValue::new(&mut config.x_count).range(1..=1000));
            });
            ui.end_row();
            ui.label("Y start / step (mm) / count");
            ui.horizontal(|ui| {
                ui.add(DragValue::new(&mut config.y_start).speed(0.01));
                ui.add(DragValue::new(&mut config.y_step).speed(0.01));
                ui.add(DragValue::new(&mut config.y_count).range(1..=1000));
            });
            ui.end_row();

            ui.label("Pixel size (µm)");
            ui.add(DragValue::new(&mut config.pixel_size_um).speed(0.01).range(0.001..=100.0));
            ui.end_row();
            ui.label("Settle time (s)");
            ui.add(DragValue::new(&mut config.settle_time).speed(0.1).range(0.0..=60.0));
            ui.end_row();
            ui.label("Motor tolerance (mm)");
            ui.add(DragValue::new(&mut config.motor_tolerance).speed(0.0001).range(0.0001..=1.0));
            ui.end_row();
            ui.label("Motor timeout (s)");
            ui.add(DragValue::new(&mut config.motor_timeout).speed(0.5).range(1.0..=300.0));
            ui.end_row();
            ui.label("Start from position");
            ui.add(DragValue::new(&mut config.start_from).range(1..=10000));
            ui.end_row();
            ui.label("Border thickness");
            ui.add(DragValue::new(&mut config.border_thickness).range(0..=20));
            ui.end_row();

            ui.label("Mode");
            egui::ComboBox::from_id_salt("ScanMode")
                .selected_text(match config.mode {
                    ScanMode::Standard => "Standard",
                    ScanMode::DoubleFov => "Double FOV (0° + 180°)",
                })
                .show_ui(ui, |ui| {
                    ui.selectable_value(&mut config.mode, ScanMode::Standard, "Standard");
                    ui.selectable_value(
                        &mut config.mode,
                        ScanMode::DoubleFov,
                        "Double FOV (0° + 180°)",
                    );
                });
            ui.end_row();
            if config.mode == ScanMode::DoubleFov {
                ui.label("Rotation PV");
                let rotation = config.rotation_pv.get_or_insert_with(String::new);
                ui.text_edit_singleline(rotation);
                ui.end_row();
            }
        });
    }

    /// Draw the window. Returns true when an error should be reported.
    pub fn ui(&mut self, ctx: &egui::Context, client: &Arc<dyn PvClient>) -> bool {
        let mut error = false;
        self.poll_messages();
        error |= self.join_finished(ctx);
        if self.worker.is_some() {
            self.refresh_preview(ctx);
        }
        let mut open = self.open;
        egui::Window::new("Motor Scan")
            .open(&mut open)
            .default_size([700.0, 600.0])
            .show(ctx, |ui| {
                ui.menu_button("File", |ui| {
                    if ui.button("Open...").clicked() {
                        if let Some(path) = pick_yaml() {
                            match ScanConfig::read_config_file(&path) {
                                Ok(conf) => self.config = conf,
                                Err(e) => spdlog::error!("{}", e),
                            }
                        }
                    }
                    if ui.button("Save...").clicked() {
                        if let Some(path) = save_yaml() {
                            if let Err(e) = self.config.write_config_file(&path) {
                                error = true;
                                spdlog::error!("{}", e);
                            }
                        }
                    }
                });
                ui.separator();
                ui.add_enabled_ui(self.worker.is_none(), |ui| self.config_grid(ui));

                let total = self.config.total_positions();
                ui.label(format!(
                    "Total positions: {total}   Grid: {} x {}   Estimated time: {:.1} minutes",
                    self.config.grid_columns(),
                    self.config.y_count,
                    self.config.estimated_duration().as_secs_f64() / 60.0
                ));
                if let Some((w, h)) = self.test_image_size {
                    let (ho, vo) = self.config.overlap(w, h);
                    let (out_h, out_w) = self.config.canvas_size(w, h);
                    ui.label(format!(
                        "Overlap: H {:.1}%, V {:.1}%   Canvas: {out_w} x {out_h}",
                        ho * 100.0,
                        vo * 100.0
                    ));
                }

                ui.horizontal(|ui| {
                    if ui
                        .add_enabled(self.worker.is_none(), egui::Button::new("Test image"))
                        .clicked()
                    {
                        error |= self.test_image(ctx, client.as_ref());
                    }
                    if ui
                        .add_enabled(self.worker.is_none(), egui::Button::new("Start scan"))
                        .clicked()
                    {
                        match self.config.validate() {
                            Ok(()) => self.start_scan(client.clone()),
                            Err(e) => {
                                error = true;
                                spdlog::error!("{e}");
                            }
                        }
                    }
                    if ui
                        .add_enabled(self.worker.is_some(), egui::Button::new("Stop"))
                        .clicked()
                    {
                        spdlog::info!("Stop requested for motor scan");
                        self.stop.store(true, Ordering::SeqCst);
                    }
                    if ui
                        .add_enabled(self.mosaic.is_some(), egui::Button::new("Save mosaic..."))
                        .clicked()
                    {
                        if let Some(path) = FileDialog::new()
                            .set_directory(current_dir())
                            .add_filter("Image", &["npy", "tif", "tiff", "png", "txt"])
                            .save_file()
                        {
                            error |= self.save_mosaic(&path);
                        }
                    }
                });

                let (text, color) = match self.status.kind {
                    StatusKind::Moving => ("Moving", Color32::BLUE),
                    StatusKind::Acquiring => ("Acquiring", Color32::DARK_GREEN),
                    StatusKind::Done => ("Done", Color32::DARK_GREEN),
                    StatusKind::Failed => ("Failed", Color32::RED),
                };
                ui.add(
                    ProgressBar::new(self.status.progress)
                        .text(format!(
                            "{text} {}/{} - {}%",
                            self.status.position,
                            self.status.total,
                            (self.status.progress * 100.0) as i32
                        ))
                        .fill(color),
                );

                if let Some(texture) = self.texture.as_ref() {
                    let [w, h] = texture.size();
                    Plot::new("MosaicPreview")
                        .data_aspect(1.0)
                        .show_axes(false)
                        .show(ui, |plot_ui| draw_image(plot_ui, texture, w, h));
                }
            });
        self.open = open;
        if self.worker.is_some() {
            ctx.request_repaint_after(Duration::from_millis(200));
        }
        error
    }
}

/// Soft beam position monitor
#[derive(Debug)]
pub struct SoftBpmWindow {
    pub open: bool,
    config: BpmConfig,
    worker: Option<JoinHandle<Result<(), BpmError>>>,
    stop: Arc<AtomicBool>,
    reset: Arc<AtomicBool>,
    worker_rx: mpsc::Receiver<BpmEvent>,
    worker_tx: mpsc::Sender<BpmEvent>,
    started: Instant,
    intensities: Vec<[f64; 2]>,
    status: String,
    log: VecDeque<String>,
}

impl SoftBpmWindow {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel::<BpmEvent>();
        Self {
            open: false,
            config: BpmConfig::default(),
            worker: None,
            stop: Arc::new(AtomicBool::new(false)),
            reset: Arc::new(AtomicBool::new(false)),
            worker_rx: rx,
            worker_tx: tx,
            started: Instant::now(),
            intensities: vec![],
            status: String::from("Stopped"),
            log: VecDeque::new(),
        }
    }

    fn push_log(&mut self, line: String) {
        self.log.push_back(line);
        while self.log.len() > LOG_LINES {
            self.log.pop_front();
        }
    }

    fn start(&mut self, client: Arc<dyn PvClient>) {
        if self.worker.is_some() {
            return;
        }
        self.stop.store(false, Ordering::SeqCst);
        self.reset.store(false, Ordering::SeqCst);
        self.started = Instant::now();
        self.intensities.clear();
        let config = self.config.clone();
        let stop = self.stop.clone();
        let reset = self.reset.clone();
        let tx = self.worker_tx.clone();
        self.status = String::from("Monitoring");
        self.worker = Some(std::thread::spawn(move || {
            run_monitor(&config, client.as_ref(), &stop, &reset, &tx, None)
        }));
    }

    fn stop_worker(&mut self) -> bool {
        self.stop.store(true, Ordering::SeqCst);
        let worker = match self.worker.take() {
            Some(w) => w,
            None => return false,
        };
        self.status = String::from("Stopped");
        match worker.join() {
            Ok(Ok(())) => false,
            Ok(Err(e)) => {
                spdlog::error!("Beam monitor error: {e}");
                true
            }
            Err(_) => {
                spdlog::error!("An error occured joining the beam monitor!");
                true
            }
        }
    }

    fn poll_messages(&mut self) {
        while let Ok(event) = self.worker_rx.try_recv() {
            let elapsed = self.started.elapsed().as_secs_f64();
            let line = match event {
                BpmEvent::Waiting(location) => {
                    self.status = format!("Waiting (HDF5 at: {location})");
                    continue;
                }
                BpmEvent::InvalidCurrent => String::from("Invalid beam current, skipping measurement"),
                BpmEvent::NoImage => String::from("Unable to read image"),
                BpmEvent::Reference {
                    intensity,
                    beam_current,
                } => {
                    self.intensities.push([elapsed, intensity]);
                    format!("Reference established: {intensity:.2} (current {beam_current:.3} mA)")
                }
                BpmEvent::Reading(reading) => {
                    self.intensities.push([elapsed, reading.intensity]);
                    self.status = format!(
                        "Monitoring: {:.2} ({:+.2}%)",
                        reading.intensity, reading.change_percent
                    );
                    continue;
                }
                BpmEvent::DarkReference(intensity) => {
                    format!("Intensity {intensity:.2} too low for a reference, skipping")
                }
                BpmEvent::SkippedLow(change) => {
                    format!("Skipping low intensity image: {change:+.2}%")
                }
                BpmEvent::Correction { reading, moved } => {
                    self.intensities.push([elapsed, reading.intensity]);
                    if moved {
                        format!("Intensity dropped {:+.2}%, motors adjusted", reading.change_percent)
                    } else {
                        format!("Intensity dropped {:+.2}%, motors NOT moved", reading.change_percent)
                    }
                }
                BpmEvent::Error(e) => format!("Error: {e}"),
            };
            self.push_log(line);
        }
    }

    pub fn ui(&mut self, ctx: &egui::Context, client: &Arc<dyn PvClient>) -> bool {
        let mut error = false;
        self.poll_messages();
        if self.worker.as_ref().is_some_and(|w| w.is_finished()) {
            error |= self.stop_worker();
        }
        let mut open = self.open;
        egui::Window::new("Soft BPM")
            .open(&mut open)
            .default_size([600.0, 500.0])
            .show(ctx, |ui| {
                ui.menu_button("File", |ui| {
                    if ui.button("Open...").clicked() {
                        if let Some(path) = pick_yaml() {
                            match BpmConfig::read_config_file(&path) {
                                Ok(conf) => self.config = conf,
                                Err(e) => spdlog::error!("{}", e),
                            }
                        }
                    }
                    if ui.button("Save...").clicked() {
                        if let Some(path) = save_yaml() {
                            if let Err(e) = self.config.write_config_file(&path) {
                                error = true;
                                spdlog::error!("{}", e);
                            }
                        }
                    }
                });
                ui.separator();
                let running = self.worker.is_some();
                ui.add_enabled_ui(!running, |ui| {
                    let config = &mut self.config;
                    egui::Grid::new("BpmConfigGrid").show(ui, |ui| {
                        ui.label("HDF5 location PV");
                        ui.text_edit_singleline(&mut config.location_pv);
                        ui.end_row();
                        ui.label("Image PV");
                        ui.text_edit_singleline(&mut config.image_pv);
                        ui.end_row();
                        ui.label("Beam current PV");
                        ui.text_edit_singleline(&mut config.beam_current_pv);
                        ui.end_row();
                        for (idx, motor) in config.motors.iter_mut().enumerate() {
                            ui.label(format!("Motor {} PV / step", idx + 1));
                            ui.horizontal(|ui| {
                                ui.text_edit_singleline(&mut motor.pv);
                                ui.add(DragValue::new(&mut motor.step).speed(0.001));
                            });
                            ui.end_row();
                        }
                        ui.label("Threshold (%)");
                        ui.add(DragValue::new(&mut config.threshold_percent).range(0.1..=100.0));
                        ui.end_row();
                        ui.label("Poll interval (s)");
                        ui.add(DragValue::new(&mut config.poll_interval).speed(0.1).range(0.1..=60.0));
                        ui.end_row();
                        ui.checkbox(&mut config.test_mode, "Test mode (do not move motors)");
                        ui.end_row();
                    });
                });

                ui.horizontal(|ui| {
                    if ui.add_enabled(!running, egui::Button::new("Start")).clicked() {
                        self.start(client.clone());
                    }
                    if ui.add_enabled(running, egui::Button::new("Stop")).clicked() {
                        error |= self.stop_worker();
                    }
                    if ui.button("Reset reference").clicked() {
                        self.reset.store(true, Ordering::SeqCst);
                        self.push_log(String::from("Reference intensity reset"));
                    }
                });
                ui.label(RichText::new(&self.status).color(Color32::LIGHT_BLUE));

                Plot::new("BpmIntensity").height(180.0).show(ui, |plot_ui| {
                    plot_ui.line(Line::new(PlotPoints::from(self.intensities.clone())));
                });
                egui::ScrollArea::vertical()
                    .max_height(150.0)
                    .stick_to_bottom(true)
                    .show(ui, |ui| {
                        for line in self.log.iter() {
                            ui.label(line);
                        }
                    });
            });
        if !open && self.worker.is_some() {
            error |= self.stop_worker();
        }
        self.open = open;
        if self.worker.is_some() {
            ctx.request_repaint_after(Duration::from_millis(250));
        }
        error
    }
}

/// Information metrics of the live stream
#[derive(Debug)]
pub struct MetricsWindow {
    pub open: bool,
    tracker: MetricsTracker,
    bins: usize,
    /// Seconds between evaluations
    interval: f64,
    reference: Option<Frame>,
    started: Option<Instant>,
    last_update: Option<Instant>,
    last: Option<ImageMetrics>,
    selected: &'static str,
}

impl MetricsWindow {
    pub fn new() -> Self {
        Self {
            open: false,
            tracker: MetricsTracker::default(),
            bins: DEFAULT_BINS,
            interval: 1.0,
            reference: None,
            started: None,
            last_update: None,
            last: None,
            selected: "interest_score",
        }
    }

    /// Evaluate `frame` if the window is open and the update interval elapsed
    pub fn feed(&mut self, frame: &Frame, now: Instant) {
        if !self.open {
            return;
        }
        if self
            .last_update
            .is_some_and(|last| now.duration_since(last).as_secs_f64() < self.interval)
        {
            return;
        }
        self.last_update = Some(now);
        let started = *self.started.get_or_insert(now);
        match compute_all(frame, self.bins, self.reference.as_ref()) {
            Ok(metrics) => {
                self.tracker
                    .record(now.duration_since(started).as_secs_f64(), metrics);
                self.last = Some(metrics);
            }
            Err(e) => spdlog::warn!("Metrics failed for frame {}: {e}", frame.uid),
        }
    }

    pub fn ui(&mut self, ctx: &egui::Context, current: Option<&Frame>) {
        let mut open = self.open;
        egui::Window::new("Image Metrics")
            .open(&mut open)
            .default_size([600.0, 500.0])
            .show(ctx, |ui| {
                ui.horizontal(|ui| {
                    ui.label("Bins");
                    ui.add(DragValue::new(&mut self.bins).range(2..=4096));
                    ui.label("Update every (s)");
                    ui.add(DragValue::new(&mut self.interval).speed(0.1).range(0.1..=60.0));
                });
                ui.horizontal(|ui| {
                    if ui
                        .add_enabled(current.is_some(), egui::Button::new("Set reference"))
                        .clicked()
                    {
                        self.reference = current.cloned();
                    }
                    if ui.button("Clear reference").clicked() {
                        self.reference = None;
                    }
                    if ui.button("Clear history").clicked() {
                        self.tracker.clear();
                        self.started = None;
                        self.last = None;
                    }
                });

                if let Some(metrics) = self.last.as_ref() {
                    egui::Grid::new("MetricsGrid").striped(true).show(ui, |ui| {
                        for (name, value) in metrics.entries() {
                            if ui.selectable_label(self.selected == name, name).clicked() {
                                self.selected = name;
                            }
                            ui.label(format!("{value:.4}"));
                            ui.end_row();
                        }
                    });
                }
                ui.label(format!(
                    "Frames: {}   Interesting (score ≥ {:.2}): {}",
                    self.tracker.frame_count(),
                    self.tracker.threshold,
                    self.tracker.interesting().len()
                ));
                if let Some((index, score)) = self.tracker.best() {
                    ui.label(format!("Best frame: #{} (interest {score:.3})", index + 1));
                }
                ui.label(RichText::new(self.selected).color(Color32::LIGHT_BLUE));
                let series = self.tracker.series(self.selected);
                Plot::new("MetricsHistory").height(180.0).show(ui, |plot_ui| {
                    plot_ui.line(Line::new(PlotPoints::from(series)));
                });
            });
        self.open = open;
    }
}

/// Placeholder tool of the template beamline
#[derive(Debug, Default)]
pub struct ExampleWindow {
    pub open: bool,
}

impl ExampleWindow {
    pub fn ui(&mut self, ctx: &egui::Context, current: Option<&Frame>) {
        egui::Window::new("Example Plugin")
            .open(&mut self.open)
            .show(ctx, |ui| {
                ui.label("Template beamline tool showing the current frame.");
                match current {
                    Some(frame) => {
                        ui.label(format!(
                            "Frame {} ({} x {}, {})",
                            frame.uid,
                            frame.width(),
                            frame.height(),
                            frame.pixel_type.name()
                        ));
                        ui.label(describe_stats(frame.stats().as_ref()));
                    }
                    None => {
                        ui.label("No frame");
                    }
                }
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libndviewer::pattern::Pattern;
    use libndviewer::pv::SimulatedPv;

    #[test]
    fn test_finished_scan_shows_full_mosaic() {
        let ctx = egui::Context::default();
        let client: Arc<dyn PvClient> =
            Arc::new(SimulatedPv::new().with_pattern_image("cam", Pattern::Gradient, 8, 6));
        let mut window = MotorScanWindow::new();
        window.config = ScanConfig {
            motor_x: String::from("mx"),
            motor_y: String::from("my"),
            image_pv: String::from("cam"),
            pixel_size_um: 250.0,
            x_step: 1.0,
            y_step: 1.0,
            x_count: 3,
            y_count: 2,
            settle_time: 0.0,
            motor_timeout: 1.0,
            ..ScanConfig::default()
        };
        window.start_scan(client);
        let start = Instant::now();
        while !window.worker.as_ref().is_some_and(|w| w.is_finished()) {
            assert!(start.elapsed() < Duration::from_secs(10));
            std::thread::sleep(Duration::from_millis(10));
        }
        // A stale preview from early in the scan
        window.last_preview = Some(Instant::now());

        assert!(!window.join_finished(&ctx));
        let (h, w) = window.mosaic.as_ref().unwrap().dim();
        assert_eq!((h, w), (10, 16));
        assert_eq!(window.texture.as_ref().unwrap().size(), [w, h]);
    }
}
