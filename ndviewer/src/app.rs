use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use eframe::egui::{self, Color32, DragValue, RichText, Stroke, TextureHandle};
use egui_plot::{Bar, BarChart, HLine, Line, Plot, PlotPoints, Polygon, Text, VLine};
use rfd::FileDialog;

use libndviewer::accumulate::FrameAccumulator;
use libndviewer::beamline::{BeamlineConfig, BeamlineRegistry, ToolDescriptor, ToolKind};
use libndviewer::config::{PersistedState, ViewerOptions};
use libndviewer::display::{
    auto_display_bin, histogram, slider_range, subsample, Crosshair, DisplaySettings,
    DisplayState, Histogram, HISTOGRAM_BINS,
};
use libndviewer::frame::Frame;
use libndviewer::imageio::{load_npy, save_frame, save_npy};
use libndviewer::line::{LineProfile, ProfileSamples};
use libndviewer::pipeline::{ProcessorPipeline, ProcessorRegistry};
use libndviewer::processors::meta_for;
use libndviewer::pv::PvClient;
use libndviewer::recorder::Recorder;
use libndviewer::roi::{describe_stats, EllipseRoi, RectRoi};
use libndviewer::scalebar::{Corner, ScaleBar};
use libndviewer::subscriber::FrameSubscriber;

use super::plot::{draw_image, from_plot, to_plot, update_texture};
use super::tools::{ExampleWindow, MetricsWindow, MotorScanWindow, SoftBpmWindow};

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const BEAMLINE_CONFIG: &str = "beamline.yaml";
const ELLIPSE_POINTS: usize = 64;

fn render_error_dialog(show: &mut bool, log_path: &Path, ctx: &egui::Context) {
    egui::Window::new("Error").open(show).show(ctx, |ui| {
        ui.label(format!(
            "There was an error! Check the log file {} for more information.",
            log_path.display()
        ))
    });
}

fn current_dir() -> PathBuf {
    std::env::current_dir().unwrap_or_default()
}

fn rect_outline(x: f64, y: f64, w: f64, h: f64, img_h: usize) -> PlotPoints {
    PlotPoints::from(
        [(x, y), (x + w, y), (x + w, y + h), (x, y + h)]
            .iter()
            .map(|(px, py)| {
                let p = to_plot(*px, *py, img_h);
                [p.x, p.y]
            })
            .collect::<Vec<[f64; 2]>>(),
    )
}

fn ellipse_outline(roi: &EllipseRoi, img_h: usize) -> PlotPoints {
    let a = roi.bounds.width / 2.0;
    let b = roi.bounds.height / 2.0;
    let cx = roi.bounds.x + a;
    let cy = roi.bounds.y + b;
    PlotPoints::from(
        (0..ELLIPSE_POINTS)
            .map(|i| {
                let t = i as f64 / ELLIPSE_POINTS as f64 * std::f64::consts::TAU;
                let p = to_plot(cx + a * t.cos(), cy + b * t.sin(), img_h);
                [p.x, p.y]
            })
            .collect::<Vec<[f64; 2]>>(),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClickMode {
    Crosshair,
    LineStart,
    LineEnd,
    RoiCorner,
}

/// Overlays drawn on top of the image
#[derive(Debug)]
struct Overlays {
    crosshair: Option<Crosshair>,
    rect: Option<RectRoi>,
    ellipse: Option<EllipseRoi>,
    line: Option<LineProfile>,
    scalebar: Option<ScaleBar>,
    /// Pixel size in µm used by the line profile
    pixel_size_um: f64,
    click_mode: ClickMode,
}

impl Default for Overlays {
    fn default() -> Self {
        Self {
            crosshair: None,
            rect: None,
            ellipse: None,
            line: None,
            scalebar: None,
            pixel_size_um: 1.0,
            click_mode: ClickMode::Crosshair,
        }
    }
}

/// The viewer, which inherits the eframe::App trait.
///
/// Frames flow from the subscriber through the processing pipeline and the
/// display state into the image texture.
pub struct ViewerApp {
    client: Arc<dyn PvClient>,
    state: PersistedState,
    state_path: Option<PathBuf>,
    log_path: PathBuf,
    pv_input: String,
    subscriber: Option<FrameSubscriber>,
    paused: bool,
    registry: Arc<ProcessorRegistry>,
    pipeline: Option<ProcessorPipeline>,
    display: DisplayState,
    accumulator: FrameAccumulator,
    show_mean: bool,
    recorder: Recorder,
    /// Last processed frame at full resolution
    last_frame: Option<Frame>,
    /// Last frame as drawn (decimated, oriented, flat-fielded)
    shown: Option<Frame>,
    shown_bin: usize,
    texture: Option<TextureHandle>,
    histogram: Option<Histogram>,
    manual_min: f64,
    manual_max: f64,
    view_size: (usize, usize),
    overlays: Overlays,
    profile: Option<ProfileSamples>,
    show_profile_window: bool,
    pointer: Option<(f64, f64)>,
    tools: Vec<ToolDescriptor>,
    motor_scan: MotorScanWindow,
    soft_bpm: SoftBpmWindow,
    example: ExampleWindow,
    metrics: MetricsWindow,
    show_error_window: bool,
}

impl ViewerApp {
    /// Create the application
    pub fn new(
        cc: &eframe::CreationContext<'_>,
        options: ViewerOptions,
        client: Arc<dyn PvClient>,
        log_path: PathBuf,
    ) -> Self {
        let mut visuals = egui::Visuals::dark();
        visuals.override_text_color = Some(Color32::LIGHT_GRAY);
        cc.egui_ctx.set_visuals(visuals);
        cc.egui_ctx.set_theme(egui::Theme::Dark);

        let state_path = match PersistedState::default_path() {
            Ok(p) => Some(p),
            Err(e) => {
                spdlog::warn!("Viewer state will not be saved: {e}");
                None
            }
        };
        let state = match state_path.as_ref() {
            Some(p) => PersistedState::load_or(p, PersistedState::default()),
            None => PersistedState::default(),
        };
        let pv_input = options.pv.clone().unwrap_or_else(|| state.pv_name.clone());

        let registry = Arc::new(ProcessorRegistry::with_builtins());
        let pipeline = if options.no_plugins {
            spdlog::info!("Processing pipeline disabled");
            None
        } else {
            let path = options.resolve_proc_config(&current_dir());
            Some(ProcessorPipeline::load_or_empty(&path, registry.clone()))
        };

        let display = DisplayState::new(DisplaySettings {
            display_bin: options.display_bin,
            auto_every: options.auto_every,
            max_fps: options.max_fps,
            hist_fps: options.hist_fps,
            ..Default::default()
        });

        let beamline_path = current_dir().join(BEAMLINE_CONFIG);
        let beamline_config = if beamline_path.exists() {
            match BeamlineConfig::read_config_file(&beamline_path) {
                Ok(conf) => conf,
                Err(e) => {
                    spdlog::error!("{e}. Using the default beamline.");
                    BeamlineConfig::default()
                }
            }
        } else {
            BeamlineConfig::default()
        };
        let tools = BeamlineRegistry::with_builtins().load(&beamline_config);

        let mut app = ViewerApp {
            client,
            state,
            state_path,
            log_path,
            pv_input,
            subscriber: None,
            paused: false,
            registry,
            pipeline,
            display,
            accumulator: FrameAccumulator::new(),
            show_mean: false,
            recorder: Recorder::new(),
            last_frame: None,
            shown: None,
            shown_bin: 1,
            texture: None,
            histogram: None,
            manual_min: 0.0,
            manual_max: 1.0,
            view_size: (1024, 1024),
            overlays: Overlays::default(),
            profile: None,
            show_profile_window: false,
            pointer: None,
            tools,
            motor_scan: MotorScanWindow::new(),
            soft_bpm: SoftBpmWindow::new(),
            example: ExampleWindow::default(),
            metrics: MetricsWindow::new(),
            show_error_window: false,
        };
        if !app.pv_input.is_empty() {
            app.connect();
        }
        app
    }

    fn connect(&mut self) {
        self.disconnect();
        let pv = self.pv_input.trim().to_string();
        if pv.is_empty() {
            return;
        }
        let mut subscriber = FrameSubscriber::new(&pv, self.client.clone(), POLL_INTERVAL);
        subscriber.start();
        self.subscriber = Some(subscriber);
        self.state.pv_name = pv;
        self.save_state();
    }

    fn disconnect(&mut self) {
        if let Some(mut subscriber) = self.subscriber.take() {
            subscriber.stop();
        }
    }

    fn save_state(&mut self) {
        if let Some(path) = self.state_path.as_ref() {
            if let Err(e) = self.state.save(path) {
                spdlog::error!("Could not save viewer state: {e}");
            }
        }
    }

    /// Pull the newest frame, run it through the pipeline and redraw
    fn poll_frame(&mut self, ctx: &egui::Context) {
        if self.paused {
            return;
        }
        let now = Instant::now();
        if !self.display.should_draw(now) {
            return;
        }
        let frame = match self.subscriber.as_ref().and_then(|s| s.take_latest()) {
            Some(f) => f,
            None => return,
        };
        let frame = match self.pipeline.as_mut() {
            Some(pipeline) => {
                let mut meta = meta_for(&frame);
                match pipeline.apply(frame.clone(), &mut meta) {
                    Ok(processed) => processed,
                    Err(e) => {
                        spdlog::error!("Pipeline failed on frame {}: {e}", frame.uid);
                        frame
                    }
                }
            }
            None => frame,
        };
        let frame = if self.accumulator.add(&frame.data).is_some() {
            let data = if self.show_mean {
                self.accumulator.mean()
            } else {
                self.accumulator.sum().cloned()
            };
            match data {
                Some(data) => frame.with_data(data),
                None => frame,
            }
        } else {
            frame
        };
        self.show_frame(ctx, frame, now, true);
    }

    /// Draw `frame`. Only `fresh` frames are recorded.
    fn show_frame(&mut self, ctx: &egui::Context, frame: Frame, now: Instant, fresh: bool) {
        self.shown_bin = if self.display.settings.display_bin > 0 {
            self.display.settings.display_bin
        } else {
            auto_display_bin(frame.shape(), self.view_size)
        };
        let prepared = self.display.prepare(&frame, self.view_size);
        let levels = self.display.update_levels(&prepared);
        if self.display.settings.autoscale {
            self.manual_min = levels.vmin;
            self.manual_max = levels.vmax;
        }
        update_texture(ctx, &mut self.texture, "frame", &prepared.data, levels);
        if self.display.histogram_due(now) {
            self.histogram = histogram(&subsample(&prepared.data), HISTOGRAM_BINS);
        }
        if let Some(line) = self.overlays.line.as_ref() {
            self.profile = line.sample(&prepared.data);
        }
        if fresh {
            self.recorder.push(&frame);
            self.metrics.feed(&prepared, now);
            self.display.mark_drawn(now);
        }
        self.last_frame = Some(frame);
        self.shown = Some(prepared);
    }

    /// Redraw the last frame after a display setting changed
    fn redraw(&mut self, ctx: &egui::Context) {
        if let Some(frame) = self.last_frame.take() {
            self.show_frame(ctx, frame, Instant::now(), false);
        }
    }

    fn capture_flat(&mut self) {
        let frame = match self.last_frame.as_ref() {
            Some(f) => f,
            None => return,
        };
        let apply = self.display.settings.apply_flat;
        self.display.settings.apply_flat = false;
        let prepared = self.display.prepare(frame, self.view_size);
        self.display.settings.apply_flat = apply;
        self.display.set_flat(prepared.data);
    }

    fn load_flat(&mut self, path: &Path) {
        match load_npy(path) {
            Ok(flat) => self.display.set_flat(flat),
            Err(e) => {
                self.show_error_window = true;
                spdlog::error!("Could not load flat field {}: {e}", path.display());
            }
        }
    }

    fn save_flat(&mut self, path: &Path) {
        if let Some(flat) = self.display.flat() {
            if let Err(e) = save_npy(path, flat) {
                self.show_error_window = true;
                spdlog::error!("Could not save flat field {}: {e}", path.display());
            }
        }
    }

    fn save_current(&mut self, path: &Path) {
        let frame = match self.last_frame.as_ref() {
            Some(f) => f,
            None => return,
        };
        match save_frame(path, frame, Some(self.display.levels())) {
            Ok(()) => spdlog::info!("Saved frame {} to {}", frame.uid, path.display()),
            Err(e) => {
                self.show_error_window = true;
                spdlog::error!("Could not save frame: {e}");
            }
        }
    }

    fn toggle_recording(&mut self) {
        if self.recorder.is_recording() {
            match self.recorder.stop() {
                Ok(n) => spdlog::info!("Recording finished with {n} frames"),
                Err(e) => {
                    self.show_error_window = true;
                    spdlog::error!("Recording failed: {e}");
                }
            }
        } else if let Some(path) = FileDialog::new()
            .set_directory(current_dir())
            .add_filter("TIFF stack", &["tif", "tiff"])
            .save_file()
        {
            if let Err(e) = self.recorder.start(&path) {
                self.show_error_window = true;
                spdlog::error!("{e}");
            }
        }
    }

    fn menu_bar(&mut self, ui: &mut egui::Ui) {
        egui::menu::bar(ui, |ui| {
            ui.menu_button("File", |ui| {
                if ui
                    .add_enabled(self.last_frame.is_some(), egui::Button::new("Save frame..."))
                    .clicked()
                {
                    if let Some(path) = FileDialog::new()
                        .set_directory(current_dir())
                        .add_filter("Image", &["npy", "png", "txt", "tif", "tiff"])
                        .save_file()
                    {
                        self.save_current(&path);
                    }
                    ui.close_menu();
                }
                let record_text = if self.recorder.is_recording() {
                    "Stop recording"
                } else {
                    "Record..."
                };
                if ui.button(record_text).clicked() {
                    self.toggle_recording();
                    ui.close_menu();
                }
            });
            ui.menu_button("Tools", |ui| {
                if ui.button("Line profile").clicked() {
                    self.show_profile_window = true;
                    ui.close_menu();
                }
                if ui.button("Image metrics").clicked() {
                    self.metrics.open = true;
                    ui.close_menu();
                }
                if !self.tools.is_empty() {
                    ui.separator();
                }
                for tool in self.tools.iter() {
                    if ui.button(&tool.name).on_hover_text(&tool.description).clicked() {
                        match tool.kind {
                            ToolKind::MotorScan => self.motor_scan.open = true,
                            ToolKind::SoftBpm => self.soft_bpm.open = true,
                            ToolKind::Example => self.example.open = true,
                        }
                        ui.close_menu();
                    }
                }
            });
        });
        ui.horizontal(|ui| {
            ui.label("PV:");
            let response = ui.text_edit_singleline(&mut self.pv_input);
            let enter = response.lost_focus() && ui.input(|i| i.key_pressed(egui::Key::Enter));
            if ui.button("Connect").clicked() || enter {
                self.connect();
            }
            if ui
                .add_enabled(self.subscriber.is_some(), egui::Button::new("Disconnect"))
                .clicked()
            {
                self.disconnect();
            }
            ui.checkbox(&mut self.paused, "Pause");
            if self.recorder.is_recording() {
                ui.label(
                    RichText::new(format!("● REC {}", self.recorder.frame_count()))
                        .color(Color32::RED),
                );
            }
        });
    }

    fn display_controls(&mut self, ctx: &egui::Context, ui: &mut egui::Ui) {
        let mut changed = false;
        ui.label(RichText::new("Display").color(Color32::LIGHT_BLUE).size(18.0));
        egui::Grid::new("DisplayGrid").show(ui, |ui| {
            let mut autoscale = self.display.settings.autoscale;
            if ui.checkbox(&mut autoscale, "Autoscale").changed() {
                self.display.set_autoscale(autoscale);
                changed = true;
            }
            ui.end_row();

            let (lo, hi) = match self.last_frame.as_ref() {
                Some(frame) => slider_range(frame),
                None => (0.0, 1.0),
            };
            let speed = ((hi - lo) / 1000.0).max(1e-6);
            ui.label("Min");
            let min_changed = ui
                .add(DragValue::new(&mut self.manual_min).speed(speed).range(lo..=hi))
                .changed();
            ui.end_row();
            ui.label("Max");
            let max_changed = ui
                .add(DragValue::new(&mut self.manual_max).speed(speed).range(lo..=hi))
                .changed();
            ui.end_row();
            if min_changed || max_changed {
                self.display
                    .set_manual_levels(self.manual_min, self.manual_max);
                changed = true;
            }

            ui.label("Display bin (0 = auto)");
            changed |= ui
                .add(DragValue::new(&mut self.display.settings.display_bin).range(0..=16))
                .changed();
            ui.end_row();
            let orientation = &mut self.display.settings.orientation;
            changed |= ui.checkbox(&mut orientation.transpose, "Transpose").changed();
            changed |= ui.checkbox(&mut orientation.flip_h, "Flip H").changed();
            changed |= ui.checkbox(&mut orientation.flip_v, "Flip V").changed();
            ui.end_row();
        });

        ui.separator();
        ui.label(RichText::new("Flat field").color(Color32::LIGHT_BLUE).size(18.0));
        ui.horizontal(|ui| {
            if ui
                .add_enabled(self.last_frame.is_some(), egui::Button::new("Capture"))
                .clicked()
            {
                self.capture_flat();
            }
            if ui.button("Load...").clicked() {
                if let Some(path) = FileDialog::new()
                    .set_directory(current_dir())
                    .add_filter("NumPy array", &["npy"])
                    .pick_file()
                {
                    self.load_flat(&path);
                }
            }
            if ui
                .add_enabled(self.display.flat().is_some(), egui::Button::new("Save..."))
                .clicked()
            {
                if let Some(path) = FileDialog::new()
                    .set_directory(current_dir())
                    .add_filter("NumPy array", &["npy"])
                    .save_file()
                {
                    self.save_flat(&path);
                }
            }
            if ui.button("Clear").clicked() {
                self.display.clear_flat();
                changed = true;
            }
        });
        ui.add_enabled_ui(self.display.flat().is_some(), |ui| {
            changed |= ui
                .checkbox(&mut self.display.settings.apply_flat, "Apply flat field")
                .changed();
        });

        ui.separator();
        ui.label(RichText::new("Accumulate").color(Color32::LIGHT_BLUE).size(18.0));
        ui.horizontal(|ui| {
            let mut running = self.accumulator.is_running();
            if ui.checkbox(&mut running, "Sum frames").changed() {
                if running {
                    self.accumulator.start();
                } else {
                    self.accumulator.stop();
                }
            }
            ui.checkbox(&mut self.show_mean, "Mean");
            if ui.button("Reset").clicked() {
                self.accumulator.reset();
            }
            ui.label(format!("{} frames", self.accumulator.count()));
        });
        if self.pipeline.is_some() {
            let control = self.registry.sum_control();
            ui.horizontal(|ui| {
                ui.label("Pipeline sum:");
                if ui.button(if control.is_running() { "Stop" } else { "Start" }).clicked() {
                    if control.is_running() {
                        control.stop();
                    } else {
                        control.start();
                    }
                }
                if ui.button("Reset").clicked() {
                    control.reset();
                }
                ui.label(format!("{} frames", control.count()));
            });
        }
        if changed {
            self.redraw(ctx);
        }
    }

    fn overlay_controls(&mut self, ui: &mut egui::Ui) {
        let shape = self.shown.as_ref().map(|f| f.shape()).unwrap_or((0, 0));
        ui.label(RichText::new("Overlays").color(Color32::LIGHT_BLUE).size(18.0));
        ui.horizontal(|ui| {
            ui.label("Click sets");
            egui::ComboBox::from_id_salt("ClickMode")
                .selected_text(format!("{:?}", self.overlays.click_mode))
                .show_ui(ui, |ui| {
                    for mode in [
                        ClickMode::Crosshair,
                        ClickMode::LineStart,
                        ClickMode::LineEnd,
                        ClickMode::RoiCorner,
                    ] {
                        ui.selectable_value(&mut self.overlays.click_mode, mode, format!("{mode:?}"));
                    }
                });
        });

        let mut crosshair = self.overlays.crosshair.is_some();
        if ui.checkbox(&mut crosshair, "Crosshair").changed() {
            self.overlays.crosshair = crosshair.then(|| Crosshair::centered(shape));
        }

        let mut rect = self.overlays.rect.is_some();
        if ui.checkbox(&mut rect, "Rectangle ROI").changed() {
            self.overlays.rect = rect.then(|| RectRoi::default_for(shape));
        }
        if let Some(roi) = self.overlays.rect.as_mut() {
            ui.horizontal(|ui| {
                ui.add(DragValue::new(&mut roi.x).prefix("x "));
                ui.add(DragValue::new(&mut roi.y).prefix("y "));
                ui.add(DragValue::new(&mut roi.width).prefix("w ").range(1.0..=f64::MAX));
                ui.add(DragValue::new(&mut roi.height).prefix("h ").range(1.0..=f64::MAX));
            });
            let stats = self.shown.as_ref().and_then(|f| roi.stats(&f.data));
            ui.label(describe_stats(stats.as_ref()));
        }

        let mut ellipse = self.overlays.ellipse.is_some();
        if ui.checkbox(&mut ellipse, "Ellipse ROI").changed() {
            self.overlays.ellipse = ellipse.then(|| EllipseRoi::default_for(shape));
        }
        if let Some(roi) = self.overlays.ellipse.as_mut() {
            ui.horizontal(|ui| {
                ui.add(DragValue::new(&mut roi.bounds.x).prefix("x "));
                ui.add(DragValue::new(&mut roi.bounds.y).prefix("y "));
                ui.add(DragValue::new(&mut roi.bounds.width).prefix("w ").range(1.0..=f64::MAX));
                ui.add(DragValue::new(&mut roi.bounds.height).prefix("h ").range(1.0..=f64::MAX));
            });
            let stats = self.shown.as_ref().and_then(|f| roi.stats(&f.data));
            ui.label(describe_stats(stats.as_ref()));
        }

        let mut line = self.overlays.line.is_some();
        if ui.checkbox(&mut line, "Line profile").changed() {
            self.overlays.line = line.then(|| LineProfile::default_for(shape));
            self.show_profile_window = line;
            self.profile = None;
        }

        let mut scalebar = self.overlays.scalebar.is_some();
        if ui.checkbox(&mut scalebar, "Scale bar").changed() {
            self.overlays.scalebar = scalebar.then(ScaleBar::default);
        }
        if let Some(bar) = self.overlays.scalebar.as_mut() {
            egui::Grid::new("ScaleBarGrid").show(ui, |ui| {
                ui.label("Pixel size");
                ui.add(DragValue::new(&mut bar.pixel_size).speed(0.01).range(1e-6..=1e6));
                ui.end_row();
                ui.label("Unit");
                egui::ComboBox::from_id_salt("ScaleBarUnit")
                    .selected_text(bar.unit.clone())
                    .show_ui(ui, |ui| {
                        for unit in ["nm", "µm", "mm"] {
                            ui.selectable_value(&mut bar.unit, unit.to_string(), unit);
                        }
                    });
                ui.end_row();
                ui.label("Corner");
                egui::ComboBox::from_id_salt("ScaleBarCorner")
                    .selected_text(format!("{:?}", bar.corner))
                    .show_ui(ui, |ui| {
                        for corner in [
                            Corner::BottomRight,
                            Corner::BottomLeft,
                            Corner::TopRight,
                            Corner::TopLeft,
                        ] {
                            ui.selectable_value(&mut bar.corner, corner, format!("{corner:?}"));
                        }
                    });
                ui.end_row();
            });
        }
    }

    fn status_panel(&self, ui: &mut egui::Ui) {
        ui.label(RichText::new("Status").color(Color32::LIGHT_BLUE).size(18.0));
        let fps = self
            .display
            .fps()
            .map_or(String::from("-"), |f| format!("{f:.1}"));
        ui.label(format!("FPS: {fps}"));
        if let Some(frame) = self.last_frame.as_ref() {
            ui.label(format!(
                "UID: {}   {} x {}   {}",
                frame.uid,
                frame.width(),
                frame.height(),
                frame.pixel_type.name()
            ));
        }
        if let Some(subscriber) = self.subscriber.as_ref() {
            ui.label(format!(
                "{} ({}), dropped frames: {}",
                subscriber.pv_name(),
                if subscriber.is_running() { "running" } else { "stopped" },
                subscriber.dropped_frames()
            ));
        }
        if let Some(pipeline) = self.pipeline.as_ref() {
            let names = pipeline.processor_names();
            ui.label(if names.is_empty() {
                String::from("Pipeline: none")
            } else {
                format!("Pipeline: {}", names.join(" → "))
            });
        }
        if let (Some((x, y)), Some(shown)) = (self.pointer, self.shown.as_ref()) {
            let value = Crosshair { x, y }.value(&shown.data);
            ui.label(match value {
                Some(v) => format!("({:.0}, {:.0}) = {v:.3}", x.floor(), y.floor()),
                None => format!("({:.0}, {:.0})", x.floor(), y.floor()),
            });
        }
        if let (Some(cross), Some(shown)) = (self.overlays.crosshair, self.shown.as_ref()) {
            if let Some(v) = cross.value(&shown.data) {
                ui.label(format!("Crosshair ({:.0}, {:.0}) = {v:.3}", cross.x, cross.y));
            }
        }
    }

    fn histogram_panel(&self, ui: &mut egui::Ui) {
        let hist = match self.histogram.as_ref() {
            Some(h) => h,
            None => return,
        };
        let width = match (hist.edges.first(), hist.edges.last()) {
            (Some(lo), Some(hi)) if !hist.counts.is_empty() => {
                (hi - lo) / hist.counts.len() as f64
            }
            _ => 1.0,
        };
        let bars: Vec<Bar> = hist
            .centers()
            .into_iter()
            .zip(hist.counts.iter())
            .map(|(x, c)| Bar::new(x, *c as f64).width(width))
            .collect();
        let levels = self.display.levels();
        Plot::new("Histogram")
            .height(120.0)
            .show_axes([true, false])
            .allow_scroll(false)
            .show(ui, |plot_ui| {
                plot_ui.bar_chart(BarChart::new(bars).color(Color32::GRAY));
                plot_ui.vline(VLine::new(levels.vmin).color(Color32::YELLOW));
                plot_ui.vline(VLine::new(levels.vmax).color(Color32::YELLOW));
            });
    }

    fn handle_click(&mut self, x: f64, y: f64) {
        match self.overlays.click_mode {
            ClickMode::Crosshair => self.overlays.crosshair = Some(Crosshair { x, y }),
            ClickMode::LineStart => {
                if let Some(line) = self.overlays.line.as_mut() {
                    line.x1 = x;
                    line.y1 = y;
                }
            }
            ClickMode::LineEnd => {
                if let Some(line) = self.overlays.line.as_mut() {
                    line.x2 = x;
                    line.y2 = y;
                }
            }
            ClickMode::RoiCorner => {
                if let Some(roi) = self.overlays.rect.as_mut() {
                    roi.x = x;
                    roi.y = y;
                }
                if let Some(roi) = self.overlays.ellipse.as_mut() {
                    roi.bounds.x = x;
                    roi.bounds.y = y;
                }
            }
        }
        if let (Some(line), Some(shown)) = (self.overlays.line.as_ref(), self.shown.as_ref()) {
            self.profile = line.sample(&shown.data);
        }
    }

    fn image_panel(&mut self, ui: &mut egui::Ui) {
        let size = ui.available_size();
        self.view_size = (size.y.max(1.0) as usize, size.x.max(1.0) as usize);
        let (texture, shown) = match (self.texture.as_ref(), self.shown.as_ref()) {
            (Some(t), Some(s)) => (t, s),
            _ => {
                ui.centered_and_justified(|ui| ui.label("No image"));
                return;
            }
        };
        let (h, w) = shown.shape();
        let overlays = &self.overlays;
        let bin = self.shown_bin as f64;
        let response = Plot::new("ImagePlot")
            .data_aspect(1.0)
            .show_axes(false)
            .show_grid(false)
            .show(ui, |plot_ui| {
                draw_image(plot_ui, texture, w, h);
                if let Some(cross) = overlays.crosshair {
                    let p = to_plot(cross.x, cross.y, h);
                    plot_ui.hline(HLine::new(p.y).color(Color32::YELLOW));
                    plot_ui.vline(VLine::new(p.x).color(Color32::YELLOW));
                }
                if let Some(roi) = overlays.rect {
                    plot_ui.polygon(
                        Polygon::new(rect_outline(roi.x, roi.y, roi.width, roi.height, h))
                            .stroke(Stroke::new(1.5, Color32::GREEN))
                            .fill_color(Color32::TRANSPARENT),
                    );
                }
                if let Some(roi) = overlays.ellipse {
                    plot_ui.polygon(
                        Polygon::new(ellipse_outline(&roi, h))
                            .stroke(Stroke::new(1.5, Color32::LIGHT_BLUE))
                            .fill_color(Color32::TRANSPARENT),
                    );
                }
                if let Some(line) = overlays.line {
                    let a = to_plot(line.x1, line.y1, h);
                    let b = to_plot(line.x2, line.y2, h);
                    plot_ui.line(
                        Line::new(PlotPoints::from(vec![[a.x, a.y], [b.x, b.y]]))
                            .color(Color32::RED)
                            .width(1.5),
                    );
                }
                if let Some(bar) = overlays.scalebar.as_ref() {
                    let scaled = ScaleBar {
                        pixel_size: bar.pixel_size * bin,
                        ..bar.clone()
                    };
                    let layout = scaled.layout(w, h);
                    plot_ui.polygon(
                        Polygon::new(rect_outline(
                            layout.x,
                            layout.y,
                            layout.width_px,
                            layout.height_px,
                            h,
                        ))
                        .stroke(Stroke::new(1.0, Color32::WHITE))
                        .fill_color(Color32::WHITE),
                    );
                    plot_ui.text(
                        Text::new(to_plot(layout.text_x, layout.text_y, h), layout.label)
                            .color(Color32::WHITE),
                    );
                }
                plot_ui.pointer_coordinate().map(|p| from_plot(p, h))
            });
        let pointer = response.inner;
        self.pointer = pointer;
        if response.response.clicked() {
            if let Some((x, y)) = pointer {
                self.handle_click(x, y);
            }
        }
    }

    fn profile_window(&mut self, ctx: &egui::Context) {
        let mut open = self.show_profile_window;
        let pixel_um = self.overlays.pixel_size_um * self.shown_bin as f64;
        egui::Window::new("Line Profile")
            .open(&mut open)
            .default_size([500.0, 400.0])
            .show(ctx, |ui| {
                let line = match self.overlays.line {
                    Some(l) => l,
                    None => {
                        ui.label("Enable the line profile overlay to measure.");
                        return;
                    }
                };
                ui.horizontal(|ui| {
                    ui.label("Pixel size (µm)");
                    ui.add(
                        DragValue::new(&mut self.overlays.pixel_size_um)
                            .speed(0.01)
                            .range(1e-6..=1e6),
                    );
                });
                ui.label(line.describe(pixel_um, self.profile.as_ref()));
                if let Some(samples) = self.profile.as_ref() {
                    let points: Vec<[f64; 2]> = samples
                        .positions
                        .iter()
                        .zip(samples.values.iter())
                        .map(|(p, v)| [*p, *v])
                        .collect();
                    Plot::new("ProfilePlot").height(200.0).show(ui, |plot_ui| {
                        plot_ui.line(Line::new(PlotPoints::from(points)).color(Color32::RED));
                    });
                }
            });
        self.show_profile_window = open;
    }
}

impl eframe::App for ViewerApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.poll_frame(ctx);
        render_error_dialog(&mut self.show_error_window, &self.log_path, ctx);

        egui::TopBottomPanel::top("TopPanel").show(ctx, |ui| self.menu_bar(ui));
        egui::SidePanel::right("ControlPanel")
            .default_width(320.0)
            .show(ctx, |ui| {
                egui::ScrollArea::vertical().show(ui, |ui| {
                    self.display_controls(ctx, ui);
                    ui.separator();
                    self.overlay_controls(ui);
                    ui.separator();
                    self.histogram_panel(ui);
                    ui.separator();
                    self.status_panel(ui);
                });
            });
        egui::CentralPanel::default().show(ctx, |ui| self.image_panel(ui));

        self.profile_window(ctx);
        let current = self.last_frame.as_ref();
        self.metrics.ui(ctx, current);
        self.example.ui(ctx, current);
        self.show_error_window |= self.motor_scan.ui(ctx, &self.client);
        self.show_error_window |= self.soft_bpm.ui(ctx, &self.client);

        if !self.paused && self.subscriber.is_some() {
            ctx.request_repaint_after(POLL_INTERVAL);
        }
    }
}

impl Drop for ViewerApp {
    fn drop(&mut self) {
        self.disconnect();
        if self.recorder.is_recording() {
            if let Err(e) = self.recorder.stop() {
                spdlog::error!("Recording failed: {e}");
            }
        }
        if !self.pv_input.trim().is_empty() {
            self.state.pv_name = self.pv_input.trim().to_string();
        }
        self.save_state();
        spdlog::info!("Viewer closed");
    }
}
