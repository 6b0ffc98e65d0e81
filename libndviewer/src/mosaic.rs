//! Motor scan over an X/Y grid with live stitching into a mosaic.
//!
//! The X motor walks the columns of the mosaic and the Y motor its rows. Each
//! tile is pasted at `(row = j * eff_h, col = i * eff_w)` where `eff` is the
//! motor step expressed in detector pixels, so neighbouring tiles overlap by
//! `img - eff` pixels and later tiles overwrite earlier ones.
use ndarray::{s, Array2};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;

use super::error::{ConfigError, ScanError};
use super::ntnda::reshape;
use super::pv::{wait_for_motor, PvClient, DEFAULT_MOTOR_POLL};
use super::scan_status::{ScanStatus, StatusKind};

/// Canvas shared between a scan worker and whoever previews it
pub type SharedCanvas = Arc<Mutex<Option<Array2<u16>>>>;

const BETWEEN_MOTORS: Duration = Duration::from_millis(100);
const ROTATION_SETTLE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    /// One grid at the current rotation
    #[default]
    Standard,
    /// The grid is taken at 0° and again at 180°, doubling the mosaic width
    DoubleFov,
}

/// Motor scan job. Serializable to YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub motor_x: String,
    pub motor_y: String,
    pub image_pv: String,
    pub rotation_pv: Option<String>,
    pub pixel_size_um: f64,
    pub x_start: f64,
    pub x_step: f64,
    pub x_count: usize,
    pub y_start: f64,
    pub y_step: f64,
    pub y_count: usize,
    /// Seconds to wait after the motors arrived
    pub settle_time: f64,
    pub motor_tolerance: f64,
    /// Seconds
    pub motor_timeout: f64,
    /// 1-based position to resume a scan from
    pub start_from: usize,
    pub mode: ScanMode,
    pub border_thickness: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            motor_x: String::from("2bmb:m17"),
            motor_y: String::from("2bmHXP:m3"),
            image_pv: String::from("13SIM1:image1:"),
            rotation_pv: None,
            pixel_size_um: 1.0,
            x_start: -0.16,
            x_step: 4.0,
            x_count: 2,
            y_start: 0.0,
            y_step: 1.4,
            y_count: 3,
            settle_time: 5.0,
            motor_tolerance: 0.001,
            motor_timeout: 10.0,
            start_from: 1,
            mode: ScanMode::Standard,
            border_thickness: 3,
        }
    }
}

impl ScanConfig {
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }
        let yaml_str = std::fs::read_to_string(config_path)?;
        Ok(serde_yaml::from_str::<Self>(&yaml_str)?)
    }

    pub fn write_config_file(&self, config_path: &Path) -> Result<(), ConfigError> {
        let yaml_str = serde_yaml::to_string(self)?;
        std::fs::write(config_path, yaml_str)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ScanError> {
        if self.x_count == 0 || self.y_count == 0 {
            return Err(ScanError::InvalidConfig(String::from(
                "x_count and y_count must be at least 1",
            )));
        }
        if self.pixel_size_um.is_nan() || self.pixel_size_um <= 0.0 {
            return Err(ScanError::InvalidConfig(String::from(
                "pixel_size_um must be positive",
            )));
        }
        if !self.x_step.is_finite() || !self.y_step.is_finite() {
            return Err(ScanError::InvalidConfig(String::from(
                "x_step and y_step must be finite",
            )));
        }
        if !self.motor_timeout.is_finite() || !self.settle_time.is_finite() {
            return Err(ScanError::InvalidConfig(String::from(
                "motor_timeout and settle_time must be finite",
            )));
        }
        let (eff_w, eff_h) = self.effective_step();
        if eff_w == 0 || eff_h == 0 {
            return Err(ScanError::InvalidConfig(format!(
                "motor steps of {} x {} mm are smaller than one {} µm pixel",
                self.x_step, self.y_step, self.pixel_size_um
            )));
        }
        if self.mode == ScanMode::DoubleFov && self.rotation_pv.is_none() {
            return Err(ScanError::InvalidConfig(String::from(
                "double_fov mode needs a rotation_pv",
            )));
        }
        Ok(())
    }

    /// Motor steps in detector pixels, `(eff_w, eff_h)`
    pub fn effective_step(&self) -> (usize, usize) {
        let to_px = |step_mm: f64| (step_mm.abs() * 1000.0 / self.pixel_size_um) as usize;
        (to_px(self.x_step), to_px(self.y_step))
    }

    /// Number of tile columns in the mosaic
    pub fn grid_columns(&self) -> usize {
        match self.mode {
            ScanMode::Standard => self.x_count,
            ScanMode::DoubleFov => 2 * self.x_count,
        }
    }

    pub fn total_positions(&self) -> usize {
        self.grid_columns() * self.y_count
    }

    /// Mosaic `(height, width)` for detector images of `img_w` x `img_h`
    pub fn canvas_size(&self, img_w: usize, img_h: usize) -> (usize, usize) {
        let (eff_w, eff_h) = self.effective_step();
        let out_w = eff_w * self.grid_columns().saturating_sub(1) + img_w;
        let out_h = eff_h * self.y_count.saturating_sub(1) + img_h;
        (out_h, out_w)
    }

    /// Fractional `(horizontal, vertical)` overlap of neighbouring tiles
    pub fn overlap(&self, img_w: usize, img_h: usize) -> (f64, f64) {
        let frac = |img_px: usize, step_mm: f64| {
            let img_um = img_px as f64 * self.pixel_size_um;
            if img_um <= 0.0 {
                return 0.0;
            }
            ((img_um - step_mm.abs() * 1000.0) / img_um).max(0.0)
        };
        (frac(img_w, self.x_step), frac(img_h, self.y_step))
    }

    /// Worst case duration: both motors time out at every position
    pub fn estimated_duration(&self) -> Duration {
        let per_position = 2.0 * self.motor_timeout + self.settle_time;
        Duration::try_from_secs_f64((self.total_positions() as f64 * per_position).max(0.0))
            .unwrap_or(Duration::MAX)
    }
}

/// Fetch the current image of `image_pv` as 16-bit data
pub fn fetch_image(client: &dyn PvClient, image_pv: &str) -> Result<Array2<u16>, ScanError> {
    let array = client.get_image(image_pv)?;
    let frame = reshape(&array)
        .map_err(|e| ScanError::PvError(e.into()))?
        .ok_or_else(|| ScanError::NoImage(image_pv.to_string()))?;
    Ok(frame
        .data
        .mapv(|v| if v.is_finite() { v.round().clamp(0.0, 65535.0) as u16 } else { 0 }))
}

/// Copy `tile` into `canvas` at `(row, col)`, clipped to the canvas, and frame it
/// with a `border` pixel wide outline at the tile maximum.
pub fn paste_tile(canvas: &mut Array2<u16>, tile: &Array2<u16>, row: usize, col: usize, border: usize) {
    let (out_h, out_w) = canvas.dim();
    let (img_h, img_w) = tile.dim();
    if row >= out_h || col >= out_w {
        return;
    }
    let end_y = (row + img_h).min(out_h);
    let end_x = (col + img_w).min(out_w);
    let sub = tile.slice(s![..end_y - row, ..end_x - col]);
    let mut region = canvas.slice_mut(s![row..end_y, col..end_x]);
    region.assign(&sub);

    let border_val = sub.iter().copied().max().unwrap_or(u16::MAX);
    let (rows, cols) = region.dim();
    for t in 0..border.min(rows) {
        region.row_mut(t).fill(border_val);
        region.row_mut(rows - 1 - t).fill(border_val);
    }
    for t in 0..border.min(cols) {
        region.column_mut(t).fill(border_val);
        region.column_mut(cols - 1 - t).fill(border_val);
    }
}

fn sleep_secs(seconds: f64) {
    if let Ok(duration) = Duration::try_from_secs_f64(seconds) {
        std::thread::sleep(duration);
    }
}

/// Run a scan described by `config`.
///
/// The mosaic is kept in `canvas` so that it can be previewed while the scan
/// runs and is also returned at the end. Setting `stop` ends the scan after the
/// current position; the partial mosaic is returned.
pub fn run_scan(
    config: &ScanConfig,
    client: &dyn PvClient,
    stop: &AtomicBool,
    tx: &Sender<ScanStatus>,
    canvas: &SharedCanvas,
) -> Result<Array2<u16>, ScanError> {
    match scan(config, client, stop, tx, canvas) {
        Ok(mosaic) => Ok(mosaic),
        Err(e) => {
            spdlog::error!("Scan failed: {e}");
            let _ = tx.send(ScanStatus::new(0, config.total_positions(), StatusKind::Failed));
            Err(e)
        }
    }
}

fn scan(
    config: &ScanConfig,
    client: &dyn PvClient,
    stop: &AtomicBool,
    tx: &Sender<ScanStatus>,
    canvas: &SharedCanvas,
) -> Result<Array2<u16>, ScanError> {
    config.validate()?;
    let total = config.total_positions();
    let timeout = Duration::from_secs_f64(config.motor_timeout.max(0.0));
    tx.send(ScanStatus::new(0, total, StatusKind::Moving))?;

    spdlog::info!(
        "Moving to start position X={:.3}, Y={:.3}",
        config.x_start,
        config.y_start
    );
    client.put_f64(&config.motor_x, config.x_start, Some(timeout))?;
    std::thread::sleep(BETWEEN_MOTORS);
    client.put_f64(&config.motor_y, config.y_start, Some(timeout))?;
    sleep_secs(config.settle_time);

    let test_image = fetch_image(client, &config.image_pv)?;
    let (img_h, img_w) = test_image.dim();
    let (eff_w, eff_h) = config.effective_step();
    let (out_h, out_w) = config.canvas_size(img_w, img_h);
    spdlog::info!(
        "Stitching setup: image {img_w}x{img_h}, step {eff_w}x{eff_h} px, canvas {out_w}x{out_h}"
    );
    *canvas.lock() = Some(Array2::zeros((out_h, out_w)));

    let rotations: Vec<Option<f64>> = match config.mode {
        ScanMode::Standard => vec![None],
        ScanMode::DoubleFov => vec![Some(0.0), Some(180.0)],
    };

    let mut position = 0;
    'passes: for rotation in rotations {
        if let (Some(angle), Some(rotation_pv)) = (rotation, config.rotation_pv.as_ref()) {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            spdlog::info!("Moving rotation to {angle}°");
            client.put_f64(rotation_pv, angle, Some(timeout))?;
            std::thread::sleep(ROTATION_SETTLE);
        }
        for i in 0..config.x_count {
            for j in 0..config.y_count {
                if stop.load(Ordering::Relaxed) {
                    spdlog::warn!("Scan stopped at position {position}/{total}");
                    break 'passes;
                }
                position += 1;
                if position < config.start_from {
                    continue;
                }
                let x_pos = config.x_start + i as f64 * config.x_step;
                let y_pos = config.y_start + j as f64 * config.y_step;
                spdlog::info!(
                    "[{position}/{total}] (X:{}/{}, Y:{}/{}) X={x_pos:.3}, Y={y_pos:.3}",
                    i + 1,
                    config.x_count,
                    j + 1,
                    config.y_count
                );
                tx.send(ScanStatus::new(position - 1, total, StatusKind::Moving))?;

                if let Err(e) = client
                    .put_f64(&config.motor_x, x_pos, None)
                    .and_then(|_| client.put_f64(&config.motor_y, y_pos, None))
                {
                    spdlog::warn!("Error moving motors: {e}");
                }
                let x_ready = wait_for_motor(
                    client,
                    &config.motor_x,
                    x_pos,
                    config.motor_tolerance,
                    timeout,
                    DEFAULT_MOTOR_POLL,
                );
                let y_ready = wait_for_motor(
                    client,
                    &config.motor_y,
                    y_pos,
                    config.motor_tolerance,
                    timeout,
                    DEFAULT_MOTOR_POLL,
                );
                if !(x_ready && y_ready) {
                    spdlog::warn!("Motors did not reach the target position, continuing");
                }
                sleep_secs(config.settle_time);

                tx.send(ScanStatus::new(position - 1, total, StatusKind::Acquiring))?;
                match fetch_image(client, &config.image_pv) {
                    Ok(tile) => {
                        let column = match rotation {
                            Some(angle) if angle >= 180.0 => config.x_count - 1 - i,
                            Some(_) => config.x_count + i,
                            None => i,
                        };
                        let (row, col) = (j * eff_h, column * eff_w);
                        if let Some(mosaic) = canvas.lock().as_mut() {
                            paste_tile(mosaic, &tile, row, col, config.border_thickness);
                        }
                        spdlog::debug!("Placed tile at row {row}, col {col}");
                    }
                    Err(e) => spdlog::warn!("Failed to get image at position {position}: {e}"),
                }
                tx.send(ScanStatus::new(position, total, StatusKind::Acquiring))?;
            }
        }
    }

    spdlog::info!("Scan complete, {position} of {total} positions visited");
    tx.send(ScanStatus::new(position, total, StatusKind::Done))?;
    let mosaic = canvas
        .lock()
        .clone()
        .unwrap_or_else(|| Array2::zeros((out_h, out_w)));
    Ok(mosaic)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pv::{ImageSource, PvValue, SimulatedPv};
    use ndarray::Array2;
    use std::sync::mpsc;

    /// Tiles filled with `1 + column + 10 * row` of the motor grid, plus 100 at 180°
    fn grid_source(size: usize) -> ImageSource {
        Box::new(move |lookup, _| {
            let x = lookup("mx.RBV").unwrap_or(0.0).round();
            let y = lookup("my.RBV").unwrap_or(0.0).round();
            let rot = if lookup("rot.RBV").unwrap_or(0.0) >= 180.0 { 100.0 } else { 0.0 };
            Array2::from_elem((size, size), (1.0 + x + 10.0 * y + rot) as u16)
        })
    }

    fn config(x_count: usize, y_count: usize) -> ScanConfig {
        ScanConfig {
            motor_x: String::from("mx"),
            motor_y: String::from("my"),
            image_pv: String::from("cam"),
            rotation_pv: None,
            pixel_size_um: 250.0,
            x_start: 0.0,
            x_step: 1.0,
            x_count,
            y_start: 0.0,
            y_step: 1.0,
            y_count,
            settle_time: 0.0,
            motor_tolerance: 0.001,
            motor_timeout: 1.0,
            start_from: 1,
            mode: ScanMode::Standard,
            border_thickness: 0,
        }
    }

    fn run(config: &ScanConfig, tile: usize) -> (Array2<u16>, Vec<ScanStatus>) {
        let pv = SimulatedPv::new()
            .with_value("rot", PvValue::Number(0.0))
            .with_image_source("cam", grid_source(tile));
        let (tx, rx) = mpsc::channel();
        let canvas = SharedCanvas::default();
        let mosaic = run_scan(config, &pv, &AtomicBool::new(false), &tx, &canvas).unwrap();
        drop(tx);
        (mosaic, rx.iter().collect())
    }

    #[test]
    fn test_geometry() {
        let config = config(2, 3);
        assert_eq!(config.effective_step(), (4, 4));
        assert_eq!(config.canvas_size(6, 6), (14, 10));
        assert_eq!(config.total_positions(), 6);
        let (h, v) = config.overlap(8, 4);
        assert_eq!(h, 0.5);
        assert_eq!(v, 0.0);

        let double = ScanConfig {
            mode: ScanMode::DoubleFov,
            ..config
        };
        assert_eq!(double.grid_columns(), 4);
        assert!(matches!(double.validate(), Err(ScanError::InvalidConfig(_))));
    }

    #[test]
    fn test_small_step_rejected() {
        let config = ScanConfig {
            x_step: 0.0001,
            ..config(1, 1)
        };
        assert!(matches!(config.validate(), Err(ScanError::InvalidConfig(_))));
    }

    #[test]
    fn test_infinite_times_rejected() {
        let config = ScanConfig {
            motor_timeout: f64::INFINITY,
            ..config(2, 2)
        };
        assert!(matches!(config.validate(), Err(ScanError::InvalidConfig(_))));
        assert_eq!(config.estimated_duration(), Duration::MAX);

        let config = ScanConfig {
            settle_time: f64::NEG_INFINITY,
            ..config(2, 2)
        };
        assert!(matches!(config.validate(), Err(ScanError::InvalidConfig(_))));
    }

    #[test]
    fn test_paste_tile() {
        let tile = Array2::from_shape_fn((4, 4), |(r, c)| (r * 4 + c + 1) as u16);
        let mut canvas = Array2::<u16>::zeros((6, 6));
        paste_tile(&mut canvas, &tile, 2, 2, 1);
        assert_eq!(canvas[[2, 2]], 16);
        assert_eq!(canvas[[5, 3]], 16);
        assert_eq!(canvas[[3, 3]], 6);
        assert_eq!(canvas[[1, 1]], 0);

        let mut canvas = Array2::<u16>::zeros((6, 6));
        paste_tile(&mut canvas, &tile, 4, 4, 0);
        assert_eq!(canvas[[5, 5]], 6);
        paste_tile(&mut canvas, &tile, 6, 0, 0);
        assert_eq!(canvas.iter().filter(|v| **v != 0).count(), 4);
    }

    #[test]
    fn test_standard_scan() {
        let (mosaic, statuses) = run(&config(2, 3), 6);
        assert_eq!(mosaic.dim(), (14, 10));
        assert_eq!(mosaic[[0, 0]], 1);
        assert_eq!(mosaic[[5, 5]], 12);
        assert_eq!(mosaic[[13, 9]], 22);
        let last = statuses.last().unwrap();
        assert_eq!(last.kind, StatusKind::Done);
        assert_eq!(last.position, 6);
    }

    #[test]
    fn test_start_from() {
        let config = ScanConfig {
            start_from: 2,
            ..config(3, 1)
        };
        let (mosaic, _) = run(&config, 4);
        assert_eq!(mosaic.dim(), (4, 12));
        assert_eq!(mosaic[[0, 0]], 0);
        assert_eq!(mosaic[[0, 4]], 2);
        assert_eq!(mosaic[[0, 11]], 3);
    }

    #[test]
    fn test_double_fov() {
        let config = ScanConfig {
            mode: ScanMode::DoubleFov,
            rotation_pv: Some(String::from("rot")),
            ..config(2, 1)
        };
        let (mosaic, statuses) = run(&config, 4);
        assert_eq!(mosaic.dim(), (4, 16));
        let row: Vec<u16> = mosaic.row(0).iter().step_by(4).copied().collect();
        assert_eq!(row, vec![102, 101, 1, 2]);
        assert_eq!(statuses.last().unwrap().position, 4);
    }

    #[test]
    fn test_stop_flag() {
        let pv = SimulatedPv::new().with_image_source("cam", grid_source(4));
        let (tx, rx) = mpsc::channel();
        let canvas = SharedCanvas::default();
        let mosaic = run_scan(&config(2, 2), &pv, &AtomicBool::new(true), &tx, &canvas).unwrap();
        drop(tx);
        assert!(mosaic.iter().all(|v| *v == 0));
        let statuses: Vec<ScanStatus> = rx.iter().collect();
        assert_eq!(statuses.last().unwrap().position, 0);
    }

    #[test]
    fn test_missing_image_fails() {
        let pv = SimulatedPv::new();
        let (tx, rx) = mpsc::channel();
        let result = run_scan(
            &config(1, 1),
            &pv,
            &AtomicBool::new(false),
            &tx,
            &SharedCanvas::default(),
        );
        assert!(matches!(result, Err(ScanError::PvError(_))));
        drop(tx);
        assert_eq!(rx.iter().last().unwrap().kind, StatusKind::Failed);
    }

    #[test]
    fn test_yaml_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.yaml");
        let config = ScanConfig::default();
        config.write_config_file(&path).unwrap();
        assert_eq!(ScanConfig::read_config_file(&path).unwrap(), config);
        assert!(matches!(
            ScanConfig::read_config_file(&dir.path().join("missing.yaml")),
            Err(ConfigError::BadFilePath(_))
        ));
    }
}
