//! Image preparation for display: decimation, orientation, flat-field
//! correction, level computation, histogram and frame rate bookkeeping.

use ndarray::{s, Array2};
use std::time::{Duration, Instant};

use super::frame::{Frame, PixelType};

pub const HISTOGRAM_BINS: usize = 64;
pub const LOW_PERCENTILE: f64 = 0.5;
pub const HIGH_PERCENTILE: f64 = 99.5;
const SAMPLE_TARGET: usize = 512;
const FLAT_FLOOR: f64 = 1e-6;
const MIN_LEVEL_SPAN: f64 = 1e-6;
const FPS_SMOOTHING: f64 = 0.8;

/// Subsampling stride which keeps roughly 512 samples along the longest axis
pub fn sample_step(shape: (usize, usize)) -> usize {
    (shape.0.max(shape.1) / SAMPLE_TARGET).max(1)
}

/// Finite values on a strided grid
pub fn subsample(data: &Array2<f64>) -> Vec<f64> {
    let step = sample_step(data.dim()) as isize;
    data.slice(s![..;step, ..;step])
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .collect()
}

/// Decimation factor when binning is automatic (`display_bin == 0`)
pub fn auto_display_bin(shape: (usize, usize), view: (usize, usize)) -> usize {
    let (h, w) = shape;
    let (vh, vw) = (view.0.max(1), view.1.max(1));
    (h / vh).min(w / vw).max(1)
}

/// Keep every `bin`-th pixel along both axes
pub fn decimate(data: &Array2<f64>, bin: usize) -> Array2<f64> {
    if bin <= 1 {
        return data.clone();
    }
    let bin = bin as isize;
    data.slice(s![..;bin, ..;bin]).to_owned()
}

/// Transpose and flips, applied in that order
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Orientation {
    pub transpose: bool,
    pub flip_h: bool,
    pub flip_v: bool,
}

impl Orientation {
    pub fn is_identity(&self) -> bool {
        !(self.transpose || self.flip_h || self.flip_v)
    }

    pub fn apply(&self, data: Array2<f64>) -> Array2<f64> {
        if self.is_identity() {
            return data;
        }
        let mut view = data.view();
        if self.transpose {
            view = view.reversed_axes();
        }
        if self.flip_h {
            view = view.slice_move(s![.., ..;-1]);
        }
        if self.flip_v {
            view = view.slice_move(s![..;-1, ..]);
        }
        view.as_standard_layout().into_owned()
    }
}

/// Divide by a flat image and rescale by its mean.
///
/// Returns None if the shapes differ or the flat is empty.
pub fn apply_flat_field(frame: &Frame, flat: &Array2<f64>) -> Option<Frame> {
    if frame.shape() != flat.dim() || flat.is_empty() {
        return None;
    }
    let mean = flat.mean()?;
    let mut out = Array2::zeros(frame.shape());
    ndarray::Zip::from(&mut out)
        .and(&frame.data)
        .and(flat)
        .for_each(|o, &v, &f| *o = frame.pixel_type.clip(v / f.max(FLAT_FLOOR) * mean));
    Some(frame.with_data(out))
}

/// Linear interpolated percentile of sorted data, `pct` in [0, 100]
pub fn percentile(sorted: &[f64], pct: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = (pct / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

/// Display levels (black and white points)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Levels {
    pub vmin: f64,
    pub vmax: f64,
}

impl Default for Levels {
    fn default() -> Self {
        Self {
            vmin: 0.0,
            vmax: 1.0,
        }
    }
}

impl Levels {
    /// Levels as entered by a user: a non-increasing pair is widened
    pub fn manual(vmin: f64, vmax: f64) -> Self {
        let vmax = if vmax <= vmin {
            vmin + MIN_LEVEL_SPAN
        } else {
            vmax
        };
        Self { vmin, vmax }
    }

    /// Map a value to 0..=255
    pub fn to_u8(&self, value: f64) -> u8 {
        let span = (self.vmax - self.vmin).max(MIN_LEVEL_SPAN);
        let scaled = ((value - self.vmin) / span * 255.0).clamp(0.0, 255.0);
        if scaled.is_nan() {
            0
        } else {
            scaled.round() as u8
        }
    }
}

/// Robust levels from the 0.5 and 99.5 percentiles of a subsample
pub fn autoscale_levels(data: &Array2<f64>) -> Levels {
    let mut sample = subsample(data);
    if sample.is_empty() {
        return Levels::default();
    }
    sample.sort_by(|a, b| a.total_cmp(b));
    let lo = percentile(&sample, LOW_PERCENTILE).unwrap_or(0.0);
    let hi = percentile(&sample, HIGH_PERCENTILE).unwrap_or(1.0);
    if lo.is_finite() && hi.is_finite() && hi > lo {
        return Levels { vmin: lo, vmax: hi };
    }
    let min = sample[0];
    let max = sample[sample.len() - 1];
    Levels::manual(min, max)
}

/// Range offered by the level sliders for this frame
pub fn slider_range(frame: &Frame) -> (f64, f64) {
    if let Some(range) = frame.pixel_type.integer_range() {
        return range;
    }
    let sample = subsample(&frame.data);
    let min = sample.iter().copied().fold(f64::INFINITY, f64::min);
    let max = sample.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if min.is_finite() && max.is_finite() && max > min {
        (min, max)
    } else {
        (0.0, 1.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    /// bins + 1 edges
    pub edges: Vec<f64>,
    pub counts: Vec<u64>,
}

impl Histogram {
    pub fn centers(&self) -> Vec<f64> {
        self.edges.windows(2).map(|e| 0.5 * (e[0] + e[1])).collect()
    }
}

/// Equal width histogram over the finite range of `values`.
///
/// A constant input gets a unit wide range around the value.
pub fn histogram(values: &[f64], bins: usize) -> Option<Histogram> {
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() || bins == 0 {
        return None;
    }
    let mut lo = finite.iter().copied().fold(f64::INFINITY, f64::min);
    let mut hi = finite.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if hi <= lo {
        lo -= 0.5;
        hi += 0.5;
    }
    let width = (hi - lo) / bins as f64;
    let edges = (0..=bins).map(|i| lo + width * i as f64).collect();
    let mut counts = vec![0u64; bins];
    for v in finite {
        let idx = (((v - lo) / width) as usize).min(bins - 1);
        counts[idx] += 1;
    }
    Some(Histogram { edges, counts })
}

/// Exponentially smoothed frame rate
#[derive(Debug, Clone, Default)]
pub struct FpsMeter {
    last: Option<Instant>,
    fps: Option<f64>,
}

impl FpsMeter {
    /// Register a displayed frame and return the smoothed rate
    pub fn tick(&mut self, now: Instant) -> Option<f64> {
        if let Some(last) = self.last {
            let dt = now.saturating_duration_since(last).as_secs_f64();
            if dt > 0.0 {
                let inst = 1.0 / dt;
                self.fps = Some(match self.fps {
                    Some(old) => FPS_SMOOTHING * old + (1.0 - FPS_SMOOTHING) * inst,
                    None => inst,
                });
            }
        }
        self.last = Some(now);
        self.fps
    }

    pub fn fps(&self) -> Option<f64> {
        self.fps
    }

    pub fn reset(&mut self) {
        self.last = None;
        self.fps = None;
    }
}

/// Minimum spacing between events for a rate limit in Hz; zero means unlimited
fn rate_interval(rate: f64) -> Option<Duration> {
    if rate > 0.0 && rate.is_finite() {
        Some(Duration::from_secs_f64(1.0 / rate))
    } else {
        None
    }
}

#[derive(Debug, Clone)]
pub struct DisplaySettings {
    /// 0 selects automatic decimation
    pub display_bin: usize,
    pub orientation: Orientation,
    pub autoscale: bool,
    /// Autoscale cadence in frames
    pub auto_every: u64,
    /// Redraw limit, 0 for unlimited
    pub max_fps: f64,
    pub hist_fps: f64,
    pub apply_flat: bool,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            display_bin: 0,
            orientation: Orientation::default(),
            autoscale: true,
            auto_every: 10,
            max_fps: 0.0,
            hist_fps: 4.0,
            apply_flat: false,
        }
    }
}

/// Mutable display pipeline state owned by the viewer
#[derive(Debug, Clone, Default)]
pub struct DisplayState {
    pub settings: DisplaySettings,
    levels: Levels,
    frames_since_autoscale: Option<u64>,
    flat: Option<Array2<f64>>,
    last_draw: Option<Instant>,
    last_histogram: Option<Instant>,
    fps: FpsMeter,
}

impl DisplayState {
    pub fn new(settings: DisplaySettings) -> Self {
        Self {
            settings,
            ..Default::default()
        }
    }

    pub fn levels(&self) -> Levels {
        self.levels
    }

    pub fn fps(&self) -> Option<f64> {
        self.fps.fps()
    }

    /// True when a new frame may be drawn under the `max_fps` limit
    pub fn should_draw(&self, now: Instant) -> bool {
        match (rate_interval(self.settings.max_fps), self.last_draw) {
            (Some(interval), Some(last)) => now.saturating_duration_since(last) >= interval,
            _ => true,
        }
    }

    /// Record that a frame was drawn and update the frame rate
    pub fn mark_drawn(&mut self, now: Instant) -> Option<f64> {
        self.last_draw = Some(now);
        self.fps.tick(now)
    }

    /// True (and rearmed) when the histogram is due under the `hist_fps` limit
    pub fn histogram_due(&mut self, now: Instant) -> bool {
        let due = match (rate_interval(self.settings.hist_fps), self.last_histogram) {
            (Some(interval), Some(last)) => now.saturating_duration_since(last) >= interval,
            _ => true,
        };
        if due {
            self.last_histogram = Some(now);
        }
        due
    }

    /// Decimate, orient and flat-field a frame for display
    pub fn prepare(&self, frame: &Frame, view: (usize, usize)) -> Frame {
        let bin = if self.settings.display_bin > 0 {
            self.settings.display_bin
        } else {
            auto_display_bin(frame.shape(), view)
        };
        let data = self.settings.orientation.apply(decimate(&frame.data, bin));
        let prepared = frame.with_data(data);
        if !self.settings.apply_flat {
            return prepared;
        }
        match self.flat.as_ref() {
            Some(flat) => apply_flat_field(&prepared, flat).unwrap_or(prepared),
            None => prepared,
        }
    }

    /// Levels for this frame, recomputed every `auto_every` frames while autoscaling
    pub fn update_levels(&mut self, frame: &Frame) -> Levels {
        if !self.settings.autoscale {
            return self.levels;
        }
        let every = self.settings.auto_every.max(1);
        let recompute = match self.frames_since_autoscale {
            Some(n) => n + 1 >= every,
            None => true,
        };
        if recompute {
            self.levels = autoscale_levels(&frame.data);
            self.frames_since_autoscale = Some(0);
        } else {
            self.frames_since_autoscale = self.frames_since_autoscale.map(|n| n + 1);
        }
        self.levels
    }

    /// Switch to manual levels
    pub fn set_manual_levels(&mut self, vmin: f64, vmax: f64) {
        self.settings.autoscale = false;
        self.levels = Levels::manual(vmin, vmax);
    }

    pub fn set_autoscale(&mut self, enabled: bool) {
        self.settings.autoscale = enabled;
        // force a recompute on the next frame
        self.frames_since_autoscale = None;
    }

    pub fn flat(&self) -> Option<&Array2<f64>> {
        self.flat.as_ref()
    }

    pub fn set_flat(&mut self, flat: Array2<f64>) {
        spdlog::info!("Flat field set with shape {:?}", flat.dim());
        self.flat = Some(flat);
    }

    pub fn clear_flat(&mut self) {
        self.flat = None;
        self.settings.apply_flat = false;
    }
}

/// Map to 8-bit gray using the given levels, row-major
pub fn to_gray8(data: &Array2<f64>, levels: Levels) -> Vec<u8> {
    data.iter().map(|v| levels.to_u8(*v)).collect()
}

/// Image position under a crosshair, in display pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Crosshair {
    pub x: f64,
    pub y: f64,
}

impl Crosshair {
    /// Crosshair at the centre of a (height, width) image
    pub fn centered(shape: (usize, usize)) -> Self {
        Self {
            x: shape.1 as f64 / 2.0,
            y: shape.0 as f64 / 2.0,
        }
    }

    /// Pixel value under the crosshair if it lies inside the image
    pub fn value(&self, data: &Array2<f64>) -> Option<f64> {
        if self.x < 0.0 || self.y < 0.0 {
            return None;
        }
        data.get((self.y as usize, self.x as usize)).copied()
    }
}

/// Default slider bounds for an integer type, used before any frame arrives
pub fn default_range(pixel_type: PixelType) -> (f64, f64) {
    pixel_type.integer_range().unwrap_or((0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_decimation() {
        assert_eq!(auto_display_bin((2048, 2048), (512, 700)), 2);
        assert_eq!(auto_display_bin((100, 100), (512, 512)), 1);
        let data = Array2::from_shape_fn((4, 6), |(r, c)| (r * 10 + c) as f64);
        let out = decimate(&data, 2);
        assert_eq!(out, array![[0.0, 2.0, 4.0], [20.0, 22.0, 24.0]]);
    }

    #[test]
    fn test_orientation_order() {
        let data = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let flip_h = Orientation {
            flip_h: true,
            ..Default::default()
        };
        assert_eq!(flip_h.apply(data.clone()), array![[3.0, 2.0, 1.0], [6.0, 5.0, 4.0]]);
        let all = Orientation {
            transpose: true,
            flip_h: true,
            flip_v: true,
        };
        // transpose -> [[1,4],[2,5],[3,6]], flip_h -> [[4,1],[5,2],[6,3]], flip_v -> rows reversed
        assert_eq!(
            all.apply(data),
            array![[6.0, 3.0], [5.0, 2.0], [4.0, 1.0]]
        );
    }

    #[test]
    fn test_flat_field() {
        let frame = Frame::new(1, 0.0, PixelType::U8, array![[100.0, 200.0], [50.0, 0.0]]);
        let flat = array![[1.0, 2.0], [0.0, 1.0]];
        let out = apply_flat_field(&frame, &flat).unwrap();
        // mean(flat) = 1.0
        assert_eq!(out.data[[0, 0]], 100.0);
        assert_eq!(out.data[[0, 1]], 100.0);
        // divide by floor 1e-6 then clip to u8
        assert_eq!(out.data[[1, 0]], 255.0);
        assert!(apply_flat_field(&frame, &array![[1.0]]).is_none());
    }

    #[test]
    fn test_percentile_and_autoscale() {
        let sorted: Vec<f64> = (0..=100).map(|v| v as f64).collect();
        assert_eq!(percentile(&sorted, 50.0), Some(50.0));
        assert_eq!(percentile(&sorted, 0.5), Some(0.5));
        let data = Array2::from_shape_fn((10, 20), |(r, c)| (r * 20 + c) as f64);
        let levels = autoscale_levels(&data);
        assert!((levels.vmin - 0.995).abs() < 1e-9);
        assert!((levels.vmax - 198.005).abs() < 1e-9);
        let flat = Array2::from_elem((4, 4), 7.0);
        let levels = autoscale_levels(&flat);
        assert_eq!(levels.vmin, 7.0);
        assert!(levels.vmax > levels.vmin);
    }

    #[test]
    fn test_slider_range() {
        let frame = Frame::new(0, 0.0, PixelType::U8, array![[1.0]]);
        assert_eq!(slider_range(&frame), (0.0, 255.0));
        let frame = Frame::new(0, 0.0, PixelType::F32, array![[0.25, 4.0]]);
        assert_eq!(slider_range(&frame), (0.25, 4.0));
        let frame = Frame::new(0, 0.0, PixelType::F32, array![[3.0, 3.0]]);
        assert_eq!(slider_range(&frame), (0.0, 1.0));
    }

    #[test]
    fn test_manual_levels() {
        let mut state = DisplayState::default();
        state.set_manual_levels(10.0, 5.0);
        assert!(!state.settings.autoscale);
        assert_eq!(state.levels().vmin, 10.0);
        assert!((state.levels().vmax - (10.0 + 1e-6)).abs() < 1e-12);
        let frame = Frame::new(0, 0.0, PixelType::U16, array![[0.0, 1000.0]]);
        assert_eq!(state.update_levels(&frame).vmin, 10.0);
    }

    #[test]
    fn test_autoscale_cadence() {
        let mut state = DisplayState::new(DisplaySettings {
            auto_every: 3,
            ..Default::default()
        });
        let a = Frame::new(0, 0.0, PixelType::F64, array![[0.0, 10.0]]);
        let b = Frame::new(1, 0.0, PixelType::F64, array![[100.0, 200.0]]);
        let first = state.update_levels(&a);
        assert_eq!(state.update_levels(&b), first);
        assert_eq!(state.update_levels(&b), first);
        assert!(state.update_levels(&b).vmin >= 100.0);
    }

    #[test]
    fn test_histogram() {
        let h = histogram(&[0.0, 1.0, 2.0, 3.0], 2).unwrap();
        assert_eq!(h.counts, vec![2, 2]);
        assert_eq!(h.edges, vec![0.0, 1.5, 3.0]);
        let h = histogram(&[5.0, 5.0], 4).unwrap();
        assert_eq!(h.counts.iter().sum::<u64>(), 2);
        assert_eq!(h.edges[0], 4.5);
        assert!(histogram(&[f64::NAN], 4).is_none());
    }

    #[test]
    fn test_fps_and_throttle() {
        let start = Instant::now();
        let mut meter = FpsMeter::default();
        assert!(meter.tick(start).is_none());
        let fps = meter.tick(start + Duration::from_millis(100)).unwrap();
        assert!((fps - 10.0).abs() < 1e-6);
        let fps = meter.tick(start + Duration::from_millis(150)).unwrap();
        assert!((fps - (0.8 * 10.0 + 0.2 * 20.0)).abs() < 1e-6);

        let mut state = DisplayState::new(DisplaySettings {
            max_fps: 10.0,
            ..Default::default()
        });
        assert!(state.should_draw(start));
        state.mark_drawn(start);
        assert!(!state.should_draw(start + Duration::from_millis(50)));
        assert!(state.should_draw(start + Duration::from_millis(100)));
    }

    #[test]
    fn test_prepare_with_flat() {
        let mut state = DisplayState::new(DisplaySettings {
            display_bin: 1,
            apply_flat: true,
            ..Default::default()
        });
        let frame = Frame::new(0, 0.0, PixelType::F64, array![[2.0, 4.0]]);
        assert_eq!(state.prepare(&frame, (10, 10)).data, frame.data);
        state.set_flat(array![[1.0, 2.0]]);
        let out = state.prepare(&frame, (10, 10));
        assert_eq!(out.data, array![[3.0, 3.0]]);
        state.clear_flat();
        assert!(state.flat().is_none());
    }

    #[test]
    fn test_crosshair() {
        let data = array![[1.0, 2.0], [3.0, 4.0]];
        let cross = Crosshair::centered(data.dim());
        assert_eq!(cross.value(&data), Some(4.0));
        let outside = Crosshair { x: 5.0, y: 0.0 };
        assert!(outside.value(&data).is_none());
    }
}
