use ndarray::Array2;
use serde::{Deserialize, Serialize};

use super::frame::FrameStats;

/// A measurement line between two image points (x = column, y = row)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LineProfile {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineMeasurement {
    pub length_px: f64,
    pub length_um: f64,
    pub length_mm: f64,
    pub dx_px: f64,
    pub dy_px: f64,
    pub dx_um: f64,
    pub dy_um: f64,
    /// Degrees in [0, 360)
    pub angle_deg: f64,
}

/// Sampled intensities along a line with their distance from the start
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileSamples {
    pub positions: Vec<f64>,
    pub values: Vec<f64>,
}

impl ProfileSamples {
    pub fn stats(&self) -> Option<FrameStats> {
        FrameStats::from_values(self.values.iter().copied())
    }
}

/// numpy style linspace including both end points
fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => vec![],
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            (0..n).map(|i| start + step * i as f64).collect()
        }
    }
}

impl LineProfile {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Horizontal line across the middle third of a (height, width) image
    pub fn default_for(shape: (usize, usize)) -> Self {
        let (h, w) = shape;
        Self::new(
            (w / 3) as f64,
            (h / 2) as f64,
            (2 * w / 3) as f64,
            (h / 2) as f64,
        )
    }

    pub fn length(&self) -> f64 {
        (self.x2 - self.x1).hypot(self.y2 - self.y1)
    }

    /// Sample `floor(length)` points along the line, nearest pixel by truncation.
    ///
    /// Returns None for lines shorter than one pixel or an empty image.
    pub fn sample(&self, data: &Array2<f64>) -> Option<ProfileSamples> {
        let (h, w) = data.dim();
        if h == 0 || w == 0 {
            return None;
        }
        let length = self.length();
        let n = length.floor() as usize;
        if n < 1 {
            return None;
        }
        let xs = linspace(self.x1, self.x2, n);
        let ys = linspace(self.y1, self.y2, n);
        let values = xs
            .iter()
            .zip(ys.iter())
            .map(|(x, y)| {
                let col = (x.trunc() as i64).clamp(0, w as i64 - 1) as usize;
                let row = (y.trunc() as i64).clamp(0, h as i64 - 1) as usize;
                data[[row, col]]
            })
            .collect();
        Some(ProfileSamples {
            positions: linspace(0.0, length, n),
            values,
        })
    }

    pub fn measure(&self, pixel_size_um: f64) -> LineMeasurement {
        let dx = self.x2 - self.x1;
        let dy = self.y2 - self.y1;
        let length_px = self.length();
        let length_um = length_px * pixel_size_um;
        let mut angle_deg = dy.atan2(dx).to_degrees();
        if angle_deg < 0.0 {
            angle_deg += 360.0;
        }
        LineMeasurement {
            length_px,
            length_um,
            length_mm: length_um / 1000.0,
            dx_px: dx.abs(),
            dy_px: dy.abs(),
            dx_um: dx.abs() * pixel_size_um,
            dy_um: dy.abs() * pixel_size_um,
            angle_deg,
        }
    }

    /// Text block shown in the line profile window
    pub fn describe(&self, pixel_size_um: f64, samples: Option<&ProfileSamples>) -> String {
        let m = self.measure(pixel_size_um);
        let mut text = format!(
            "Length: {:.1} px = {:.2} µm = {:.4} mm\nΔX: {:.1} px = {:.2} µm\nΔY: {:.1} px = {:.2} µm\nAngle: {:.1}°\nStart: ({:.1}, {:.1})\nEnd: ({:.1}, {:.1})",
            m.length_px,
            m.length_um,
            m.length_mm,
            m.dx_px,
            m.dx_um,
            m.dy_px,
            m.dy_um,
            m.angle_deg,
            self.x1,
            self.y1,
            self.x2,
            self.y2
        );
        if let Some(stats) = samples.and_then(|s| s.stats()) {
            text.push_str(&format!(
                "\n\nPoints: {}\nMin: {:.1}\nMax: {:.1}\nMean: {:.1}\nStd: {:.1}",
                stats.pixels, stats.min, stats.max, stats.mean, stats.std
            ));
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_horizontal_profile() {
        let data = Array2::from_shape_fn((5, 10), |(_, c)| c as f64);
        let line = LineProfile::new(0.0, 2.0, 9.0, 2.0);
        let samples = line.sample(&data).unwrap();
        assert_eq!(samples.values.len(), 9);
        assert_eq!(samples.values[0], 0.0);
        assert_eq!(samples.values[8], 9.0);
        assert_eq!(samples.positions[8], 9.0);
    }

    #[test]
    fn test_clipped_and_short() {
        let data = Array2::from_elem((4, 4), 1.0);
        let line = LineProfile::new(-5.0, 1.0, 10.0, 1.0);
        let samples = line.sample(&data).unwrap();
        assert_eq!(samples.values.len(), 15);
        assert!(samples.values.iter().all(|v| *v == 1.0));
        assert!(LineProfile::new(1.0, 1.0, 1.5, 1.5).sample(&data).is_none());
    }

    #[test]
    fn test_measure() {
        let line = LineProfile::new(0.0, 0.0, 3.0, -4.0);
        let m = line.measure(2.0);
        assert_eq!(m.length_px, 5.0);
        assert_eq!(m.length_um, 10.0);
        assert_eq!(m.length_mm, 0.01);
        assert_eq!(m.dy_px, 4.0);
        assert!((m.angle_deg - (360.0 - 53.130102354)).abs() < 1e-6);
        assert!(line.describe(2.0, None).starts_with("Length: 5.0 px"));
    }

    #[test]
    fn test_default_line() {
        assert_eq!(
            LineProfile::default_for((100, 300)),
            LineProfile::new(100.0, 50.0, 200.0, 50.0)
        );
    }
}
