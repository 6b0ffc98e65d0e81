use ndarray::{s, Array2};
use serde::{Deserialize, Serialize};

use super::frame::FrameStats;

pub const OUTSIDE_MESSAGE: &str = "ROI outside image bounds";

/// Pixel index bounds of a region after clipping, half open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelBounds {
    pub row0: usize,
    pub row1: usize,
    pub col0: usize,
    pub col1: usize,
}

impl PixelBounds {
    pub fn width(&self) -> usize {
        self.col1 - self.col0
    }

    pub fn height(&self) -> usize {
        self.row1 - self.row0
    }
}

/// An axis aligned rectangle in image pixel coordinates (x = column, y = row)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RectRoi {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl RectRoi {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Centred rectangle a quarter of the image size (at least 2 px)
    pub fn default_for(shape: (usize, usize)) -> Self {
        let (h, w) = shape;
        let rw = (w / 4).max(2);
        let rh = (h / 4).max(2);
        Self::new(
            (w.saturating_sub(rw) / 2) as f64,
            (h.saturating_sub(rh) / 2) as f64,
            rw as f64,
            rh as f64,
        )
    }

    /// Bounds clipped to a (height, width) image, None if nothing overlaps
    pub fn clip(&self, shape: (usize, usize)) -> Option<PixelBounds> {
        let (h, w) = shape;
        let clip_axis = |start: f64, len: f64, limit: usize| -> Option<(usize, usize)> {
            let lo = start.round().max(0.0);
            let hi = (start + len).round().min(limit as f64);
            if !(lo.is_finite() && hi.is_finite()) || hi <= lo {
                return None;
            }
            Some((lo as usize, hi as usize))
        };
        let (col0, col1) = clip_axis(self.x, self.width, w)?;
        let (row0, row1) = clip_axis(self.y, self.height, h)?;
        Some(PixelBounds {
            row0,
            row1,
            col0,
            col1,
        })
    }

    /// Pixels inside the rectangle, row-major
    pub fn extract(&self, data: &Array2<f64>) -> Option<Array2<f64>> {
        let b = self.clip(data.dim())?;
        Some(data.slice(s![b.row0..b.row1, b.col0..b.col1]).to_owned())
    }

    pub fn stats(&self, data: &Array2<f64>) -> Option<FrameStats> {
        let b = self.clip(data.dim())?;
        FrameStats::from_values(
            data.slice(s![b.row0..b.row1, b.col0..b.col1])
                .iter()
                .copied(),
        )
    }
}

/// The ellipse inscribed in a bounding rectangle
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EllipseRoi {
    pub bounds: RectRoi,
}

impl EllipseRoi {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            bounds: RectRoi::new(x, y, width, height),
        }
    }

    pub fn default_for(shape: (usize, usize)) -> Self {
        Self {
            bounds: RectRoi::default_for(shape),
        }
    }

    fn contains(&self, row: usize, col: usize) -> bool {
        let a = self.bounds.width / 2.0;
        let b = self.bounds.height / 2.0;
        if a <= 0.0 || b <= 0.0 {
            return false;
        }
        let cx = self.bounds.x + a;
        let cy = self.bounds.y + b;
        let dx = (col as f64 + 0.5 - cx) / a;
        let dy = (row as f64 + 0.5 - cy) / b;
        dx * dx + dy * dy <= 1.0
    }

    /// Values of the pixels whose centres lie inside the ellipse
    pub fn values(&self, data: &Array2<f64>) -> Option<Vec<f64>> {
        let bounds = self.bounds.clip(data.dim())?;
        let mut values = Vec::new();
        for row in bounds.row0..bounds.row1 {
            for col in bounds.col0..bounds.col1 {
                if self.contains(row, col) {
                    values.push(data[[row, col]]);
                }
            }
        }
        if values.is_empty() {
            None
        } else {
            Some(values)
        }
    }

    pub fn stats(&self, data: &Array2<f64>) -> Option<FrameStats> {
        FrameStats::from_values(self.values(data)?)
    }
}

/// Multi-line stats text shown next to a region
pub fn describe_stats(stats: Option<&FrameStats>) -> String {
    match stats {
        Some(st) => format!(
            "Pixels: {}\nMin: {:.3}\nMax: {:.3}\nMean: {:.3}\nStd: {:.3}\nSum: {:.3}",
            st.pixels, st.min, st.max, st.mean, st.std, st.sum
        ),
        None => String::from(OUTSIDE_MESSAGE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp() -> Array2<f64> {
        Array2::from_shape_fn((8, 8), |(r, c)| (r * 8 + c) as f64)
    }

    #[test]
    fn test_default_roi() {
        let roi = RectRoi::default_for((100, 200));
        assert_eq!(roi, RectRoi::new(75.0, 37.0, 50.0, 25.0));
        let tiny = RectRoi::default_for((4, 4));
        assert_eq!(tiny.width, 2.0);
    }

    #[test]
    fn test_rect_clipping() {
        let data = ramp();
        let roi = RectRoi::new(6.0, -2.0, 5.0, 4.0);
        let region = roi.extract(&data).unwrap();
        assert_eq!(region.dim(), (2, 2));
        let stats = roi.stats(&data).unwrap();
        assert_eq!(stats.pixels, 4);
        assert_eq!(stats.min, 6.0);
        assert_eq!(stats.max, 15.0);

        let outside = RectRoi::new(20.0, 20.0, 5.0, 5.0);
        assert!(outside.stats(&data).is_none());
        assert_eq!(describe_stats(outside.stats(&data).as_ref()), OUTSIDE_MESSAGE);
    }

    #[test]
    fn test_ellipse_mask() {
        let data = Array2::from_elem((10, 10), 1.0);
        let ellipse = EllipseRoi::new(0.0, 0.0, 10.0, 10.0);
        let values = ellipse.values(&data).unwrap();
        // corners excluded, centre included
        assert!(values.len() < 100);
        assert!(values.len() > 60);
        assert!(!ellipse.contains(0, 0));
        assert!(ellipse.contains(5, 5));
        assert_eq!(ellipse.stats(&data).unwrap().mean, 1.0);
        assert!(EllipseRoi::new(50.0, 50.0, 4.0, 4.0).stats(&data).is_none());
    }
}
