use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// The element type an image was produced with by the detector.
///
/// Pixel data is always held as f64 once it is inside a [`Frame`]; the
/// original type is kept to choose display ranges and clipping bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelType {
    U8,
    I8,
    #[default]
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
}

impl PixelType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::U8 => "uint8",
            Self::I8 => "int8",
            Self::U16 => "uint16",
            Self::I16 => "int16",
            Self::U32 => "uint32",
            Self::I32 => "int32",
            Self::U64 => "uint64",
            Self::I64 => "int64",
            Self::F32 => "float32",
            Self::F64 => "float64",
        }
    }

    /// Inclusive value range of integer types, None for floating point types
    pub fn integer_range(&self) -> Option<(f64, f64)> {
        match self {
            Self::U8 => Some((0.0, u8::MAX as f64)),
            Self::I8 => Some((i8::MIN as f64, i8::MAX as f64)),
            Self::U16 => Some((0.0, u16::MAX as f64)),
            Self::I16 => Some((i16::MIN as f64, i16::MAX as f64)),
            Self::U32 => Some((0.0, u32::MAX as f64)),
            Self::I32 => Some((i32::MIN as f64, i32::MAX as f64)),
            Self::U64 => Some((0.0, u64::MAX as f64)),
            Self::I64 => Some((i64::MIN as f64, i64::MAX as f64)),
            Self::F32 | Self::F64 => None,
        }
    }

    pub fn is_integer(&self) -> bool {
        self.integer_range().is_some()
    }

    /// Clip a value into the range of this type. Float types are untouched.
    pub fn clip(&self, value: f64) -> f64 {
        match self.integer_range() {
            Some((lo, hi)) => value.clamp(lo, hi),
            None => value,
        }
    }
}

/// Summary statistics over the finite values of an image or region
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std: f64,
    pub sum: f64,
    pub pixels: usize,
}

impl FrameStats {
    /// Compute stats ignoring NaN values. Returns None if nothing remains.
    pub fn from_values<I: IntoIterator<Item = f64>>(values: I) -> Option<Self> {
        let values: Vec<f64> = values.into_iter().filter(|v| !v.is_nan()).collect();
        if values.is_empty() {
            return None;
        }
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;
        for v in values.iter() {
            min = min.min(*v);
            max = max.max(*v);
            sum += v;
        }
        let mean = sum / values.len() as f64;
        let variance =
            values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64;
        Some(Self {
            min,
            max,
            mean,
            std: variance.sqrt(),
            sum,
            pixels: values.len(),
        })
    }
}

/// A single 2D image with its acquisition metadata.
///
/// `data` is row-major with shape (height, width).
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub uid: i64,
    pub timestamp: f64,
    pub pixel_type: PixelType,
    pub data: Array2<f64>,
}

impl Frame {
    pub fn new(uid: i64, timestamp: f64, pixel_type: PixelType, data: Array2<f64>) -> Self {
        Self {
            uid,
            timestamp,
            pixel_type,
            data,
        }
    }

    /// Build a frame from data with no acquisition metadata (uid 0, now)
    pub fn from_data(pixel_type: PixelType, data: Array2<f64>) -> Self {
        Self::new(0, now_timestamp(), pixel_type, data)
    }

    pub fn width(&self) -> usize {
        self.data.ncols()
    }

    pub fn height(&self) -> usize {
        self.data.nrows()
    }

    /// (height, width)
    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }

    pub fn stats(&self) -> Option<FrameStats> {
        FrameStats::from_values(self.data.iter().copied())
    }

    /// Same metadata, new pixels
    pub fn with_data(&self, data: Array2<f64>) -> Self {
        Self {
            uid: self.uid,
            timestamp: self.timestamp,
            pixel_type: self.pixel_type,
            data,
        }
    }
}

/// Seconds since the unix epoch
pub fn now_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_integer_ranges() {
        assert_eq!(PixelType::U8.integer_range(), Some((0.0, 255.0)));
        assert_eq!(PixelType::I16.integer_range(), Some((-32768.0, 32767.0)));
        assert_eq!(PixelType::F32.integer_range(), None);
        assert_eq!(PixelType::U16.name(), "uint16");
        assert_eq!(PixelType::U8.clip(300.0), 255.0);
        assert_eq!(PixelType::F64.clip(-3.5), -3.5);
    }

    #[test]
    fn test_stats_ignore_nan() {
        let frame = Frame::new(
            1,
            0.0,
            PixelType::F64,
            array![[1.0, 2.0], [3.0, f64::NAN]],
        );
        let stats = frame.stats().unwrap();
        assert_eq!(stats.pixels, 3);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 3.0);
        assert_eq!(stats.sum, 6.0);
        assert!((stats.mean - 2.0).abs() < 1e-12);
        assert!((stats.std - (2.0f64 / 3.0).sqrt()).abs() < 1e-12);
        assert_eq!(frame.width(), 2);
        assert_eq!(frame.height(), 2);
    }

    #[test]
    fn test_stats_empty() {
        assert!(FrameStats::from_values(vec![f64::NAN]).is_none());
        assert!(FrameStats::from_values(Vec::<f64>::new()).is_none());
    }
}
