//! Decoding of EPICS areaDetector NTNDArray structures into [`Frame`]s.
//!
//! Dimensions follow the areaDetector convention: dimension 0 varies fastest
//! in the flat value array.

use ndarray::Array2;

use super::error::NtndaError;
use super::frame::{now_timestamp, Frame, PixelType};

pub const COLOR_MODE_ATTRIBUTE: &str = "ColorMode";

pub const COLOR_MODE_MONO: i32 = 0;
pub const COLOR_MODE_RGB1: i32 = 2;
pub const COLOR_MODE_RGB2: i32 = 3;
pub const COLOR_MODE_RGB3: i32 = 4;

const LUMA_WEIGHTS: [f64; 3] = [0.2126, 0.7152, 0.0722];

/// The value union of an NTNDArray, one variant per field
#[derive(Debug, Clone, PartialEq)]
pub enum NdValue {
    UByte(Vec<u8>),
    Byte(Vec<i8>),
    UShort(Vec<u16>),
    Short(Vec<i16>),
    UInt(Vec<u32>),
    Int(Vec<i32>),
    ULong(Vec<u64>),
    Long(Vec<i64>),
    Float(Vec<f32>),
    Double(Vec<f64>),
}

impl NdValue {
    pub fn len(&self) -> usize {
        match self {
            Self::UByte(v) => v.len(),
            Self::Byte(v) => v.len(),
            Self::UShort(v) => v.len(),
            Self::Short(v) => v.len(),
            Self::UInt(v) => v.len(),
            Self::Int(v) => v.len(),
            Self::ULong(v) => v.len(),
            Self::Long(v) => v.len(),
            Self::Float(v) => v.len(),
            Self::Double(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Name of the union field this variant corresponds to
    pub fn field_name(&self) -> &'static str {
        match self {
            Self::UByte(_) => "ubyteValue",
            Self::Byte(_) => "byteValue",
            Self::UShort(_) => "ushortValue",
            Self::Short(_) => "shortValue",
            Self::UInt(_) => "uintValue",
            Self::Int(_) => "intValue",
            Self::ULong(_) => "ulongValue",
            Self::Long(_) => "longValue",
            Self::Float(_) => "floatValue",
            Self::Double(_) => "doubleValue",
        }
    }

    pub fn pixel_type(&self) -> PixelType {
        match self {
            Self::UByte(_) => PixelType::U8,
            Self::Byte(_) => PixelType::I8,
            Self::UShort(_) => PixelType::U16,
            Self::Short(_) => PixelType::I16,
            Self::UInt(_) => PixelType::U32,
            Self::Int(_) => PixelType::I32,
            Self::ULong(_) => PixelType::U64,
            Self::Long(_) => PixelType::I64,
            Self::Float(_) => PixelType::F32,
            Self::Double(_) => PixelType::F64,
        }
    }

    pub fn to_f64_vec(&self) -> Vec<f64> {
        match self {
            Self::UByte(v) => v.iter().map(|x| *x as f64).collect(),
            Self::Byte(v) => v.iter().map(|x| *x as f64).collect(),
            Self::UShort(v) => v.iter().map(|x| *x as f64).collect(),
            Self::Short(v) => v.iter().map(|x| *x as f64).collect(),
            Self::UInt(v) => v.iter().map(|x| *x as f64).collect(),
            Self::Int(v) => v.iter().map(|x| *x as f64).collect(),
            Self::ULong(v) => v.iter().map(|x| *x as f64).collect(),
            Self::Long(v) => v.iter().map(|x| *x as f64).collect(),
            Self::Float(v) => v.iter().map(|x| *x as f64).collect(),
            Self::Double(v) => v.clone(),
        }
    }

    /// Build a typed value from f64 samples, casting to the requested type
    pub fn from_f64(pixel_type: PixelType, values: &[f64]) -> Self {
        match pixel_type {
            PixelType::U8 => Self::UByte(values.iter().map(|v| *v as u8).collect()),
            PixelType::I8 => Self::Byte(values.iter().map(|v| *v as i8).collect()),
            PixelType::U16 => Self::UShort(values.iter().map(|v| *v as u16).collect()),
            PixelType::I16 => Self::Short(values.iter().map(|v| *v as i16).collect()),
            PixelType::U32 => Self::UInt(values.iter().map(|v| *v as u32).collect()),
            PixelType::I32 => Self::Int(values.iter().map(|v| *v as i32).collect()),
            PixelType::U64 => Self::ULong(values.iter().map(|v| *v as u64).collect()),
            PixelType::I64 => Self::Long(values.iter().map(|v| *v as i64).collect()),
            PixelType::F32 => Self::Float(values.iter().map(|v| *v as f32).collect()),
            PixelType::F64 => Self::Double(values.to_vec()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NdAttribute {
    pub name: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NtNdArray {
    pub unique_id: i64,
    pub timestamp: f64,
    pub dimensions: Vec<usize>,
    pub attributes: Vec<NdAttribute>,
    pub value: NdValue,
}

impl NtNdArray {
    /// A mono image of width x height with ColorMode 0
    pub fn mono(unique_id: i64, width: usize, height: usize, value: NdValue) -> Self {
        Self {
            unique_id,
            timestamp: now_timestamp(),
            dimensions: vec![width, height],
            attributes: vec![NdAttribute {
                name: String::from(COLOR_MODE_ATTRIBUTE),
                value: COLOR_MODE_MONO as f64,
            }],
            value,
        }
    }

    pub fn color_mode(&self) -> i32 {
        self.attributes
            .iter()
            .find(|attr| attr.name == COLOR_MODE_ATTRIBUTE)
            .map(|attr| attr.value as i32)
            .unwrap_or(COLOR_MODE_MONO)
    }
}

/// Convert an NTNDArray to a 2D frame.
///
/// Color images are reduced to luminance. Returns `Ok(None)` when the array
/// carries no dimensions.
pub fn reshape(array: &NtNdArray) -> Result<Option<Frame>, NtndaError> {
    let dims = &array.dimensions;
    if dims.is_empty() {
        return Ok(None);
    }
    let expected: usize = dims.iter().product();
    if array.value.len() != expected {
        return Err(NtndaError::SizeMismatch(array.value.len(), expected));
    }
    let color_mode = array.color_mode();
    let values = array.value.to_f64_vec();

    let (pixel_type, data) = match (dims.len(), color_mode) {
        (2, COLOR_MODE_MONO) => (
            array.value.pixel_type(),
            Array2::from_shape_vec((dims[1], dims[0]), values)
                .map_err(|_| NtndaError::SizeMismatch(array.value.len(), expected))?,
        ),
        (3, COLOR_MODE_RGB1) | (3, COLOR_MODE_RGB2) | (3, COLOR_MODE_RGB3) => {
            (PixelType::F32, luminance(dims, color_mode, &values)?)
        }
        (3, _) if dims.contains(&1) => {
            let mut sorted = dims.clone();
            sorted.sort_unstable_by(|a, b| b.cmp(a));
            (
                array.value.pixel_type(),
                Array2::from_shape_vec((sorted[0], sorted[1]), values)
                    .map_err(|_| NtndaError::SizeMismatch(array.value.len(), expected))?,
            )
        }
        _ => return Err(NtndaError::UnsupportedDims(dims.clone(), color_mode)),
    };
    Ok(Some(Frame::new(
        array.unique_id,
        array.timestamp,
        pixel_type,
        data,
    )))
}

fn luminance(dims: &[usize], color_mode: i32, values: &[f64]) -> Result<Array2<f64>, NtndaError> {
    // (nx, ny, channels) and the flat index of (x, y, c) per interleave mode
    let (nx, ny, nc) = match color_mode {
        COLOR_MODE_RGB1 => (dims[1], dims[2], dims[0]),
        COLOR_MODE_RGB2 => (dims[0], dims[2], dims[1]),
        _ => (dims[0], dims[1], dims[2]),
    };
    if nc != 3 && nc != 4 {
        return Err(NtndaError::UnsupportedDims(dims.to_vec(), color_mode));
    }
    let index = |x: usize, y: usize, c: usize| -> usize {
        match color_mode {
            COLOR_MODE_RGB1 => c + nc * (x + nx * y),
            COLOR_MODE_RGB2 => x + nx * (c + nc * y),
            _ => x + nx * (y + ny * c),
        }
    };
    Ok(Array2::from_shape_fn((ny, nx), |(y, x)| {
        LUMA_WEIGHTS
            .iter()
            .enumerate()
            .map(|(c, w)| w * values[index(x, y, c)])
            .sum()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_mode(mut array: NtNdArray, mode: i32, dims: Vec<usize>) -> NtNdArray {
        array.dimensions = dims;
        array.attributes = vec![NdAttribute {
            name: String::from(COLOR_MODE_ATTRIBUTE),
            value: mode as f64,
        }];
        array
    }

    #[test]
    fn test_mono_layout() {
        let array = NtNdArray::mono(7, 3, 2, NdValue::UShort(vec![0, 1, 2, 3, 4, 5]));
        let frame = reshape(&array).unwrap().unwrap();
        assert_eq!(frame.shape(), (2, 3));
        assert_eq!(frame.data[[1, 0]], 3.0);
        assert_eq!(frame.uid, 7);
        assert_eq!(frame.pixel_type, PixelType::U16);
    }

    #[test]
    fn test_no_dims() {
        let mut array = NtNdArray::mono(1, 0, 0, NdValue::UByte(vec![]));
        array.dimensions.clear();
        assert!(reshape(&array).unwrap().is_none());
    }

    #[test]
    fn test_size_mismatch() {
        let array = NtNdArray::mono(1, 4, 4, NdValue::UByte(vec![1, 2, 3]));
        assert!(matches!(
            reshape(&array),
            Err(NtndaError::SizeMismatch(3, 16))
        ));
    }

    #[test]
    fn test_rgb1_luminance() {
        // 2x1 image, pixel 0 pure red, pixel 1 pure green
        let base = NtNdArray::mono(1, 0, 0, NdValue::UByte(vec![100, 0, 0, 0, 100, 0]));
        let array = with_mode(base, COLOR_MODE_RGB1, vec![3, 2, 1]);
        let frame = reshape(&array).unwrap().unwrap();
        assert_eq!(frame.shape(), (1, 2));
        assert!((frame.data[[0, 0]] - 21.26).abs() < 1e-9);
        assert!((frame.data[[0, 1]] - 71.52).abs() < 1e-9);
        assert_eq!(frame.pixel_type, PixelType::F32);
    }

    #[test]
    fn test_rgb3_planar() {
        // 1x2 image: red plane, green plane, blue plane
        let base = NtNdArray::mono(1, 0, 0, NdValue::UByte(vec![10, 0, 0, 10, 0, 0]));
        let array = with_mode(base, COLOR_MODE_RGB3, vec![1, 2, 3]);
        let frame = reshape(&array).unwrap().unwrap();
        assert_eq!(frame.shape(), (2, 1));
        assert!((frame.data[[0, 0]] - 2.126).abs() < 1e-9);
        assert!((frame.data[[1, 0]] - 7.152).abs() < 1e-9);
    }

    #[test]
    fn test_singleton_third_dim() {
        let base = NtNdArray::mono(1, 0, 0, NdValue::Short(vec![0; 12]));
        let array = with_mode(base, 1, vec![4, 1, 3]);
        let frame = reshape(&array).unwrap().unwrap();
        assert_eq!(frame.shape(), (4, 3));
    }

    #[test]
    fn test_unsupported() {
        let base = NtNdArray::mono(1, 0, 0, NdValue::UByte(vec![0; 8]));
        let array = with_mode(base, 1, vec![2, 2, 2]);
        assert!(matches!(
            reshape(&array),
            Err(NtndaError::UnsupportedDims(_, 1))
        ));
    }
}
