use ndarray::Array2;
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;

use super::{parse_params, FrameMeta, Processor};
use crate::display::apply_flat_field;
use crate::error::ProcessError;
use crate::frame::Frame;
use crate::imageio::load_npy;

#[derive(Debug, Deserialize)]
struct FlatFieldParams {
    path: PathBuf,
}

/// Flat-field correction against a flat loaded from an npy file
#[derive(Debug)]
pub struct FlatField {
    flat: Array2<f64>,
}

impl FlatField {
    pub fn new(flat: Array2<f64>) -> Self {
        Self { flat }
    }

    pub fn from_params(params: &Value) -> Result<Self, ProcessError> {
        let params: FlatFieldParams = parse_params(params)?;
        let flat = load_npy(&params.path)?;
        spdlog::info!(
            "Loaded flat {} with shape {:?}",
            params.path.display(),
            flat.dim()
        );
        Ok(Self::new(flat))
    }
}

impl Processor for FlatField {
    fn process(&mut self, frame: Frame, meta: &mut FrameMeta) -> Result<Frame, ProcessError> {
        match apply_flat_field(&frame, &self.flat) {
            Some(corrected) => {
                meta.insert(String::from("flat_field"), Value::Bool(true));
                Ok(corrected)
            }
            None => {
                meta.insert(String::from("flat_field"), Value::Bool(false));
                Ok(frame)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelType;
    use crate::imageio::save_npy;
    use ndarray::array;
    use serde_json::json;

    #[test]
    fn test_from_npy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flat.npy");
        save_npy(&path, &array![[1.0f64, 3.0]]).unwrap();
        let mut proc = FlatField::from_params(&json!({ "path": path })).unwrap();
        let frame = Frame::new(0, 0.0, PixelType::F64, array![[4.0, 6.0]]);
        let mut meta = FrameMeta::new();
        let out = proc.process(frame, &mut meta).unwrap();
        assert_eq!(out.data, array![[8.0, 4.0]]);
        assert_eq!(meta.get("flat_field"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_shape_mismatch_passes_through() {
        let mut proc = FlatField::new(array![[1.0]]);
        let frame = Frame::new(0, 0.0, PixelType::F64, array![[4.0, 6.0]]);
        let mut meta = FrameMeta::new();
        let out = proc.process(frame.clone(), &mut meta).unwrap();
        assert_eq!(out, frame);
        assert_eq!(meta.get("flat_field"), Some(&Value::Bool(false)));
    }

    #[test]
    fn test_missing_path() {
        assert!(matches!(
            FlatField::from_params(&json!({})),
            Err(ProcessError::BadParams(_))
        ));
        assert!(matches!(
            FlatField::from_params(&json!({"path": "/does/not/exist.npy"})),
            Err(ProcessError::ImageIo(_))
        ));
    }
}
