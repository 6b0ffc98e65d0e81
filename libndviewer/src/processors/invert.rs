use serde_json::Value;

use super::{FrameMeta, Processor};
use crate::error::ProcessError;
use crate::frame::Frame;

/// Mirror intensities within the frame's own range: `hi - (v - lo)`
#[derive(Debug, Default)]
pub struct Invert;

impl Processor for Invert {
    fn process(&mut self, mut frame: Frame, meta: &mut FrameMeta) -> Result<Frame, ProcessError> {
        let stats = match frame.stats() {
            Some(s) => s,
            None => return Ok(frame),
        };
        let (lo, hi) = (stats.min, stats.max);
        if !(lo.is_finite() && hi.is_finite()) || hi <= lo {
            return Ok(frame);
        }
        let pixel_type = frame.pixel_type;
        frame
            .data
            .mapv_inplace(|v| pixel_type.clip(hi - (v - lo)));
        meta.insert(String::from("inverted"), Value::Bool(true));
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelType;
    use crate::processors::meta_for;
    use ndarray::array;

    #[test]
    fn test_invert() {
        let frame = Frame::new(3, 1.0, PixelType::U16, array![[10.0, 20.0], [30.0, 40.0]]);
        let mut meta = meta_for(&frame);
        let out = Invert.process(frame, &mut meta).unwrap();
        assert_eq!(out.data, array![[40.0, 30.0], [20.0, 10.0]]);
        assert_eq!(meta.get("inverted"), Some(&Value::Bool(true)));
        assert_eq!(meta.get("uid"), Some(&Value::from(3)));
    }

    #[test]
    fn test_flat_frame_unchanged() {
        let frame = Frame::new(0, 0.0, PixelType::F32, array![[5.0, 5.0]]);
        let mut meta = FrameMeta::new();
        let out = Invert.process(frame.clone(), &mut meta).unwrap();
        assert_eq!(out, frame);
        assert!(meta.get("inverted").is_none());
    }
}
