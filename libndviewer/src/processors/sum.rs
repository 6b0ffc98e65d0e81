use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use super::{parse_params, FrameMeta, Processor};
use crate::accumulate::FrameAccumulator;
use crate::error::ProcessError;
use crate::frame::{Frame, PixelType};
use ndarray::Array2;

/// Handle through which the viewer starts, stops and resets a running sum.
///
/// Clones share the same accumulator.
#[derive(Debug, Clone, Default)]
pub struct SumControl {
    inner: Arc<Mutex<FrameAccumulator>>,
}

impl SumControl {
    /// Resume summing onto the existing total
    pub fn start(&self) {
        self.inner.lock().resume();
    }

    pub fn stop(&self) {
        self.inner.lock().stop();
    }

    pub fn reset(&self) {
        self.inner.lock().reset();
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().is_running()
    }

    pub fn count(&self) -> u64 {
        self.inner.lock().count()
    }

    pub fn snapshot(&self) -> Option<Array2<f64>> {
        self.inner.lock().sum().cloned()
    }
}

#[derive(Debug, Deserialize)]
struct SumParams {
    #[serde(default = "default_preview")]
    preview: bool,
}

fn default_preview() -> bool {
    true
}

/// Running sum of the frames passing through the pipeline.
///
/// With `preview` on, the output is the running sum even while stopped, so a
/// freshly reset or never started sum shows as a zero image.
#[derive(Debug)]
pub struct SumFrames {
    control: SumControl,
    preview: bool,
}

impl SumFrames {
    pub fn new(control: SumControl, preview: bool) -> Self {
        Self { control, preview }
    }

    pub fn from_params(control: SumControl, params: &Value) -> Result<Self, ProcessError> {
        let params: SumParams = parse_params(params)?;
        Ok(Self::new(control, params.preview))
    }
}

impl Processor for SumFrames {
    fn process(&mut self, frame: Frame, meta: &mut FrameMeta) -> Result<Frame, ProcessError> {
        let mut acc = self.control.inner.lock();
        acc.ensure_shape(frame.data.dim());
        acc.add(&frame.data);
        meta.insert(String::from("sum_count"), Value::from(acc.count()));
        match acc.sum() {
            Some(sum) if self.preview => {
                let mut out = frame.with_data(sum.clone());
                out.pixel_type = PixelType::F64;
                Ok(out)
            }
            _ => Ok(frame),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use serde_json::json;

    #[test]
    fn test_sum_preview() {
        let control = SumControl::default();
        let mut sum = SumFrames::from_params(control.clone(), &Value::Null).unwrap();
        let frame = Frame::new(0, 0.0, PixelType::U16, array![[1.0, 2.0]]);
        let mut meta = FrameMeta::new();

        // stopped: the empty sum is shown
        let out = sum.process(frame.clone(), &mut meta).unwrap();
        assert_eq!(out.data, array![[0.0, 0.0]]);
        assert_eq!(out.pixel_type, PixelType::F64);
        assert_eq!(control.count(), 0);

        control.start();
        sum.process(frame.clone(), &mut meta).unwrap();
        let out = sum.process(frame.clone(), &mut meta).unwrap();
        assert_eq!(out.data, array![[2.0, 4.0]]);
        assert_eq!(out.pixel_type, PixelType::F64);
        assert_eq!(meta.get("sum_count"), Some(&Value::from(2)));
        assert_eq!(control.count(), 2);

        control.reset();
        assert_eq!(control.count(), 0);
        assert_eq!(control.snapshot().unwrap(), array![[0.0, 0.0]]);
    }

    #[test]
    fn test_sum_without_preview() {
        let control = SumControl::default();
        let mut sum = SumFrames::from_params(control.clone(), &json!({"preview": false})).unwrap();
        control.start();
        let frame = Frame::new(0, 0.0, PixelType::U16, array![[1.0]]);
        let out = sum.process(frame.clone(), &mut FrameMeta::new()).unwrap();
        assert_eq!(out, frame);
        assert_eq!(control.snapshot().unwrap(), array![[1.0]]);
    }

    #[test]
    fn test_bad_params() {
        let control = SumControl::default();
        assert!(SumFrames::from_params(control, &json!({"preview": "yes"})).is_err());
    }
}
