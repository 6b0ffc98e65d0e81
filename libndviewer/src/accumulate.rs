use ndarray::Array2;

/// Running sum of frames.
///
/// Frames are only added while running. A frame with a different shape than
/// the current sum restarts the sum at that shape.
#[derive(Debug, Clone, Default)]
pub struct FrameAccumulator {
    running: bool,
    sum: Option<Array2<f64>>,
    count: u64,
}

impl FrameAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin accumulating from zero
    pub fn start(&mut self) {
        self.reset();
        self.running = true;
    }

    /// Continue accumulating onto the existing sum
    pub fn resume(&mut self) {
        self.running = true;
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn reset(&mut self) {
        if let Some(sum) = self.sum.as_mut() {
            sum.fill(0.0);
        }
        self.count = 0;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum(&self) -> Option<&Array2<f64>> {
        self.sum.as_ref()
    }

    /// Zero sum of shape `dim`, restarting the sum if its shape differs
    pub fn ensure_shape(&mut self, dim: (usize, usize)) -> &mut Array2<f64> {
        if self.sum.as_ref().is_some_and(|sum| sum.dim() != dim) {
            spdlog::info!("Frame shape changed to {dim:?}, restarting sum");
            self.sum = None;
        }
        if self.sum.is_none() {
            self.count = 0;
        }
        self.sum.get_or_insert_with(|| Array2::zeros(dim))
    }

    /// Add an image if running. Non-finite pixels contribute zero.
    ///
    /// Returns the running sum after the add, or None when stopped.
    pub fn add(&mut self, image: &Array2<f64>) -> Option<&Array2<f64>> {
        if !self.running {
            return None;
        }
        let sum = self.ensure_shape(image.dim());
        sum.zip_mut_with(image, |acc, v| {
            if v.is_finite() {
                *acc += v
            }
        });
        self.count += 1;
        self.sum.as_ref()
    }

    /// Per-pixel average of the accumulated frames
    pub fn mean(&self) -> Option<Array2<f64>> {
        if self.count == 0 {
            return None;
        }
        let count = self.count as f64;
        self.sum.as_ref().map(|sum| sum.mapv(|v| v / count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_only_adds_while_running() {
        let mut acc = FrameAccumulator::new();
        assert!(acc.add(&array![[1.0]]).is_none());
        acc.start();
        acc.add(&array![[1.0, 2.0]]);
        let sum = acc.add(&array![[3.0, f64::NAN]]).unwrap().clone();
        assert_eq!(sum, array![[4.0, 2.0]]);
        assert_eq!(acc.count(), 2);
        assert_eq!(acc.mean().unwrap(), array![[2.0, 1.0]]);
        acc.stop();
        assert!(acc.add(&array![[1.0, 1.0]]).is_none());
        assert_eq!(acc.count(), 2);
    }

    #[test]
    fn test_shape_change_restarts() {
        let mut acc = FrameAccumulator::new();
        acc.start();
        acc.add(&array![[5.0]]);
        let sum = acc.add(&array![[1.0, 1.0]]).unwrap().clone();
        assert_eq!(sum, array![[1.0, 1.0]]);
        assert_eq!(acc.count(), 1);
    }

    #[test]
    fn test_ensure_shape_while_stopped() {
        let mut acc = FrameAccumulator::new();
        assert_eq!(acc.ensure_shape((1, 2)), &array![[0.0, 0.0]]);
        assert!(!acc.is_running());
        acc.resume();
        acc.add(&array![[1.0, 2.0]]);
        acc.stop();
        assert_eq!(acc.ensure_shape((1, 2)), &array![[1.0, 2.0]]);
        assert_eq!(acc.ensure_shape((2, 1)).dim(), (2, 1));
        assert_eq!(acc.count(), 0);
    }

    #[test]
    fn test_start_resets_resume_keeps() {
        let mut acc = FrameAccumulator::new();
        acc.start();
        acc.add(&array![[2.0]]);
        acc.stop();
        acc.resume();
        acc.add(&array![[2.0]]);
        assert_eq!(acc.sum().unwrap()[[0, 0]], 4.0);
        acc.start();
        assert_eq!(acc.count(), 0);
        assert_eq!(acc.sum().unwrap()[[0, 0]], 0.0);
    }
}
