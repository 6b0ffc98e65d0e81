use std::path::{Path, PathBuf};

use super::error::RecorderError;
use super::frame::Frame;
use super::imageio::save_tiff_stack;

/// Collects displayed frames and writes them out as a multi-page TIFF on stop
#[derive(Debug, Default)]
pub struct Recorder {
    path: Option<PathBuf>,
    frames: Vec<Frame>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, path: &Path) -> Result<(), RecorderError> {
        if path.as_os_str().is_empty() {
            return Err(RecorderError::NoPath);
        }
        self.frames.clear();
        self.path = Some(path.to_path_buf());
        spdlog::info!("Recording to {}", path.display());
        Ok(())
    }

    pub fn is_recording(&self) -> bool {
        self.path.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append a frame while recording. Returns the number of frames held.
    pub fn push(&mut self, frame: &Frame) -> usize {
        if self.is_recording() {
            self.frames.push(frame.clone());
        }
        self.frames.len()
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Stop recording and write the stack. Returns the number of frames written.
    ///
    /// Buffered frames are discarded even if writing fails.
    pub fn stop(&mut self) -> Result<usize, RecorderError> {
        let frames = std::mem::take(&mut self.frames);
        let path = match self.path.take() {
            Some(p) => p,
            None => return Ok(0),
        };
        if frames.is_empty() {
            spdlog::warn!("Recording stopped with no frames, nothing written");
            return Ok(0);
        }
        save_tiff_stack(&path, &frames)?;
        spdlog::info!("Saved {} frames to {}", frames.len(), path.display());
        Ok(frames.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelType;
    use ndarray::array;

    #[test]
    fn test_requires_path() {
        let mut rec = Recorder::new();
        assert!(matches!(
            rec.start(Path::new("")),
            Err(RecorderError::NoPath)
        ));
        assert!(!rec.is_recording());
    }

    #[test]
    fn test_record_and_stop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.tif");
        let mut rec = Recorder::new();
        let frame = Frame::new(1, 0.0, PixelType::F32, array![[0.0, 0.5], [1.0, 2.0]]);
        assert_eq!(rec.push(&frame), 0);
        rec.start(&path).unwrap();
        rec.push(&frame);
        assert_eq!(rec.push(&frame), 2);
        assert_eq!(rec.stop().unwrap(), 2);
        assert!(path.exists());
        assert!(!rec.is_recording());
        assert_eq!(rec.frame_count(), 0);
    }

    #[test]
    fn test_empty_recording_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.tif");
        let mut rec = Recorder::new();
        rec.start(&path).unwrap();
        assert_eq!(rec.stop().unwrap(), 0);
        assert!(!path.exists());
    }
}
