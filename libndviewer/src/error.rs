use std::path::PathBuf;
use thiserror::Error;

use super::bpm::BpmEvent;
use super::scan_status::ScanStatus;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Config failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Config could not determine the user home directory")]
    NoHomeDirectory,
    #[error("Config failed to persist file: {0}")]
    PersistError(#[from] tempfile::PersistError),
}

#[derive(Debug, Clone, Error)]
pub enum NtndaError {
    #[error("NTNDArray has unsupported dimensions {0:?} for color mode {1}")]
    UnsupportedDims(Vec<usize>, i32),
    #[error("NTNDArray value holds {0} elements but its dimensions require {1}")]
    SizeMismatch(usize, usize),
}

#[derive(Debug, Error)]
pub enum PvError {
    #[error("PV {0} does not exist or is not connected")]
    NotFound(String),
    #[error("PV {0} returned a value which could not be parsed: {1}")]
    BadValue(String, String),
    #[error("PV {0} does not serve image data")]
    NotAnImage(String),
    #[error("Command {0} failed for PV {1}: {2}")]
    CommandFailed(String, String, String),
    #[error("PV access failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("PV image could not be decoded: {0}")]
    ImageError(#[from] NtndaError),
}

#[derive(Debug, Error)]
pub enum ImageIoError {
    #[error("Image IO failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Failed to write npy file: {0}")]
    NpyWrite(#[from] ndarray_npy::WriteNpyError),
    #[error("Failed to read npy file: {0}")]
    NpyRead(#[from] ndarray_npy::ReadNpyError),
    #[error("Failed to encode image: {0}")]
    ImageError(#[from] image::ImageError),
    #[error("Failed to encode TIFF stack: {0}")]
    TiffError(#[from] tiff::TiffError),
    #[error("Image buffer of {0} bytes does not fit a {1}x{2} image")]
    BadBuffer(usize, usize, usize),
    #[error("Cannot write an empty image stack")]
    EmptyStack,
    #[error("Frame {0} has shape {1:?} but the stack has shape {2:?}")]
    InconsistentShape(usize, (usize, usize), (usize, usize)),
    #[error("Unsupported image file extension for {0:?}")]
    UnsupportedExtension(PathBuf),
    #[error("Could not parse text image: {0}")]
    TextParse(String),
    #[error("Image has invalid shape: {0}")]
    ShapeError(#[from] ndarray::ShapeError),
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Processor failed to parse its parameters: {0}")]
    BadParams(#[from] serde_json::Error),
    #[error("Processor failed due to image IO error: {0}")]
    ImageIo(#[from] ImageIoError),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Failed to load pipeline configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Pipeline failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Pipeline failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("No processor named {0} is registered")]
    UnknownProcessor(String),
    #[error("Processor {0} failed: {1}")]
    ProcessorFailed(String, ProcessError),
}

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("Recording requires an output path")]
    NoPath,
    #[error("Recorder failed due to image IO error: {0}")]
    ImageIo(#[from] ImageIoError),
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Scan failed due to PV error: {0}")]
    PvError(#[from] PvError),
    #[error("Scan failed because {0} returned no image")]
    NoImage(String),
    #[error("Scan configuration is invalid: {0}")]
    InvalidConfig(String),
    #[error("Scan failed due to image IO error: {0}")]
    ImageIo(#[from] ImageIoError),
    #[error("Scan failed due to Send error: {0}")]
    SendError(#[from] std::sync::mpsc::SendError<ScanStatus>),
}

#[derive(Debug, Error)]
pub enum BpmError {
    #[error("Beam monitor configuration is invalid: {0}")]
    InvalidConfig(String),
    #[error("Beam monitor failed due to PV error: {0}")]
    PvError(#[from] PvError),
    #[error("Beam monitor failed due to Send error: {0}")]
    SendError(#[from] std::sync::mpsc::SendError<BpmEvent>),
}

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Metric requires a non-empty image")]
    EmptyImage,
    #[error("Image shape {0:?} does not match reference shape {1:?}")]
    ShapeMismatch((usize, usize), (usize, usize)),
    #[error("Metric failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}
