pub mod flat_field;
pub mod invert;
pub mod sum;

use serde_json::Value;

use super::error::ProcessError;
use super::frame::Frame;

/// Per-frame metadata shared by the processors of a pipeline run
pub type FrameMeta = serde_json::Map<String, Value>;

/// Metadata seeded with the frame's uid and timestamp
pub fn meta_for(frame: &Frame) -> FrameMeta {
    let mut meta = FrameMeta::new();
    meta.insert(String::from("uid"), Value::from(frame.uid));
    meta.insert(String::from("timestamp"), Value::from(frame.timestamp));
    meta
}

/// A step of the processing pipeline
pub trait Processor: Send + std::fmt::Debug {
    fn process(&mut self, frame: Frame, meta: &mut FrameMeta) -> Result<Frame, ProcessError>;
}

/// Parameters arrive as a JSON object; null is treated as empty
pub(crate) fn parse_params<T: serde::de::DeserializeOwned>(params: &Value) -> Result<T, ProcessError> {
    let params = match params {
        Value::Null => Value::Object(serde_json::Map::new()),
        other => other.clone(),
    };
    Ok(serde_json::from_value(params)?)
}
