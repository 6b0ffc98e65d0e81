//! JSON configured chain of frame processors.
//!
//! ```json
//! {
//!   "hot_reload": true,
//!   "pipeline": [
//!     { "name": "dark", "module": "invert", "enabled": false },
//!     { "module": "flat_field", "params": { "path": "flat.npy" } }
//!   ]
//! }
//! ```
//!
//! Modules are looked up in a [`ProcessorRegistry`] by name.

use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use super::error::{PipelineError, ProcessError};
use super::frame::Frame;
use super::processors::flat_field::FlatField;
use super::processors::invert::Invert;
use super::processors::sum::{SumControl, SumFrames};
use super::processors::{FrameMeta, Processor};

pub type ProcessorFactory =
    Box<dyn Fn(&Value) -> Result<Box<dyn Processor>, ProcessError> + Send + Sync>;

/// Maps module names to processor constructors
pub struct ProcessorRegistry {
    factories: FxHashMap<String, ProcessorFactory>,
    sum_control: SumControl,
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("modules", &self.names())
            .finish()
    }
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl ProcessorRegistry {
    pub fn empty() -> Self {
        Self {
            factories: FxHashMap::default(),
            sum_control: SumControl::default(),
        }
    }

    /// Registry holding `invert`, `sum` and `flat_field`
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("invert", |_| Ok(Box::new(Invert) as Box<dyn Processor>));
        let control = registry.sum_control.clone();
        registry.register("sum", move |params| {
            Ok(Box::new(SumFrames::from_params(control.clone(), params)?) as Box<dyn Processor>)
        });
        registry.register("flat_field", |params| {
            Ok(Box::new(FlatField::from_params(params)?) as Box<dyn Processor>)
        });
        registry
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&Value) -> Result<Box<dyn Processor>, ProcessError> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered module names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Shared control of every `sum` processor built by this registry
    pub fn sum_control(&self) -> SumControl {
        self.sum_control.clone()
    }

    pub fn create(&self, module: &str, params: &Value) -> Result<Box<dyn Processor>, PipelineError> {
        let factory = self
            .factories
            .get(module)
            .ok_or_else(|| PipelineError::UnknownProcessor(module.to_string()))?;
        factory(params).map_err(|e| PipelineError::ProcessorFailed(module.to_string(), e))
    }
}

fn default_true() -> bool {
    true
}

fn default_params() -> Value {
    Value::Object(serde_json::Map::new())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub module: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_params")]
    pub params: Value,
}

impl ProcSpec {
    pub fn new(module: &str) -> Self {
        Self {
            name: None,
            module: module.to_string(),
            enabled: true,
            params: default_params(),
        }
    }

    /// Display name, defaulting to the module name
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.module)
    }
}

/// Unknown keys such as `processors_dir` are ignored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_true")]
    pub hot_reload: bool,
    #[serde(default)]
    pub pipeline: Vec<ProcSpec>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            hot_reload: true,
            pipeline: vec![],
        }
    }
}

impl PipelineConfig {
    pub fn read_config_file(path: &Path) -> Result<Self, PipelineError> {
        if !path.exists() {
            return Err(PipelineError::BadFilePath(path.to_path_buf()));
        }
        let json_str = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str::<Self>(&json_str)?)
    }
}

#[derive(Debug)]
struct Stage {
    name: String,
    processor: Box<dyn Processor>,
}

/// Builds the enabled, resolvable stages. Failures are logged and skipped.
fn build_stages(specs: &[ProcSpec], registry: &ProcessorRegistry) -> Vec<Stage> {
    let mut stages = Vec::new();
    for spec in specs {
        if !spec.enabled {
            spdlog::info!("Processor {} is disabled", spec.name());
            continue;
        }
        match registry.create(&spec.module, &spec.params) {
            Ok(processor) => {
                spdlog::info!("Loaded processor {} ({})", spec.name(), spec.module);
                stages.push(Stage {
                    name: spec.name().to_string(),
                    processor,
                });
            }
            Err(e) => spdlog::error!("Skipping processor {}: {}", spec.name(), e),
        }
    }
    stages
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[derive(Debug)]
pub struct ProcessorPipeline {
    config_path: Option<PathBuf>,
    registry: Arc<ProcessorRegistry>,
    hot_reload: bool,
    stages: Vec<Stage>,
    loaded_mtime: Option<SystemTime>,
}

impl ProcessorPipeline {
    pub fn from_config(
        path: &Path,
        registry: Arc<ProcessorRegistry>,
    ) -> Result<Self, PipelineError> {
        let config = PipelineConfig::read_config_file(path)?;
        let stages = build_stages(&config.pipeline, &registry);
        spdlog::info!(
            "Pipeline from {} with {} active processors",
            path.display(),
            stages.len()
        );
        Ok(Self {
            config_path: Some(path.to_path_buf()),
            registry,
            hot_reload: config.hot_reload,
            stages,
            loaded_mtime: modified_time(path),
        })
    }

    /// Pipeline built directly from specs, without a file to reload from
    pub fn from_specs(specs: &[ProcSpec], registry: Arc<ProcessorRegistry>) -> Self {
        let stages = build_stages(specs, &registry);
        Self {
            config_path: None,
            registry,
            hot_reload: false,
            stages,
            loaded_mtime: None,
        }
    }

    /// Load `path`, falling back to a pipeline with no stages when the file is
    /// missing or broken
    pub fn load_or_empty(path: &Path, registry: Arc<ProcessorRegistry>) -> Self {
        match Self::from_config(path, registry.clone()) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                spdlog::error!("{e}. Running without processors.");
                Self::empty(registry)
            }
        }
    }

    /// A pipeline with no stages
    pub fn empty(registry: Arc<ProcessorRegistry>) -> Self {
        Self::from_specs(&[], registry)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn hot_reload(&self) -> bool {
        self.hot_reload
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Names of the loaded processors in execution order
    pub fn processor_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    /// Re-read the configuration if the file changed since it was loaded.
    ///
    /// Returns true when the stages were rebuilt. A config which fails to
    /// load leaves the current stages in place.
    pub fn reload_if_changed(&mut self) -> bool {
        if !self.hot_reload {
            return false;
        }
        let path = match self.config_path.as_ref() {
            Some(p) => p.clone(),
            None => return false,
        };
        let mtime = modified_time(&path);
        if mtime.is_none() || mtime == self.loaded_mtime {
            return false;
        }
        // Only retry a broken file once it changes again
        self.loaded_mtime = mtime;
        match PipelineConfig::read_config_file(&path) {
            Ok(config) => {
                self.stages = build_stages(&config.pipeline, &self.registry);
                self.hot_reload = config.hot_reload;
                spdlog::info!(
                    "Reloaded pipeline from {} with {} active processors",
                    path.display(),
                    self.stages.len()
                );
                true
            }
            Err(e) => {
                spdlog::error!("Pipeline reload failed, keeping previous processors: {e}");
                false
            }
        }
    }

    /// Run the frame through every stage in order
    pub fn apply(&mut self, frame: Frame, meta: &mut FrameMeta) -> Result<Frame, PipelineError> {
        self.reload_if_changed();
        let mut frame = frame;
        for stage in self.stages.iter_mut() {
            frame = stage
                .processor
                .process(frame, meta)
                .map_err(|e| PipelineError::ProcessorFailed(stage.name.clone(), e))?;
        }
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelType;
    use crate::processors::meta_for;
    use ndarray::array;
    use std::io::Write;
    use std::time::Duration;

    fn write_config(path: &Path, body: &str) {
        let mut file = std::fs::File::create(path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file.sync_all().unwrap();
    }

    #[derive(Debug)]
    struct AddOne;

    impl Processor for AddOne {
        fn process(&mut self, frame: Frame, meta: &mut FrameMeta) -> Result<Frame, ProcessError> {
            let count = meta.get("add_one").and_then(|v| v.as_u64()).unwrap_or(0);
            meta.insert(String::from("add_one"), Value::from(count + 1));
            let data = frame.data.mapv(|v| v + 1.0);
            Ok(frame.with_data(data))
        }
    }

    fn registry() -> Arc<ProcessorRegistry> {
        let mut registry = ProcessorRegistry::with_builtins();
        registry.register("add_one", |_| Ok(Box::new(AddOne) as Box<dyn Processor>));
        Arc::new(registry)
    }

    #[test]
    fn test_config_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"processors_dir": "x", "pipeline": [{"module": "invert"}]}"#)
                .unwrap();
        assert!(config.hot_reload);
        assert_eq!(config.pipeline[0].name(), "invert");
        assert!(config.pipeline[0].enabled);
        assert_eq!(config.pipeline[0].params, default_params());
    }

    #[test]
    fn test_apply_in_order_skipping() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("processors.json");
        write_config(
            &path,
            r#"{"hot_reload": false, "pipeline": [
                {"name": "first", "module": "add_one"},
                {"module": "invert", "enabled": false},
                {"module": "no_such_module"},
                {"name": "second", "module": "add_one"}
            ]}"#,
        );
        let mut pipeline = ProcessorPipeline::from_config(&path, registry()).unwrap();
        assert_eq!(pipeline.processor_names(), vec!["first", "second"]);

        let frame = Frame::new(9, 1.5, PixelType::F64, array![[1.0, 2.0]]);
        let mut meta = meta_for(&frame);
        let out = pipeline.apply(frame, &mut meta).unwrap();
        assert_eq!(out.data, array![[3.0, 4.0]]);
        assert_eq!(meta.get("add_one"), Some(&Value::from(2)));
        assert_eq!(meta.get("uid"), Some(&Value::from(9)));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            ProcessorPipeline::from_config(Path::new("/no/such/processors.json"), registry()),
            Err(PipelineError::BadFilePath(_))
        ));
        let pipeline =
            ProcessorPipeline::load_or_empty(Path::new("/no/such/processors.json"), registry());
        assert!(pipeline.is_empty());
        assert!(pipeline.config_path().is_none());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        write_config(&path, "{ not json");
        assert!(ProcessorPipeline::load_or_empty(&path, registry()).is_empty());
    }

    #[test]
    fn test_hot_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("processors.json");
        write_config(&path, r#"{"pipeline": [{"module": "add_one"}]}"#);
        let mut pipeline = ProcessorPipeline::from_config(&path, registry()).unwrap();
        assert_eq!(pipeline.len(), 1);

        // make sure the modification time moves even on coarse filesystems
        std::thread::sleep(Duration::from_millis(1100));
        write_config(
            &path,
            r#"{"pipeline": [{"module": "add_one"}, {"module": "invert"}]}"#,
        );
        let frame = Frame::new(0, 0.0, PixelType::F64, array![[0.0, 1.0]]);
        let out = pipeline.apply(frame, &mut FrameMeta::new()).unwrap();
        assert_eq!(pipeline.processor_names(), vec!["add_one", "invert"]);
        assert_eq!(out.data, array![[2.0, 1.0]]);

        // a broken file keeps the previous stages
        std::thread::sleep(Duration::from_millis(1100));
        write_config(&path, "{ not json");
        assert!(!pipeline.reload_if_changed());
        assert_eq!(pipeline.len(), 2);
    }

    #[test]
    fn test_registry() {
        let registry = ProcessorRegistry::with_builtins();
        assert_eq!(registry.names(), vec!["flat_field", "invert", "sum"]);
        assert!(matches!(
            registry.create("missing", &Value::Null),
            Err(PipelineError::UnknownProcessor(_))
        ));
        let mut pipeline =
            ProcessorPipeline::from_specs(&[ProcSpec::new("sum")], Arc::new(registry));
        let control = pipeline.registry.sum_control();
        control.start();
        let frame = Frame::new(0, 0.0, PixelType::U8, array![[2.0]]);
        pipeline.apply(frame.clone(), &mut FrameMeta::new()).unwrap();
        let out = pipeline.apply(frame, &mut FrameMeta::new()).unwrap();
        assert_eq!(out.data, array![[4.0]]);
    }
}
