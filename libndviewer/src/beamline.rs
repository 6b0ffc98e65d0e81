//! Facility specific tools.
//!
//! Each beamline offers a set of tool windows. Which beamline is active, and
//! optionally which of its tools, is chosen by a [`BeamlineConfig`].
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeamlineConfig {
    /// None disables beamline tools
    pub active_beamline: Option<String>,
    /// None loads every tool of the beamline
    pub enabled_plugins: Option<Vec<String>>,
}

impl Default for BeamlineConfig {
    fn default() -> Self {
        Self {
            active_beamline: Some(String::from("bl32ID")),
            enabled_plugins: None,
        }
    }
}

impl BeamlineConfig {
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }
        let yaml_str = std::fs::read_to_string(config_path)?;
        Ok(serde_yaml::from_str::<Self>(&yaml_str)?)
    }

    pub fn write_config_file(&self, config_path: &Path) -> Result<(), ConfigError> {
        let yaml_str = serde_yaml::to_string(self)?;
        std::fs::write(config_path, yaml_str)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    MotorScan,
    SoftBpm,
    Example,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub kind: ToolKind,
}

impl ToolDescriptor {
    pub fn new(name: &str, description: &str, kind: ToolKind) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            kind,
        }
    }
}

#[derive(Debug, Clone)]
struct Beamline {
    name: String,
    tools: Vec<ToolDescriptor>,
}

/// Known beamlines and their tools, in registration order
#[derive(Debug, Clone, Default)]
pub struct BeamlineRegistry {
    beamlines: Vec<Beamline>,
}

impl BeamlineRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(
            "bl32ID",
            vec![
                ToolDescriptor::new(
                    "MotorScanDialog",
                    "X/Y motor scan with live mosaic stitching",
                    ToolKind::MotorScan,
                ),
                ToolDescriptor::new(
                    "SoftBPMDialog",
                    "Beam intensity monitor with automatic motor correction",
                    ToolKind::SoftBpm,
                ),
            ],
        );
        registry.register(
            "_template_beamline",
            vec![ToolDescriptor::new(
                "ExamplePluginDialog",
                "Starting point for new beamline tools",
                ToolKind::Example,
            )],
        );
        registry
    }

    /// Add or replace a beamline
    pub fn register(&mut self, name: &str, tools: Vec<ToolDescriptor>) {
        match self.beamlines.iter_mut().find(|b| b.name == name) {
            Some(beamline) => beamline.tools = tools,
            None => self.beamlines.push(Beamline {
                name: name.to_string(),
                tools,
            }),
        }
    }

    /// Beamline names, without templates (names starting with `_`)
    pub fn available_beamlines(&self) -> Vec<&str> {
        self.beamlines
            .iter()
            .map(|b| b.name.as_str())
            .filter(|name| !name.starts_with('_'))
            .collect()
    }

    pub fn tools(&self, beamline: &str) -> Option<&[ToolDescriptor]> {
        self.beamlines
            .iter()
            .find(|b| b.name == beamline)
            .map(|b| b.tools.as_slice())
    }

    /// Tools to load for `config`. Unknown beamlines and tool names are logged and skipped.
    pub fn load(&self, config: &BeamlineConfig) -> Vec<ToolDescriptor> {
        let active = match config.active_beamline.as_deref() {
            Some(name) => name,
            None => {
                spdlog::info!("No active beamline configured");
                return vec![];
            }
        };
        let tools = match self.tools(active) {
            Some(t) => t,
            None => {
                spdlog::warn!(
                    "Beamline {active} not found. Available beamlines: {:?}",
                    self.available_beamlines()
                );
                return vec![];
            }
        };
        if let Some(enabled) = config.enabled_plugins.as_ref() {
            for name in enabled {
                if !tools.iter().any(|t| &t.name == name) {
                    spdlog::warn!("Tool {name} not found in beamline {active}");
                }
            }
        }
        let loaded: Vec<ToolDescriptor> = tools
            .iter()
            .filter(|t| {
                config
                    .enabled_plugins
                    .as_ref()
                    .map_or(true, |enabled| enabled.contains(&t.name))
            })
            .cloned()
            .collect();
        spdlog::info!("Loaded {} tools from beamline {active}", loaded.len());
        loaded
    }
}
