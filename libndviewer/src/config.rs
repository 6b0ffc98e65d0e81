use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::error::ConfigError;

pub const APP_DIR_NAME: &str = ".ndviewer";
pub const STATE_FILE_NAME: &str = "viewer_config.json";

/// Options of the viewer, set from the command line
#[derive(Debug, Clone, PartialEq)]
pub struct ViewerOptions {
    pub pv: Option<String>,
    /// Maximum redraw rate, 0 is unthrottled
    pub max_fps: f64,
    pub hist_fps: f64,
    /// 0 picks the decimation from the frame size
    pub display_bin: usize,
    /// Recompute autoscale levels every N frames
    pub auto_every: u64,
    pub proc_config: PathBuf,
    pub no_plugins: bool,
    pub log_file: Option<PathBuf>,
    pub log_level: String,
    /// Use the in-memory PV backend
    pub sim: bool,
}

impl Default for ViewerOptions {
    fn default() -> Self {
        Self {
            pv: None,
            max_fps: 0.0,
            hist_fps: 4.0,
            display_bin: 0,
            auto_every: 10,
            proc_config: PathBuf::from("pipelines/processors.json"),
            no_plugins: false,
            log_file: None,
            log_level: String::from("INFO"),
            sim: false,
        }
    }
}

impl ViewerOptions {
    /// The pipeline config path, resolved against `cwd` when relative
    pub fn resolve_proc_config(&self, cwd: &Path) -> PathBuf {
        if self.proc_config.is_absolute() {
            self.proc_config.clone()
        } else {
            cwd.join(&self.proc_config)
        }
    }
}

/// State remembered between viewer sessions.
///
/// Keys this version does not know about are kept as they are.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub pv_name: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PersistedState {
    /// `~/.ndviewer/viewer_config.json`
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::NoHomeDirectory)?;
        Ok(home.join(APP_DIR_NAME).join(STATE_FILE_NAME))
    }

    pub fn read_state_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::BadFilePath(path.to_path_buf()));
        }
        let json_str = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str::<Self>(&json_str)?)
    }

    /// Load the state, falling back to `defaults` if the file is missing or unreadable
    pub fn load_or(path: &Path, defaults: Self) -> Self {
        match Self::read_state_file(path) {
            Ok(mut state) => {
                if state.pv_name.is_empty() {
                    state.pv_name = defaults.pv_name;
                }
                for (key, value) in defaults.extra {
                    state.extra.entry(key).or_insert(value);
                }
                state
            }
            Err(e) => {
                spdlog::warn!("Config load failed ({e}). Using defaults.");
                defaults
            }
        }
    }

    /// Write the state through a temporary file in the same directory
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;
        let mut tmp = tempfile::Builder::new().prefix(".cfg.").tempfile_in(&dir)?;
        let json_str = serde_json::to_string_pretty(self)?;
        tmp.write_all(json_str.as_bytes())?;
        tmp.flush()?;
        tmp.persist(path)?;
        spdlog::info!("Config saved to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_proc_config() {
        let options = ViewerOptions::default();
        assert_eq!(
            options.resolve_proc_config(Path::new("/data")),
            PathBuf::from("/data/pipelines/processors.json")
        );
        let absolute = ViewerOptions {
            proc_config: PathBuf::from("/etc/p.json"),
            ..ViewerOptions::default()
        };
        assert_eq!(
            absolute.resolve_proc_config(Path::new("/data")),
            PathBuf::from("/etc/p.json")
        );
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join(STATE_FILE_NAME);
        let mut state = PersistedState {
            pv_name: String::from("13SIM1:image1:"),
            ..Default::default()
        };
        state
            .extra
            .insert(String::from("theme"), serde_json::Value::from("dark"));
        state.save(&path).unwrap();

        let loaded = PersistedState::load_or(&path, PersistedState::default());
        assert_eq!(loaded, state);
        // no temporary files left behind
        assert_eq!(std::fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }

    #[test]
    fn test_load_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATE_FILE_NAME);
        let defaults = PersistedState {
            pv_name: String::from("default:pv"),
            ..Default::default()
        };
        assert_eq!(PersistedState::load_or(&path, defaults.clone()), defaults);

        std::fs::write(&path, "{ broken").unwrap();
        assert_eq!(PersistedState::load_or(&path, defaults.clone()), defaults);

        std::fs::write(&path, r#"{"other": 1}"#).unwrap();
        let merged = PersistedState::load_or(&path, defaults);
        assert_eq!(merged.pv_name, "default:pv");
        assert_eq!(merged.extra.get("other"), Some(&serde_json::Value::from(1)));
    }
}
