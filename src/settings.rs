//! Engine settings (`clicktrack.toml`)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::error::{MetronomeError, Result};

pub const DEFAULT_SETTINGS_FILE: &str = "clicktrack.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Quiet period before a tempo change rebuilds the playing loop.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Directory holding `click_hi.wav` and `click_lo.wav`.
    #[serde(default)]
    pub asset_dir: Option<PathBuf>,
    #[serde(default)]
    pub output_device: Option<String>,
    #[serde(default = "default_volume")]
    pub volume: f32,
    #[serde(default)]
    pub debug: bool,
}

fn default_debounce_ms() -> u64 {
    300
}
fn default_poll_interval_ms() -> u64 {
    1
}
fn default_volume() -> f32 {
    1.0
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            asset_dir: None,
            output_device: None,
            volume: default_volume(),
            debug: false,
        }
    }
}

impl EngineSettings {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut settings: Self =
            toml::from_str(content).map_err(|e| MetronomeError::Settings(e.to_string()))?;
        settings.volume = settings.volume.clamp(0.0, 1.0);
        Ok(settings)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| MetronomeError::Settings(e.to_string()))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Defaults when the file is missing; a file that exists but does not
    /// parse is still an error.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            log::debug!("No settings at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}
