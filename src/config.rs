use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::core::summary::DEFAULT_SUMMARY_LIMIT;
use crate::gate::GatingMode;
use crate::orchestration::EngineConfig;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub default_mode: GatingMode,
    pub gate_timeout_secs: u64,
    pub summary_limit: usize,
    pub max_concurrent_tasks: Option<usize>,
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_mode: GatingMode::Balanced,
            gate_timeout_secs: 600,
            summary_limit: DEFAULT_SUMMARY_LIMIT,
            max_concurrent_tasks: None,
            debug: false,
        }
    }
}

impl Config {
    pub fn crewrun_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".crewrun"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::crewrun_dir()?.join("crewrun.toml"))
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "loading config");
        if !path.exists() {
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        debug!(
            mode = %config.default_mode,
            gate_timeout_secs = config.gate_timeout_secs,
            max_concurrent_tasks = ?config.max_concurrent_tasks,
            "config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.exists() {
                fs::create_dir_all(dir)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            gate_timeout: Duration::from_secs(self.gate_timeout_secs),
            summary_limit: self.summary_limit,
            max_concurrent_tasks: self.max_concurrent_tasks,
        }
    }
}
