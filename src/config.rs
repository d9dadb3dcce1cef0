use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::orchestration::{MergeStrategy, ResolutionPolicy};
use crate::{cxlog_debug, Error, Result};

/// Default verification timeout (5 minutes).
pub const DEFAULT_VERIFY_TIMEOUT_SECS: u64 = 300;

fn default_verify_timeout_secs() -> u64 {
    DEFAULT_VERIFY_TIMEOUT_SECS
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_verify_timeout_secs")]
    pub verify_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub rollback_on_failure: bool,
    pub staging_dir: Option<String>,
    #[serde(default)]
    pub fine_grained_patching: bool,
    #[serde(default)]
    pub default_strategy: MergeStrategy,
    #[serde(default)]
    pub default_resolution: ResolutionPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            verify_timeout_secs: DEFAULT_VERIFY_TIMEOUT_SECS,
            rollback_on_failure: true,
            staging_dir: None,
            fine_grained_patching: false,
            default_strategy: MergeStrategy::default(),
            default_resolution: ResolutionPolicy::default(),
        }
    }
}

impl Config {
    pub fn conflux_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".conflux"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::conflux_dir()?.join("conflux.toml"))
    }

    /// Staging directory for merges: the configured one, or the current directory.
    pub fn staging_dir(&self) -> Result<PathBuf> {
        match &self.staging_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(std::env::current_dir()?),
        }
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        cxlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            cxlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        cxlog_debug!(
            "Config loaded: verify_timeout_secs={}, rollback_on_failure={}, staging_dir={:?}",
            config.verify_timeout_secs,
            config.rollback_on_failure,
            config.staging_dir
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, self.to_toml()?)?;
        cxlog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
