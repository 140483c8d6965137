//! User-level configuration.
//!
//! The `deployment` command records the active manifest path in
//! `~/.bosh_micro.json`; the other commands read it back. `BOSH_MICRO_HOME`
//! overrides the base directory, which keeps CLI tests hermetic.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// File name of the user config within the base directory.
const USER_CONFIG_FILENAME: &str = ".bosh_micro.json";

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("home directory could not be determined")]
  NoHome,

  #[error("reading user config: {0}")]
  Read(#[source] io::Error),

  #[error("writing user config: {0}")]
  Write(#[source] io::Error),

  #[error("parsing user config: {0}")]
  Parse(#[source] serde_json::Error),

  #[error("serializing user config: {0}")]
  Serialize(#[source] serde_json::Error),
}

/// Contents of `~/.bosh_micro.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserConfig {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub deployment: Option<PathBuf>,
}

impl UserConfig {
  /// Path of the deployment state file for the configured manifest.
  ///
  /// The state file lives next to the manifest so that per-deployment state
  /// follows the deployment it describes.
  pub fn deployment_state_path(&self) -> Option<PathBuf> {
    let manifest = self.deployment.as_ref()?;
    Some(manifest.parent().unwrap_or(Path::new(".")).join("deployment.json"))
  }
}

/// Loads and saves the user config file.
#[derive(Debug, Clone)]
pub struct UserConfigService {
  path: PathBuf,
}

impl UserConfigService {
  /// Service over the default location (`$BOSH_MICRO_HOME` or `$HOME`).
  pub fn default_service() -> Result<Self, ConfigError> {
    let base = match std::env::var_os("BOSH_MICRO_HOME") {
      Some(dir) => PathBuf::from(dir),
      None => dirs::home_dir().ok_or(ConfigError::NoHome)?,
    };
    Ok(Self::new(base.join(USER_CONFIG_FILENAME)))
  }

  pub fn new(path: PathBuf) -> Self {
    Self { path }
  }

  /// Load the config; a missing file yields the default.
  pub fn load(&self) -> Result<UserConfig, ConfigError> {
    let content = match fs::read_to_string(&self.path) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(UserConfig::default()),
      Err(e) => return Err(ConfigError::Read(e)),
    };
    serde_json::from_str(&content).map_err(ConfigError::Parse)
  }

  /// Save the config atomically (write temp, then rename).
  pub fn save(&self, config: &UserConfig) -> Result<(), ConfigError> {
    if let Some(parent) = self.path.parent() {
      fs::create_dir_all(parent).map_err(ConfigError::Write)?;
    }

    let content = serde_json::to_string_pretty(config).map_err(ConfigError::Serialize)?;
    let temp_path = self.path.with_extension("json.tmp");
    fs::write(&temp_path, &content).map_err(ConfigError::Write)?;
    fs::rename(&temp_path, &self.path).map_err(ConfigError::Write)?;

    Ok(())
  }
}
