//! Configuration for the `seatwatch` binary.
//!
//! Loaded from `$XDG_CONFIG_HOME/seatwatch/config.toml` when present.
//! Every field has a default, so a missing file is not an error.
//! `XDG_SESSION_ID` overrides `session_id`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::inhibit::{Mode, What};

/// Environment variable logind sets to the caller's session id.
pub const SESSION_ID_ENV: &str = "XDG_SESSION_ID";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// logind session to watch. Usually taken from `XDG_SESSION_ID`.
    pub session_id: Option<String>,

    /// Capacity of the channels handed to facilities as listeners.
    pub subscriber_buffer: usize,

    pub inhibit: InhibitConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            session_id: None,
            subscriber_buffer: 8,
            inhibit: InhibitConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InhibitConfig {
    /// Application name shown by `systemd-inhibit --list`.
    pub who: String,
    pub why: String,
    pub mode: Mode,
    pub what: Vec<What>,
}

impl Default for InhibitConfig {
    fn default() -> Self {
        Self {
            who: "seatwatch".to_string(),
            why: "Preparing for sleep".to_string(),
            mode: Mode::Delay,
            what: vec![What::Sleep],
        }
    }
}

impl Config {
    /// Default location of the config file.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("seatwatch").join("config.toml"))
    }

    /// Parses a config file, falling back to defaults if it does not exist.
    ///
    /// # Errors
    ///
    /// - `ConfigError::Read` if the file exists but cannot be read
    /// - `ConfigError::Parse` if the contents are not valid
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };

        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Applies environment overrides.
    pub fn with_env(mut self) -> Self {
        if let Ok(id) = std::env::var(SESSION_ID_ENV) {
            if !id.is_empty() {
                self.session_id = Some(id);
            }
        }
        self
    }
}
