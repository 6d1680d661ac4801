//! qbind Configuration Module
//!
//! Persistent defaults for the `qbind` binary.
//! Config is stored in `~/.config/qbind/config.toml`.
//!
//! ## Priority Order (highest to lowest)
//!
//! 1. Command-line flags
//! 2. Environment variables (`QBIND_ENGINE`, `QBIND_MODEL`, `.env` included)
//! 3. Config file (`~/.config/qbind/config.toml`)
//! 4. Defaults

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{QueryError, Result};
use crate::scope::OnMissing;

pub const ENGINE_ENV: &str = "QBIND_ENGINE";
pub const MODEL_ENV: &str = "QBIND_MODEL";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QbindConfig {
    #[serde(default)]
    pub defaults: Defaults,
}

/// Default settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Defaults {
    /// Default engine (render, mock)
    pub engine: Option<String>,

    /// Model every query is forced onto
    pub model: Option<String>,

    /// Policy for unresolved names in `check` ("raise" or "ignore")
    pub on_missing: Option<String>,
}

impl QbindConfig {
    /// Returns `~/.config/qbind/` on Unix, `%APPDATA%/qbind/` on Windows
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("qbind")
    }

    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Load configuration from the default location
    ///
    /// Returns default config if file doesn't exist.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`
    ///
    /// Returns error if file exists but is malformed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|e| QueryError::Config {
            reason: format!("Failed to read config file: {}", e),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| QueryError::Config {
            reason: format!("Failed to parse config file: {}", e),
        })?;
        config.on_missing()?;
        Ok(config)
    }

    /// Save configuration to `path`, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                fs::create_dir_all(dir).map_err(|e| QueryError::Config {
                    reason: format!("Failed to create config directory: {}", e),
                })?;
            }
        }

        let content = toml::to_string_pretty(self).map_err(|e| QueryError::Config {
            reason: format!("Failed to serialize config: {}", e),
        })?;

        fs::write(path, content).map_err(|e| QueryError::Config {
            reason: format!("Failed to write config file: {}", e),
        })
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    /// Merge with environment variables
    ///
    /// Environment variables take precedence over config file values.
    pub fn with_env(mut self) -> Self {
        if let Ok(engine) = std::env::var(ENGINE_ENV) {
            if !engine.is_empty() {
                self.defaults.engine = Some(engine);
            }
        }

        if let Ok(model) = std::env::var(MODEL_ENV) {
            if !model.is_empty() {
                self.defaults.model = Some(model);
            }
        }

        self
    }

    /// Effective engine name (`render` when unset)
    pub fn engine(&self) -> &str {
        self.defaults.engine.as_deref().unwrap_or("render")
    }

    pub fn model(&self) -> Option<&str> {
        self.defaults.model.as_deref()
    }

    pub fn on_missing(&self) -> Result<OnMissing> {
        self.defaults
            .on_missing
            .as_deref()
            .map(str::parse::<OnMissing>)
            .transpose()
            .map(Option::unwrap_or_default)
    }
}
