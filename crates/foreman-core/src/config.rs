//! Configuration resolution for Foreman.
//!
//! Built-in defaults, optionally overlaid by a TOML file
//! (`~/.config/foreman/config.toml` unless an explicit path is given).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete Foreman configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub sessions: SessionSettings,
}

/// Engine-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Path to the external coding-assistant CLI binary.
    pub agent_bin: PathBuf,
    /// Database file path. `None` resolves to the default data directory.
    pub database_path: Option<PathBuf>,
    /// Maximum concurrent assistant subprocesses across all sessions.
    pub max_processes: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            agent_bin: PathBuf::from("claude"),
            database_path: None,
            max_processes: 5,
        }
    }
}

/// Work-session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Seconds a session may sit without protocol activity before the
    /// watchdog force-ends it.
    pub idle_timeout_secs: u64,
    /// How often the watchdog checks for idle sessions, in seconds.
    pub watchdog_interval_secs: u64,
    /// Seconds to wait for graceful subprocess shutdown before SIGKILL.
    pub terminate_timeout_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 30 * 60,
            watchdog_interval_secs: 30,
            terminate_timeout_secs: 5,
        }
    }
}

impl Config {
    /// Load configuration from the given path, or the default location when
    /// `None`. A missing file yields the built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let resolved = match path {
            Some(p) => p.to_path_buf(),
            None => default_config_path(),
        };

        if !resolved.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(&resolved)?;
        toml::from_str(&raw).map_err(|e| Error::Config(format!("{}: {e}", resolved.display())))
    }

    /// Resolve the database path, falling back to the default data directory.
    pub fn database_path(&self) -> PathBuf {
        self.engine.database_path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("foreman")
                .join("foreman.db")
        })
    }
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("foreman")
        .join("config.toml")
}
