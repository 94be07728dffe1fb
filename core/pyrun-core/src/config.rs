//! Storage paths and runner configuration.
//!
//! Production code uses `StorageConfig::default()` which points at `~/.pyrun/`.
//! Tests use `StorageConfig::with_root(temp_dir)` for isolation.
//!
//! `RunnerConfig` is read from `config.json` under the storage root. Every
//! field has a default, so a missing file is the same as an empty one.
//! Environment variables override the file.

use fs_err as fs;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

pub const PYTHON_ENV: &str = "PYRUN_PYTHON";
pub const POLL_INTERVAL_ENV: &str = "PYRUN_POLL_INTERVAL_MS";
pub const DEBUG_LOG_ENV: &str = "PYRUN_DEBUG_LOG";

const PYTHON_PROGRAM: &str = "python3";
const PYTHON_PROGRAM_FALLBACK: &str = "python";

#[derive(Debug, Clone)]
pub struct StorageConfig {
    root: PathBuf,
}

impl StorageConfig {
    pub fn from_home() -> Result<Self, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
        Ok(Self {
            root: home.join(".pyrun"),
        })
    }

    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.json")
    }

    /// Last selected project root and entry point.
    pub fn selection_file(&self) -> PathBuf {
        self.root.join("selection.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunnerConfig {
    /// Interpreter program; resolved from PATH when absent.
    pub python: Option<PathBuf>,
    /// Type-check scheduler poll interval.
    pub poll_interval_ms: u64,
    /// How often the execution thread looks at the interrupt flag.
    pub interrupt_poll_ms: u64,
    /// Grace period between interrupting and killing the interpreter; 0 never kills.
    pub interrupt_escalation_ms: u64,
    /// File-name glob for the watched sources.
    pub watch_pattern: String,
    pub requirements_file: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            python: None,
            poll_interval_ms: 100,
            interrupt_poll_ms: 10,
            interrupt_escalation_ms: 2_000,
            watch_pattern: "*.py".to_string(),
            requirements_file: "requirements.txt".to_string(),
        }
    }
}

impl RunnerConfig {
    /// Loads `config.json` (if present) and applies environment overrides.
    pub fn load(storage: &StorageConfig) -> Result<Self, ConfigError> {
        let mut config = Self::load_file(&storage.config_file())?;
        config.apply_env(|name| env::var(name).ok())?;
        Ok(config)
    }

    fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => {
                return Err(ConfigError::Malformed {
                    path: path.to_path_buf(),
                    details: err.to_string(),
                })
            }
        };
        serde_json::from_str(&content).map_err(|err| ConfigError::Malformed {
            path: path.to_path_buf(),
            details: err.to_string(),
        })
    }

    fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(python) = lookup(PYTHON_ENV).filter(|value| !value.trim().is_empty()) {
            self.python = Some(PathBuf::from(python));
        }
        if let Some(value) = lookup(POLL_INTERVAL_ENV) {
            self.poll_interval_ms = value
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|ms| *ms > 0)
                .ok_or_else(|| ConfigError::InvalidEnv {
                    name: POLL_INTERVAL_ENV,
                    value: value.clone(),
                })?;
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn interrupt_poll(&self) -> Duration {
        Duration::from_millis(self.interrupt_poll_ms.max(1))
    }

    pub fn interrupt_escalation(&self) -> Option<Duration> {
        match self.interrupt_escalation_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Explicit setting first, then `python3`, then `python` on PATH.
    pub fn resolve_python(&self) -> Result<PathBuf, ConfigError> {
        if let Some(python) = &self.python {
            return Ok(python.clone());
        }
        which::which(PYTHON_PROGRAM)
            .or_else(|_| which::which(PYTHON_PROGRAM_FALLBACK))
            .map_err(|_| ConfigError::PythonNotFound)
    }
}

/// Truthy values accepted by boolean environment switches.
pub fn env_flag_enabled(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "yes" | "YES")
}
