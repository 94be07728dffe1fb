//! Persistence of the last selected project and entry point.
//!
//! The controller does not depend on where selections live; it talks to a
//! [`SelectionStore`]. [`JsonSelectionStore`] keeps them in `selection.json`
//! under the storage root.

use chrono::{DateTime, Utc};
use fs_err as fs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::config::StorageConfig;
use crate::error::ConfigError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_root: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_at: Option<DateTime<Utc>>,
}

impl Selection {
    pub fn new(project_root: Option<PathBuf>, entry_point: Option<PathBuf>) -> Self {
        Self {
            project_root,
            entry_point,
            saved_at: Some(Utc::now()),
        }
    }
}

pub trait SelectionStore: Send {
    fn load(&self) -> Result<Selection, ConfigError>;
    fn save(&self, selection: &Selection) -> Result<(), ConfigError>;
}

#[derive(Debug, Clone)]
pub struct JsonSelectionStore {
    path: PathBuf,
}

impl JsonSelectionStore {
    pub fn new(storage: &StorageConfig) -> Self {
        Self {
            path: storage.selection_file(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SelectionStore for JsonSelectionStore {
    /// A missing file is an empty selection.
    fn load(&self) -> Result<Selection, ConfigError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Selection::default())
            }
            Err(err) => {
                return Err(ConfigError::Malformed {
                    path: self.path.clone(),
                    details: err.to_string(),
                })
            }
        };
        serde_json::from_str(&content).map_err(|err| ConfigError::Malformed {
            path: self.path.clone(),
            details: err.to_string(),
        })
    }

    fn save(&self, selection: &Selection) -> Result<(), ConfigError> {
        let write_failed = |source| ConfigError::WriteFailed {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(write_failed)?;
        }
        let content =
            serde_json::to_string_pretty(selection).map_err(|err| ConfigError::Malformed {
                path: self.path.clone(),
                details: err.to_string(),
            })?;
        // Write-then-rename so a crash never leaves a truncated file.
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content).map_err(write_failed)?;
        fs::rename(&tmp, &self.path).map_err(write_failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_is_empty_selection() {
        let temp = TempDir::new().unwrap();
        let store = JsonSelectionStore::new(&StorageConfig::with_root(temp.path().to_path_buf()));
        assert_eq!(store.load().unwrap(), Selection::default());
    }

    #[test]
    fn save_then_load() {
        let temp = TempDir::new().unwrap();
        let store =
            JsonSelectionStore::new(&StorageConfig::with_root(temp.path().join("state")));
        let selection = Selection::new(
            Some(PathBuf::from("/work/project")),
            Some(PathBuf::from("/work/project/main.py")),
        );
        store.save(&selection).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded, selection);
        assert!(loaded.saved_at.is_some());
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn corrupt_file_is_reported() {
        let temp = TempDir::new().unwrap();
        let store = JsonSelectionStore::new(&StorageConfig::with_root(temp.path().to_path_buf()));
        std::fs::write(store.path(), "{").unwrap();
        assert!(matches!(store.load(), Err(ConfigError::Malformed { .. })));
    }
}
