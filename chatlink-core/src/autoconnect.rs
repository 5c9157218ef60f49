//! Which connections to bring back after a restart.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{config_dir, write_toml};
use crate::error::ConfigError;

/// A connection that was wanted when the list was saved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoconnectEntry {
    pub id: Uuid,
    /// Channels joined at save time.
    #[serde(default)]
    pub channels: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AutoconnectFile {
    #[serde(default)]
    connections: Vec<AutoconnectEntry>,
}

/// Storage for the autoconnect list.
pub trait AutoconnectStore: Send + Sync {
    fn load(&self) -> Result<Vec<AutoconnectEntry>, ConfigError>;
    fn save(&self, entries: &[AutoconnectEntry]) -> Result<(), ConfigError>;
}

/// `autoconnect.toml` next to the config file.
pub fn autoconnect_path() -> PathBuf {
    config_dir().join("autoconnect.toml")
}

/// TOML-file backed store.
pub struct TomlAutoconnectStore {
    path: PathBuf,
    write: Mutex<()>,
}

impl TomlAutoconnectStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AutoconnectStore for TomlAutoconnectStore {
    fn load(&self) -> Result<Vec<AutoconnectEntry>, ConfigError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let text = std::fs::read_to_string(&self.path).map_err(|source| ConfigError::Read {
            path: self.path.clone(),
            source,
        })?;
        let file: AutoconnectFile = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: self.path.clone(),
            source,
        })?;
        Ok(file.connections)
    }

    fn save(&self, entries: &[AutoconnectEntry]) -> Result<(), ConfigError> {
        let file = AutoconnectFile {
            connections: entries.to_vec(),
        };
        let text = toml::to_string_pretty(&file)?;
        let _guard = self.write.lock();
        write_toml(&self.path, &text)
    }
}

/// In-memory store, for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryAutoconnectStore {
    entries: Mutex<Vec<AutoconnectEntry>>,
    saves: Mutex<usize>,
}

impl MemoryAutoconnectStore {
    pub fn with_entries(entries: Vec<AutoconnectEntry>) -> Self {
        Self {
            entries: Mutex::new(entries),
            saves: Mutex::new(0),
        }
    }

    pub fn entries(&self) -> Vec<AutoconnectEntry> {
        self.entries.lock().clone()
    }

    /// Number of `save` calls so far.
    pub fn save_count(&self) -> usize {
        *self.saves.lock()
    }
}

impl AutoconnectStore for MemoryAutoconnectStore {
    fn load(&self) -> Result<Vec<AutoconnectEntry>, ConfigError> {
        Ok(self.entries.lock().clone())
    }

    fn save(&self, entries: &[AutoconnectEntry]) -> Result<(), ConfigError> {
        *self.entries.lock() = entries.to_vec();
        *self.saves.lock() += 1;
        Ok(())
    }
}
