//! Persistent key/value preferences.
//!
//! The session reads its startup configuration from a [`PreferenceStore`]
//! and writes user choices back. [`MemoryPreferences`] keeps everything in
//! memory; [`FilePreferences`] mirrors a TOML table on disk and rewrites
//! the file on every change.

use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use toml::{Table, Value};
use tracing::{debug, info};

use crate::error::LinkError;

/// Typed key/value store.
pub trait PreferenceStore: Send + Sync {
    fn get_string(&self, key: &str) -> Option<String>;

    fn set_string(&self, key: &str, value: &str) -> Result<(), LinkError>;

    /// Stored flag, or `default` when absent or not a boolean.
    fn get_bool(&self, key: &str, default: bool) -> bool;

    fn set_bool(&self, key: &str, value: bool) -> Result<(), LinkError>;
}

fn string_of(table: &Table, key: &str) -> Option<String> {
    table.get(key).and_then(Value::as_str).map(str::to_string)
}

fn bool_of(table: &Table, key: &str, default: bool) -> bool {
    table.get(key).and_then(Value::as_bool).unwrap_or(default)
}

// ── MemoryPreferences ────────────────────────────────────────────

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryPreferences {
    table: RwLock<Table>,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferenceStore for MemoryPreferences {
    fn get_string(&self, key: &str) -> Option<String> {
        string_of(&self.table.read(), key)
    }

    fn set_string(&self, key: &str, value: &str) -> Result<(), LinkError> {
        self.table.write().insert(key.to_string(), Value::String(value.to_string()));
        Ok(())
    }

    fn get_bool(&self, key: &str, default: bool) -> bool {
        bool_of(&self.table.read(), key, default)
    }

    fn set_bool(&self, key: &str, value: bool) -> Result<(), LinkError> {
        self.table.write().insert(key.to_string(), Value::Boolean(value));
        Ok(())
    }
}

// ── FilePreferences ──────────────────────────────────────────────

/// TOML-file-backed store.
#[derive(Debug)]
pub struct FilePreferences {
    path: PathBuf,
    table: RwLock<Table>,
}

impl FilePreferences {
    /// Open the store at `path`, starting empty when the file is absent.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LinkError> {
        let path = path.into();
        let table = match std::fs::read_to_string(&path) {
            Ok(text) => text.parse::<Table>().map_err(|e| {
                LinkError::Preferences(format!("{}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no preferences file, starting empty");
                Table::new()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            table: RwLock::new(table),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn update(&self, key: &str, value: Value) -> Result<(), LinkError> {
        let text = {
            let mut table = self.table.write();
            table.insert(key.to_string(), value);
            toml::to_string(&*table).map_err(|e| LinkError::Preferences(e.to_string()))?
        };
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&self.path, text)?;
        debug!(key, path = %self.path.display(), "preference saved");
        Ok(())
    }
}

impl PreferenceStore for FilePreferences {
    fn get_string(&self, key: &str) -> Option<String> {
        string_of(&self.table.read(), key)
    }

    fn set_string(&self, key: &str, value: &str) -> Result<(), LinkError> {
        self.update(key, Value::String(value.to_string()))
    }

    fn get_bool(&self, key: &str, default: bool) -> bool {
        bool_of(&self.table.read(), key, default)
    }

    fn set_bool(&self, key: &str, value: bool) -> Result<(), LinkError> {
        self.update(key, Value::Boolean(value))
    }
}

// ── Tests ────────────────────────────────────────────────────────
