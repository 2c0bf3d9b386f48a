//! Property store implementations.
//!
//! - [`MemoryPropertyStore`]: process-lifetime map, used for dry runs and tests
//! - [`TomlPropertyStore`]: one TOML file holding a table per device
//!
//! The file layout keeps device names as quoted table keys:
//!
//! ```toml
//! ["lab/rotator/1"]
//! num_operations = "4211"
//! ```

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use stage_core::PropertyStore;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// In-memory property store.
#[derive(Debug, Default)]
pub struct MemoryPropertyStore {
    values: RwLock<HashMap<(String, String), String>>,
}

impl MemoryPropertyStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored properties.
    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    /// Whether nothing has been stored.
    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }
}

impl PropertyStore for MemoryPropertyStore {
    fn get(&self, device: &str, attribute: &str) -> Result<Option<String>> {
        Ok(self
            .values
            .read()
            .get(&(device.to_string(), attribute.to_string()))
            .cloned())
    }

    fn put(&self, device: &str, attribute: &str, value: &str) -> Result<()> {
        self.values
            .write()
            .insert((device.to_string(), attribute.to_string()), value.to_string());
        Ok(())
    }
}

/// File-backed property store.
///
/// Every `put` rewrites the whole file through a temporary sibling and a
/// rename, so a crash mid-write leaves the previous contents in place. The
/// file is re-read on every access; several devices may share one file.
#[derive(Debug)]
pub struct TomlPropertyStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process
    write_lock: Mutex<()>,
}

impl TomlPropertyStore {
    /// Use `path` as backing file. The file is created on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_table(&self) -> Result<toml::Table> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => text
                .parse::<toml::Table>()
                .with_context(|| format!("Malformed property file {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(toml::Table::new()),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to read property file {}", self.path.display())),
        }
    }

    fn write_table(&self, table: &toml::Table) -> Result<()> {
        let text = toml::to_string(table).context("Failed to serialize properties")?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let tmp = self.path.with_extension("toml.tmp");
        std::fs::write(&tmp, text)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

impl PropertyStore for TomlPropertyStore {
    fn get(&self, device: &str, attribute: &str) -> Result<Option<String>> {
        let table = self.read_table()?;
        let value = table
            .get(device)
            .and_then(toml::Value::as_table)
            .and_then(|props| props.get(attribute))
            .map(|value| match value {
                toml::Value::String(s) => s.clone(),
                other => other.to_string(),
            });
        Ok(value)
    }

    fn put(&self, device: &str, attribute: &str, value: &str) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut table = self.read_table()?;

        let entry = table
            .entry(device.to_string())
            .or_insert_with(|| toml::Value::Table(toml::Table::new()));
        let props = entry.as_table_mut().with_context(|| {
            format!("Property file entry for '{}' is not a table", device)
        })?;
        props.insert(attribute.to_string(), toml::Value::String(value.to_string()));

        self.write_table(&table)
    }
}
