//! [`ConfigStore`] implementations: in-memory and TOML file.

use crate::config::ConfigStore;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Volatile store, used by tests and when no persistence is wanted.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, u32>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.lock().is_empty()
    }
}

impl ConfigStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<u32>> {
        Ok(self.values.lock().get(key).copied())
    }

    fn set(&self, key: &str, value: u32) -> Result<()> {
        self.values.lock().insert(key.to_string(), value);
        Ok(())
    }
}

/// Flat `key = value` TOML file.
///
/// The whole table is cached; every `set` rewrites the file through a
/// temporary sibling and a rename.
#[derive(Debug)]
pub struct TomlFileStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, u32>>,
}

impl TomlFileStore {
    /// Open `path`, treating a missing file as an empty table.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let values = match std::fs::read_to_string(&path) {
            Ok(text) => toml::from_str::<BTreeMap<String, u32>>(&text)
                .map_err(|e| Error::Store(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        debug!("opened config store {} ({} keys)", path.display(), values.len());

        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, values: &BTreeMap<String, u32>) -> Result<()> {
        let text = toml::to_string(values).map_err(|e| Error::Store(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let tmp = self.path.with_extension("toml.tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl ConfigStore for TomlFileStore {
    fn get(&self, key: &str) -> Result<Option<u32>> {
        Ok(self.values.lock().get(key).copied())
    }

    fn set(&self, key: &str, value: u32) -> Result<()> {
        let mut values = self.values.lock();
        values.insert(key.to_string(), value);
        self.persist(&values)
    }
}
