use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde_json::{Map, Value};

use super::FileRecord;

/// JSON-file store holding at most one [`FileRecord`] per relative path.
///
/// Writes flush immediately. A flush re-reads the file and only replaces the
/// keys this instance touched, so records written by another store on the
/// same file survive.
#[derive(Debug, Clone)]
pub struct RecordStore {
    path: PathBuf,
    payload: Map<String, Value>,
    dirty_keys: Vec<String>,
}

impl RecordStore {
    /// Opens the store, treating a missing file as empty. A file that exists
    /// but is not a JSON object is an error rather than something to
    /// overwrite.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let payload = if path.exists() {
            read_json_object(&path)?
        } else {
            Map::new()
        };
        Ok(Self {
            path,
            payload,
            dirty_keys: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn contains(&self, relative_path: &str) -> bool {
        self.payload.contains_key(relative_path)
    }

    /// Records that fail to deserialize are reported as absent.
    pub fn get(&self, relative_path: &str) -> Option<FileRecord> {
        self.payload
            .get(relative_path)
            .cloned()
            .and_then(|value| serde_json::from_value(value).ok())
    }

    /// Replaces the whole record stored under `record.relative_path`.
    pub fn upsert(&mut self, record: &FileRecord) -> anyhow::Result<()> {
        let key = record.relative_path.clone();
        let snapshot = serde_json::to_value(record)?;
        if self.payload.get(&key) == Some(&snapshot) {
            return Ok(());
        }
        self.payload.insert(key.clone(), snapshot);
        if !self.dirty_keys.contains(&key) {
            self.dirty_keys.push(key);
        }
        self.flush()
    }

    pub fn flush(&mut self) -> anyhow::Result<()> {
        if self.dirty_keys.is_empty() {
            return Ok(());
        }

        let mut on_disk = if self.path.exists() {
            read_json_object(&self.path).unwrap_or_else(|_| self.payload.clone())
        } else {
            Map::new()
        };
        for key in &self.dirty_keys {
            if let Some(value) = self.payload.get(key) {
                on_disk.insert(key.clone(), value.clone());
            }
        }
        write_json_object(&self.path, &on_disk)?;
        self.payload = on_disk;
        self.dirty_keys.clear();
        Ok(())
    }
}

fn read_json_object(path: &Path) -> anyhow::Result<Map<String, Value>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed reading record store {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(Map::new());
    }
    let parsed: Value = serde_json::from_str(&raw)
        .with_context(|| format!("record store {} is not valid JSON", path.display()))?;
    match parsed {
        Value::Object(payload) => Ok(payload),
        _ => bail!("record store {} is not a JSON object", path.display()),
    }
}

fn write_json_object(path: &Path, payload: &Map<String, Value>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(payload)?)
        .with_context(|| format!("failed writing record store {}", path.display()))?;
    Ok(())
}
