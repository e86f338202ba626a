use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context};
use indexmap::IndexMap;
use serde_json::{Map, Value};
use tracing::debug;

/// Fully qualified tag name to value, in write order. List values are
/// written as repeated assignments.
pub type TagSet = IndexMap<String, Value>;

/// Values whose text form reaches this length are dropped on read.
pub const MAX_METADATA_VALUE_CHARS: usize = 1000;

const PREVIEW_TAGS: [&str; 2] = ["JpgFromRaw", "PreviewImage"];

/// The external tool that reads and writes container metadata.
pub trait MetadataEditor {
    /// Flat `Group:Tag` mapping, already filtered of binary and over-long
    /// values.
    fn read_metadata(&self, path: &Path) -> anyhow::Result<Map<String, Value>>;

    /// Raw bytes of an embedded preview image, when the container has one.
    fn embedded_preview(&self, path: &Path) -> Option<Vec<u8>>;

    fn write_tags(&self, path: &Path, tags: &TagSet, overwrite: bool) -> anyhow::Result<()>;
}

/// [`MetadataEditor`] backed by the `exiftool` executable.
#[derive(Debug, Clone)]
pub struct ExifTool {
    binary: PathBuf,
}

impl Default for ExifTool {
    fn default() -> Self {
        Self::new("exiftool")
    }
}

impl ExifTool {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn run(&self, args: &[String], path: &Path) -> anyhow::Result<Vec<u8>> {
        let output = Command::new(&self.binary)
            .args(args)
            .arg(path)
            .output()
            .with_context(|| format!("failed to spawn {}", self.binary.display()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{} exited with status {}: {}",
                self.binary.display(),
                output.status,
                stderr.trim()
            );
        }
        Ok(output.stdout)
    }
}

impl MetadataEditor for ExifTool {
    fn read_metadata(&self, path: &Path) -> anyhow::Result<Map<String, Value>> {
        let args = ["-j", "-G", "-n"].map(str::to_string);
        let stdout = self.run(&args, path)?;
        let parsed: Value = serde_json::from_slice(&stdout)
            .with_context(|| format!("unreadable exiftool output for {}", path.display()))?;
        let first = parsed
            .as_array()
            .and_then(|rows| rows.first())
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        Ok(filter_metadata(first))
    }

    fn embedded_preview(&self, path: &Path) -> Option<Vec<u8>> {
        for tag in PREVIEW_TAGS {
            let args = ["-b".to_string(), format!("-{tag}")];
            match self.run(&args, path) {
                Ok(bytes) if !bytes.is_empty() => {
                    debug!(path = %path.display(), tag, "using embedded preview");
                    return Some(bytes);
                }
                Ok(_) => {}
                Err(err) => debug!(path = %path.display(), tag, error = %err, "no embedded preview"),
            }
        }
        None
    }

    fn write_tags(&self, path: &Path, tags: &TagSet, overwrite: bool) -> anyhow::Result<()> {
        if tags.is_empty() {
            return Ok(());
        }
        let mut args = Vec::new();
        if overwrite {
            args.push("-overwrite_original".to_string());
            args.push("-P".to_string());
        }
        args.extend(tag_assignments(tags));
        self.run(&args, path)
            .with_context(|| format!("failed writing tags to {}", path.display()))?;
        Ok(())
    }
}

/// Drops `SourceFile`, binary placeholders and values too long to be useful
/// as prompt context.
pub fn filter_metadata(raw: Map<String, Value>) -> Map<String, Value> {
    raw.into_iter()
        .filter(|(key, _)| key != "SourceFile")
        .filter(|(_, value)| {
            let text = value_text(value);
            !text.starts_with("(Binary data") && text.chars().count() < MAX_METADATA_VALUE_CHARS
        })
        .collect()
}

/// `-TAG=value` arguments; lists expand to one assignment per element.
pub fn tag_assignments(tags: &TagSet) -> Vec<String> {
    let mut args = Vec::new();
    for (tag, value) in tags {
        match value {
            Value::Array(items) => {
                for item in items {
                    args.push(format!("-{tag}={}", value_text(item)));
                }
            }
            other => args.push(format!("-{tag}={}", value_text(other))),
        }
    }
    args
}

pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
