use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::normalize::StructuredMetadata;

/// Persisted state for one file, keyed by `relative_path`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    /// Path below the crawl root, always `/`-separated.
    pub relative_path: String,
    pub size: u64,
    #[serde(default)]
    pub created: Option<String>,
    #[serde(default)]
    pub modified: Option<String>,
    /// Lowercase, including the leading dot; empty when the file has none.
    pub extension: String,
    pub file_hash: String,
    #[serde(default)]
    pub exif_metadata: Map<String, Value>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub llm_metadata: StructuredMetadata,
}
