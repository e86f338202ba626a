use std::path::Path;

use pixtag_contracts::normalize::{StructuredMetadata, KEYWORDS, SUBJECT, SUMMARY, TITLE};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::exiftool::{MetadataEditor, TagSet};

pub const KEYWORDS_TAG: &str = "IPTC:Keywords";
pub const TITLE_TAG: &str = "XMP-dc:Title";
pub const SUBJECT_TAG: &str = "XMP-dc:Subject";
pub const DESCRIPTION_TAG: &str = "XMP-dc:Description";
pub const CAPTION_TAG: &str = "IPTC:Caption-Abstract";

/// Which synthesized fields reach the file, and how.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteOptions {
    pub keywords: bool,
    pub title: bool,
    pub subject: bool,
    /// Writes the `Summary` field as the description.
    pub description: bool,
    pub caption: bool,
    /// Edit in place instead of leaving an `_original` backup.
    pub overwrite: bool,
    pub dry_run: bool,
}

impl WriteOptions {
    pub fn any_field(&self) -> bool {
        self.keywords || self.title || self.subject || self.description || self.caption
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStatus {
    Written,
    DryRun,
    /// Nothing enabled and present, so no write was attempted.
    Nothing,
    Failed,
}

impl MergeStatus {
    pub fn is_success(self) -> bool {
        !matches!(self, Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Written => "written",
            Self::DryRun => "dry_run",
            Self::Nothing => "nothing",
            Self::Failed => "failed",
        }
    }
}

/// Tags for the enabled fields that the metadata actually carries.
pub fn build_tag_set(metadata: &StructuredMetadata, caption: &str, options: &WriteOptions) -> TagSet {
    let mut tags = TagSet::new();
    if options.keywords && metadata.contains(KEYWORDS) {
        let keywords = metadata.keywords();
        if !keywords.is_empty() {
            tags.insert(KEYWORDS_TAG.to_string(), Value::from(keywords));
        }
    }
    if options.title && metadata.contains(TITLE) {
        if let Some(title) = metadata.title() {
            tags.insert(TITLE_TAG.to_string(), Value::String(title));
        }
    }
    if options.subject && metadata.contains(SUBJECT) {
        let subjects = metadata.subject();
        if !subjects.is_empty() {
            tags.insert(SUBJECT_TAG.to_string(), Value::from(subjects));
        }
    }
    if options.description && metadata.contains(SUMMARY) {
        if let Some(summary) = metadata.summary() {
            tags.insert(DESCRIPTION_TAG.to_string(), Value::String(summary));
        }
    }
    let caption = caption.trim();
    if options.caption && !caption.is_empty() {
        tags.insert(CAPTION_TAG.to_string(), Value::String(caption.to_string()));
    }
    tags
}

/// Writes synthesized fields into a file through a [`MetadataEditor`].
pub struct MetadataMerger<'a, E: MetadataEditor + ?Sized> {
    editor: &'a E,
    options: WriteOptions,
}

impl<'a, E: MetadataEditor + ?Sized> MetadataMerger<'a, E> {
    pub fn new(editor: &'a E, options: WriteOptions) -> Self {
        Self { editor, options }
    }

    pub fn options(&self) -> &WriteOptions {
        &self.options
    }

    /// Never returns an error: editor failures are logged and reported as
    /// [`MergeStatus::Failed`].
    pub fn apply(&self, path: &Path, metadata: &StructuredMetadata, caption: &str) -> MergeStatus {
        let tags = build_tag_set(metadata, caption, &self.options);
        if self.options.dry_run {
            info!(path = %path.display(), tags = tags.len(), "dry run, file not updated");
            return MergeStatus::DryRun;
        }
        if tags.is_empty() {
            return MergeStatus::Nothing;
        }
        match self.editor.write_tags(path, &tags, self.options.overwrite) {
            Ok(()) => {
                info!(path = %path.display(), tags = tags.len(), "updated metadata tags");
                MergeStatus::Written
            }
            Err(err) => {
                warn!(path = %path.display(), error = %format!("{err:#}"), "metadata write failed");
                MergeStatus::Failed
            }
        }
    }
}
