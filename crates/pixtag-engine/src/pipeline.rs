use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Context;
use pixtag_contracts::events::PipelineEvent;
use pixtag_contracts::normalize::{
    normalize_caption, recover_structured, Recovered, StructuredMetadata,
};
use pixtag_contracts::records::{FileRecord, RecordStore};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::client::{Generator, METADATA_SAMPLING};
use crate::config::RunConfig;
use crate::control::RunControl;
use crate::detect::{ChangeDecision, ChangeDetector, FileFacts};
use crate::exiftool::{value_text, MetadataEditor};
use crate::image_prep::{guess_image_mime, ImagePreparer};
use crate::merge::{MergeStatus, MetadataMerger};

pub const METADATA_INSTRUCTION: &str = "The following caption and metadata was given for an image. Use that to determine the title, IPTC keywords, summary, and subject. Return as JSON object with keys Title, Keywords, Summary, and Subject.\n";

/// Existing fields that would only echo what the model is asked to produce.
const PROMPT_SKIPPED_TAGS: [&str; 5] = ["Keywords", "Description", "Title", "Subject", "Caption"];

/// Rough token estimate: four characters per token, rounded up.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// `Tag is value` lines for the existing metadata, group prefixes stripped.
pub fn metadata_lines(exif: &Map<String, Value>) -> Vec<String> {
    exif.iter()
        .filter_map(|(key, value)| {
            let tag = key.rsplit(':').next().unwrap_or(key);
            if PROMPT_SKIPPED_TAGS.contains(&tag) {
                return None;
            }
            Some(format!("{tag} is {}", value_text(value)))
        })
        .collect()
}

fn compose_metadata_prompt(lines: &[String], caption: &str) -> String {
    let mut prompt = String::from("Metadata:\n");
    for line in lines {
        prompt.push_str(line);
        prompt.push('\n');
    }
    if !caption.is_empty() {
        prompt.push_str("\nCaption: ");
        prompt.push_str(caption);
    }
    prompt.trim_end().to_string()
}

/// Content for the structured-metadata call. When the context size is known,
/// metadata lines are dropped from the end until instruction, content and
/// the reply length fit.
pub fn build_metadata_prompt(
    exif: &Map<String, Value>,
    caption: &str,
    max_context: Option<u64>,
) -> String {
    let mut lines = metadata_lines(exif);
    let mut prompt = compose_metadata_prompt(&lines, caption);
    let Some(limit) = max_context else {
        return prompt;
    };
    let fixed = estimate_tokens(METADATA_INSTRUCTION) + u64::from(METADATA_SAMPLING.max_length);
    while !lines.is_empty() && fixed + estimate_tokens(&prompt) > limit {
        lines.pop();
        prompt = compose_metadata_prompt(&lines, caption);
    }
    prompt
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotAnImage,
    UpToDate,
    UnsupportedImage,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NotAnImage => "Not an image file",
            Self::UpToDate => "Up to date",
            Self::UnsupportedImage => "Not a supported image type",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedFile {
    pub path: PathBuf,
    pub record: FileRecord,
    pub merge: MergeStatus,
}

/// What happened to one candidate file.
#[derive(Debug, Clone, PartialEq)]
pub enum FileOutcome {
    Processed(ProcessedFile),
    Skipped { path: PathBuf, reason: SkipReason },
    Failed { path: PathBuf, error: String },
}

impl FileOutcome {
    pub fn path(&self) -> &Path {
        match self {
            Self::Processed(processed) => &processed.path,
            Self::Skipped { path, .. } | Self::Failed { path, .. } => path,
        }
    }

    pub fn to_event(&self) -> PipelineEvent {
        match self {
            Self::Processed(processed) => PipelineEvent::FileProcessed {
                path: processed.record.relative_path.clone(),
                caption: processed.record.caption.clone(),
                llm_metadata: processed.record.llm_metadata.clone(),
                merge: processed.merge.as_str().to_string(),
            },
            Self::Skipped { path, reason } => PipelineEvent::FileSkipped {
                path: path.display().to_string(),
                reason: reason.to_string(),
            },
            Self::Failed { path, error } => PipelineEvent::FileFailed {
                path: path.display().to_string(),
                error: error.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunStatus {
    #[default]
    Completed,
    Stopped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    pub status: RunStatus,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Stopped => "stopped",
        }
    }
}

impl RunReport {
    fn count(&mut self, outcome: &FileOutcome) {
        match outcome {
            FileOutcome::Processed(_) => self.processed += 1,
            FileOutcome::Skipped { .. } => self.skipped += 1,
            FileOutcome::Failed { .. } => self.failed += 1,
        }
    }

    pub fn to_event(&self) -> PipelineEvent {
        PipelineEvent::RunFinished {
            status: self.status.as_str().to_string(),
            processed: self.processed,
            skipped: self.skipped,
            failed: self.failed,
        }
    }
}

/// Lazy walk of the crawl root; directories are read only when reached.
fn walk_candidates(config: &RunConfig) -> impl Iterator<Item = PathBuf> {
    let store_path = config.store_path();
    let max_depth = if config.no_crawl { 1 } else { usize::MAX };
    WalkDir::new(config.root())
        .max_depth(max_depth)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(error = %err, "skipping unreadable directory entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(move |path| *path != store_path)
}

/// Sequential crawl: one file is fully handled before the next is looked at.
pub struct Pipeline<'a, G: Generator + ?Sized, E: MetadataEditor + ?Sized> {
    config: &'a RunConfig,
    generator: &'a G,
    editor: &'a E,
    store: RecordStore,
    detector: ChangeDetector,
    control: RunControl,
}

impl<'a, G: Generator + ?Sized, E: MetadataEditor + ?Sized> Pipeline<'a, G, E> {
    pub fn new(
        config: &'a RunConfig,
        generator: &'a G,
        editor: &'a E,
        store: RecordStore,
        control: RunControl,
    ) -> Self {
        Self {
            config,
            generator,
            editor,
            store,
            detector: ChangeDetector::new(config.change_policy()),
            control,
        }
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Candidate files under the crawl root in file-name order. The record
    /// store itself is never a candidate.
    pub fn candidates(&self) -> Vec<PathBuf> {
        walk_candidates(self.config).collect()
    }

    /// Runs the crawl, handing every outcome to `sink`. Per-file faults never
    /// end the run; only a stop request does.
    pub fn run(&mut self, mut sink: impl FnMut(FileOutcome)) -> RunReport {
        let mut report = RunReport::default();
        for path in walk_candidates(self.config) {
            if self.control.checkpoint().is_err() {
                info!(path = %path.display(), "run stopped before file");
                report.status = RunStatus::Stopped;
                return report;
            }
            let outcome = match self.process(&path) {
                Ok(outcome) => outcome,
                Err(err) => FileOutcome::Failed {
                    path: path.clone(),
                    error: format!("{err:#}"),
                },
            };
            match &outcome {
                FileOutcome::Skipped { reason, .. } => {
                    info!(path = %path.display(), reason = %reason, "skipping file")
                }
                FileOutcome::Failed { error, .. } => {
                    warn!(path = %path.display(), error = %error, "file failed")
                }
                FileOutcome::Processed(_) => {}
            }
            report.count(&outcome);
            sink(outcome);
        }
        report
    }

    fn process(&mut self, path: &Path) -> anyhow::Result<FileOutcome> {
        let skipped = |reason| {
            Ok(FileOutcome::Skipped {
                path: path.to_path_buf(),
                reason,
            })
        };

        let Some(mime) = guess_image_mime(path) else {
            return skipped(SkipReason::NotAnImage);
        };
        let mut facts = FileFacts::collect(path, self.config.root())?;
        let decision = self.detector.check(&self.store, &facts);
        if decision == ChangeDecision::UpToDate {
            return skipped(SkipReason::UpToDate);
        }
        debug!(path = %path.display(), decision = ?decision, "processing file");

        let exif = self.editor.read_metadata(path).unwrap_or_else(|err| {
            warn!(path = %path.display(), error = %format!("{err:#}"), "metadata read failed");
            Map::new()
        });

        let Some(source) = ImagePreparer::new(self.editor).prepare(path, mime) else {
            return skipped(SkipReason::UnsupportedImage);
        };
        let image_bytes = source
            .read_bytes()
            .with_context(|| format!("failed to read image data for {}", path.display()))?;

        let caption = match self
            .generator
            .caption(&image_bytes, &self.config.image_instruction)
        {
            Some(raw) => normalize_caption(&raw),
            None => {
                warn!(path = %path.display(), "no caption returned");
                String::new()
            }
        };

        let content = build_metadata_prompt(&exif, &caption, self.generator.max_context());
        let metadata = match self.generator.generate(METADATA_INSTRUCTION, &content) {
            Some(raw) => {
                let recovery = recover_structured(&raw);
                debug!(
                    path = %path.display(),
                    extraction = ?recovery.extraction,
                    step = ?recovery.step,
                    "structured recovery"
                );
                match recovery.result {
                    Recovered::Mapping(fields) => StructuredMetadata::from_map(fields),
                    Recovered::Unparsed(text) => {
                        warn!(path = %path.display(), output = %text, "no structured metadata recovered");
                        StructuredMetadata::default()
                    }
                }
            }
            None => {
                warn!(path = %path.display(), "no structured metadata returned");
                StructuredMetadata::default()
            }
        };

        let merge = MetadataMerger::new(self.editor, self.config.write).apply(path, &metadata, &caption);
        if merge == MergeStatus::Failed {
            return Ok(FileOutcome::Failed {
                path: path.to_path_buf(),
                error: "metadata write failed".to_string(),
            });
        }
        if merge == MergeStatus::Written {
            facts.refresh(path)?;
        }

        let caption = (!caption.is_empty()).then_some(caption);
        let record = facts.into_record(exif, caption, metadata);
        if !self.config.write.dry_run {
            self.store.upsert(&record)?;
        }
        Ok(FileOutcome::Processed(ProcessedFile {
            path: path.to_path_buf(),
            record,
            merge,
        }))
    }
}
