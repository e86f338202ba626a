use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::normalize::StructuredMetadata;

/// Progress of one crawl, one JSON line each.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    RunStarted {
        config: Value,
    },
    FileProcessed {
        path: String,
        caption: Option<String>,
        llm_metadata: StructuredMetadata,
        merge: String,
    },
    FileSkipped {
        path: String,
        reason: String,
    },
    FileFailed {
        path: String,
        error: String,
    },
    RunFinished {
        status: String,
        processed: usize,
        skipped: usize,
        failed: usize,
    },
}

/// Append-only JSONL log for [`PipelineEvent`]s. Each line gets the run id
/// and a UTC timestamp next to the event fields.
#[derive(Debug)]
pub struct EventLog {
    path: PathBuf,
    run_id: String,
    file: File,
}

impl EventLog {
    /// Opens `path` for appending under a fresh run id.
    pub fn create(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        Self::with_run_id(path, uuid::Uuid::new_v4().to_string())
    }

    pub fn with_run_id(path: impl Into<PathBuf>, run_id: impl Into<String>) -> anyhow::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open event log {}", path.display()))?;
        Ok(Self {
            path,
            run_id: run_id.into(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn record(&mut self, event: &PipelineEvent) -> anyhow::Result<()> {
        let mut line = serde_json::to_value(event)?;
        if let Value::Object(fields) = &mut line {
            fields.insert("run_id".to_string(), Value::String(self.run_id.clone()));
            fields.insert(
                "ts".to_string(),
                Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)),
            );
        }
        writeln!(self.file, "{}", serde_json::to_string(&line)?)?;
        Ok(())
    }
}
