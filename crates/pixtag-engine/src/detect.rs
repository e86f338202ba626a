use std::fs::File;
use std::io::Read;
use std::path::{Component, Path};
use std::time::SystemTime;

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use pixtag_contracts::normalize::StructuredMetadata;
use pixtag_contracts::records::{FileRecord, RecordStore};
use serde_json::{Map, Value};

const READ_CHUNK: usize = 64 * 1024;

/// BLAKE3 of the full file content, hex encoded.
pub fn fingerprint(path: &Path) -> anyhow::Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// `/`-separated path of `path` below `root`; the bare file name when `path`
/// is not under `root`.
pub fn relative_path(path: &Path, root: &Path) -> String {
    match path.strip_prefix(root) {
        Ok(relative) => relative
            .components()
            .filter_map(|component| match component {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/"),
        Err(_) => path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default(),
    }
}

fn rfc3339(time: std::io::Result<SystemTime>) -> Option<String> {
    time.ok()
        .map(|time| DateTime::<Utc>::from(time).to_rfc3339_opts(SecondsFormat::Secs, true))
}

/// Filesystem facts for one candidate, fingerprint included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFacts {
    pub filename: String,
    pub relative_path: String,
    pub size: u64,
    pub created: Option<String>,
    pub modified: Option<String>,
    pub extension: String,
    pub file_hash: String,
}

impl FileFacts {
    pub fn collect(path: &Path, root: &Path) -> anyhow::Result<Self> {
        let meta = std::fs::metadata(path)
            .with_context(|| format!("failed to stat {}", path.display()))?;
        Ok(Self {
            filename: path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            relative_path: relative_path(path, root),
            size: meta.len(),
            created: rfc3339(meta.created()),
            modified: rfc3339(meta.modified()),
            extension: path
                .extension()
                .map(|ext| format!(".{}", ext.to_string_lossy().to_lowercase()))
                .unwrap_or_default(),
            file_hash: fingerprint(path)?,
        })
    }

    /// Re-reads size, modification time and fingerprint after the file was
    /// rewritten in place.
    pub fn refresh(&mut self, path: &Path) -> anyhow::Result<()> {
        let meta = std::fs::metadata(path)
            .with_context(|| format!("failed to stat {}", path.display()))?;
        self.size = meta.len();
        self.modified = rfc3339(meta.modified());
        self.file_hash = fingerprint(path)?;
        Ok(())
    }

    pub fn into_record(
        self,
        exif_metadata: Map<String, Value>,
        caption: Option<String>,
        llm_metadata: StructuredMetadata,
    ) -> FileRecord {
        FileRecord {
            filename: self.filename,
            relative_path: self.relative_path,
            size: self.size,
            created: self.created,
            modified: self.modified,
            extension: self.extension,
            file_hash: self.file_hash,
            exif_metadata,
            caption,
            llm_metadata,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangePolicy {
    /// Process every candidate regardless of stored records.
    pub reprocess_all: bool,
    /// Compare fingerprints instead of trusting an existing record.
    pub force_rehash: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeDecision {
    New,
    Forced,
    Changed,
    UpToDate,
}

impl ChangeDecision {
    pub fn needs_processing(self) -> bool {
        !matches!(self, Self::UpToDate)
    }
}

/// Decides from stored records whether a file has to go through synthesis.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeDetector {
    policy: ChangePolicy,
}

impl ChangeDetector {
    pub fn new(policy: ChangePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> ChangePolicy {
        self.policy
    }

    pub fn check(&self, store: &RecordStore, facts: &FileFacts) -> ChangeDecision {
        if self.policy.reprocess_all {
            return ChangeDecision::Forced;
        }
        if !store.contains(&facts.relative_path) {
            return ChangeDecision::New;
        }
        if !self.policy.force_rehash {
            return ChangeDecision::UpToDate;
        }
        match store.get(&facts.relative_path) {
            Some(record) if record.file_hash == facts.file_hash => ChangeDecision::UpToDate,
            _ => ChangeDecision::Changed,
        }
    }

    pub fn needs_processing(&self, store: &RecordStore, facts: &FileFacts) -> bool {
        self.check(store, facts).needs_processing()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use pixtag_contracts::normalize::StructuredMetadata;
    use pixtag_contracts::records::RecordStore;
    use serde_json::Map;

    use super::*;

    fn write(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, bytes)?;
        Ok(())
    }

    #[test]
    fn fingerprint_tracks_content() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("a.jpg");
        write(&path, b"first")?;
        let first = fingerprint(&path)?;
        assert_eq!(first, blake3::hash(b"first").to_hex().to_string());
        assert_eq!(fingerprint(&path)?, first);

        write(&path, b"second")?;
        assert_ne!(fingerprint(&path)?, first);
        Ok(())
    }

    #[test]
    fn facts_use_slash_relative_path_and_lowercase_extension() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("trip").join("day 1").join("IMG_01.JPG");
        write(&path, b"12345")?;

        let facts = FileFacts::collect(&path, temp.path())?;
        assert_eq!(facts.filename, "IMG_01.JPG");
        assert_eq!(facts.relative_path, "trip/day 1/IMG_01.JPG");
        assert_eq!(facts.extension, ".jpg");
        assert_eq!(facts.size, 5);
        assert!(facts.modified.is_some());
        Ok(())
    }

    #[test]
    fn refresh_picks_up_rewritten_content() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("a.jpg");
        write(&path, b"pixels")?;
        let mut facts = FileFacts::collect(&path, temp.path())?;

        write(&path, b"pixels plus tags")?;
        facts.refresh(&path)?;
        assert_eq!(facts.size, 16);
        assert_eq!(facts.file_hash, fingerprint(&path)?);
        assert_eq!(facts.relative_path, "a.jpg");
        Ok(())
    }

    #[test]
    fn path_outside_root_falls_back_to_file_name() {
        assert_eq!(
            relative_path(Path::new("/elsewhere/x.png"), Path::new("/photos")),
            "x.png"
        );
    }

    #[test]
    fn default_policy_trusts_existing_records() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("a.jpg");
        write(&path, b"original")?;
        let mut store = RecordStore::open(temp.path().join("filedata.json"))?;
        let detector = ChangeDetector::default();

        let facts = FileFacts::collect(&path, temp.path())?;
        assert_eq!(detector.check(&store, &facts), ChangeDecision::New);

        store.upsert(&facts.into_record(Map::new(), None, StructuredMetadata::default()))?;
        write(&path, b"edited content")?;
        let edited = FileFacts::collect(&path, temp.path())?;
        assert_eq!(detector.check(&store, &edited), ChangeDecision::UpToDate);
        assert!(!detector.needs_processing(&store, &edited));
        Ok(())
    }

    #[test]
    fn force_rehash_compares_fingerprints() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("a.jpg");
        write(&path, b"original")?;
        let mut store = RecordStore::open(temp.path().join("filedata.json"))?;
        let detector = ChangeDetector::new(ChangePolicy {
            reprocess_all: false,
            force_rehash: true,
        });

        let facts = FileFacts::collect(&path, temp.path())?;
        store.upsert(&facts.clone().into_record(Map::new(), None, StructuredMetadata::default()))?;
        assert_eq!(detector.check(&store, &facts), ChangeDecision::UpToDate);

        write(&path, b"edited content")?;
        let edited = FileFacts::collect(&path, temp.path())?;
        assert_eq!(detector.check(&store, &edited), ChangeDecision::Changed);
        Ok(())
    }

    #[test]
    fn reprocess_all_ignores_records() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("a.jpg");
        write(&path, b"original")?;
        let mut store = RecordStore::open(temp.path().join("filedata.json"))?;
        let facts = FileFacts::collect(&path, temp.path())?;
        store.upsert(&facts.clone().into_record(Map::new(), None, StructuredMetadata::default()))?;

        let detector = ChangeDetector::new(ChangePolicy {
            reprocess_all: true,
            force_rehash: false,
        });
        assert_eq!(detector.check(&store, &facts), ChangeDecision::Forced);
        Ok(())
    }
}
