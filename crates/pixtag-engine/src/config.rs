use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::bail;
use serde::{Deserialize, Serialize};

use crate::client::ClientSettings;
use crate::detect::ChangePolicy;
use crate::merge::WriteOptions;

pub const STORE_FILE_NAME: &str = "filedata.json";
pub const DEFAULT_API_URL: &str = "http://localhost:5001";
pub const DEFAULT_IMAGE_INSTRUCTION: &str =
    "What do you see in the image? Be specific and descriptive";
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Everything one crawl needs to know.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub directory: PathBuf,
    pub api_url: String,
    #[serde(skip_serializing)]
    pub api_password: String,
    /// Only look at direct children of `directory`.
    pub no_crawl: bool,
    pub force_rehash: bool,
    pub reprocess_all: bool,
    pub write: WriteOptions,
    pub image_instruction: String,
    /// Defaults to `<directory>/filedata.json`.
    pub store_path: Option<PathBuf>,
    pub exiftool_path: PathBuf,
    pub timeout_secs: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            api_url: DEFAULT_API_URL.to_string(),
            api_password: String::new(),
            no_crawl: false,
            force_rehash: false,
            reprocess_all: false,
            write: WriteOptions::default(),
            image_instruction: DEFAULT_IMAGE_INSTRUCTION.to_string(),
            store_path: None,
            exiftool_path: PathBuf::from("exiftool"),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl RunConfig {
    pub fn for_directory(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Self::default()
        }
    }

    pub fn root(&self) -> &Path {
        &self.directory
    }

    pub fn store_path(&self) -> PathBuf {
        self.store_path
            .clone()
            .unwrap_or_else(|| self.directory.join(STORE_FILE_NAME))
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            api_url: self.api_url.clone(),
            api_password: self.api_password.clone(),
            timeout: Duration::from_secs(self.timeout_secs.max(1)),
        }
    }

    pub fn change_policy(&self) -> ChangePolicy {
        ChangePolicy {
            reprocess_all: self.reprocess_all,
            force_rehash: self.force_rehash,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.directory.is_dir() {
            bail!("{} is not a directory", self.directory.display());
        }
        if self.api_url.trim().is_empty() {
            bail!("api url must not be empty");
        }
        if self.image_instruction.trim().is_empty() {
            bail!("image instruction must not be empty");
        }
        Ok(())
    }
}
