//! Collaborators and orchestration for the pixtag pipeline: the generation
//! service client, exiftool, image preparation, change detection, metadata
//! merging and the per-file crawl.

pub mod client;
pub mod config;
pub mod control;
pub mod detect;
pub mod exiftool;
pub mod image_prep;
pub mod merge;
pub mod pipeline;

pub use client::{ClientSettings, GenerationClient, Generator};
pub use config::RunConfig;
pub use control::{RunControl, RunState, Stopped};
pub use exiftool::{ExifTool, MetadataEditor};
pub use pipeline::{FileOutcome, Pipeline, RunReport, RunStatus};
