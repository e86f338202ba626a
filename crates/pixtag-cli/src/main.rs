use std::io::{self, BufRead, ErrorKind};
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use pixtag_contracts::events::{EventLog, PipelineEvent};
use pixtag_contracts::records::RecordStore;
use pixtag_engine::client::{ClientSettings, GenerationClient, Generator};
use pixtag_engine::config::{
    RunConfig, DEFAULT_API_URL, DEFAULT_IMAGE_INSTRUCTION, DEFAULT_TIMEOUT_SECS,
};
use pixtag_engine::control::RunControl;
use pixtag_engine::exiftool::ExifTool;
use pixtag_engine::merge::WriteOptions;
use pixtag_engine::pipeline::{FileOutcome, Pipeline, RunReport};
use tracing::warn;
use tracing_subscriber::{filter::LevelFilter, fmt};

#[derive(Debug, Parser)]
#[command(
    name = "pixtag",
    version,
    about = "Caption and keyword images with a local generation service"
)]
struct Cli {
    /// Repeat for more log output.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Crawl a directory and write synthesized metadata into its images.
    Run(RunArgs),
    /// Query the generation service and report what it is running.
    Check(CheckArgs),
}

#[derive(Debug, Args)]
struct ServiceArgs {
    #[arg(long, env = "PIXTAG_API_URL", default_value = DEFAULT_API_URL)]
    api_url: String,
    #[arg(long, env = "PIXTAG_API_PASSWORD", default_value = "", hide_env_values = true)]
    api_password: String,
    /// Per-request timeout in seconds.
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    timeout: u64,
}

#[derive(Debug, Args)]
struct RunArgs {
    directory: PathBuf,
    #[command(flatten)]
    service: ServiceArgs,
    /// Only index the directory itself, not its subdirectories.
    #[arg(long)]
    no_crawl: bool,
    /// Compare content fingerprints of already recorded files.
    #[arg(long)]
    force_rehash: bool,
    /// Process every image even when it has a record.
    #[arg(long)]
    reprocess_all: bool,
    /// Edit files in place without keeping a backup.
    #[arg(long)]
    overwrite: bool,
    /// Generate metadata but write neither files nor records.
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    write_keywords: bool,
    #[arg(long)]
    write_title: bool,
    #[arg(long)]
    write_subject: bool,
    #[arg(long)]
    write_description: bool,
    #[arg(long)]
    write_caption: bool,
    #[arg(long, default_value = DEFAULT_IMAGE_INSTRUCTION)]
    image_instruction: String,
    /// Record store location; defaults to filedata.json in the directory.
    #[arg(long)]
    store: Option<PathBuf>,
    #[arg(long, default_value = "exiftool")]
    exiftool: PathBuf,
    /// Append progress events as JSON lines to this file.
    #[arg(long)]
    events: Option<PathBuf>,
    /// Read pause, resume and stop commands from stdin while running.
    #[arg(long)]
    interactive: bool,
}

impl RunArgs {
    fn to_config(&self) -> RunConfig {
        RunConfig {
            directory: self.directory.clone(),
            api_url: self.service.api_url.clone(),
            api_password: self.service.api_password.clone(),
            no_crawl: self.no_crawl,
            force_rehash: self.force_rehash,
            reprocess_all: self.reprocess_all,
            write: WriteOptions {
                keywords: self.write_keywords,
                title: self.write_title,
                subject: self.write_subject,
                description: self.write_description,
                caption: self.write_caption,
                overwrite: self.overwrite,
                dry_run: self.dry_run,
            },
            image_instruction: self.image_instruction.clone(),
            store_path: self.store.clone(),
            exiftool_path: self.exiftool.clone(),
            timeout_secs: self.service.timeout,
        }
    }
}

#[derive(Debug, Args)]
struct CheckArgs {
    #[command(flatten)]
    service: ServiceArgs,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("pixtag error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    init_tracing(log_level(cli.verbose));
    match cli.command {
        Command::Run(args) => run_crawl(args),
        Command::Check(args) => run_check(args),
    }
}

fn log_level(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

fn init_tracing(level: LevelFilter) {
    let subscriber = fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(io::stderr)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        warn!("Tracing subscriber already set; skipping re-initialization.");
    }
}

fn run_crawl(args: RunArgs) -> Result<i32> {
    let config = args.to_config();
    config.validate()?;
    if !config.write.any_field() && !config.write.dry_run {
        println!("No --write-* option given; files will be captioned and recorded but not tagged.");
    }

    let mut events = args.events.clone().map(EventLog::create).transpose()?;
    log_event(
        events.as_mut(),
        &PipelineEvent::RunStarted {
            config: serde_json::to_value(&config)?,
        },
    );

    let control = RunControl::new();
    if args.interactive {
        spawn_control_listener(control.clone())?;
        println!("Type 'pause', 'resume' or 'stop' and press enter to control the run.");
    }

    let (tx, rx) = mpsc::channel::<FileOutcome>();
    let worker_config = config.clone();
    let worker_control = control.clone();
    let handle = thread::Builder::new()
        .name("pixtag-pipeline".to_string())
        .spawn(move || -> Result<RunReport> {
            let client = GenerationClient::connect(&worker_config.client_settings())?;
            let editor = ExifTool::new(&worker_config.exiftool_path);
            let store = RecordStore::open(worker_config.store_path())?;
            let mut pipeline =
                Pipeline::new(&worker_config, &client, &editor, store, worker_control);
            Ok(pipeline.run(|outcome| {
                let _ = tx.send(outcome);
            }))
        })
        .context("failed to spawn pipeline thread")?;

    for outcome in rx {
        println!("{}", render_outcome(&outcome, &config.write));
        log_event(events.as_mut(), &outcome.to_event());
    }

    let report = handle
        .join()
        .map_err(|_| anyhow!("pipeline thread panicked"))??;
    log_event(events.as_mut(), &report.to_event());
    let status = report.status.as_str();
    println!(
        "Run {status}: {} processed, {} skipped, {} failed.",
        report.processed, report.skipped, report.failed
    );
    Ok(0)
}

fn run_check(args: CheckArgs) -> Result<i32> {
    let settings = ClientSettings {
        api_url: args.service.api_url,
        api_password: args.service.api_password,
        timeout: std::time::Duration::from_secs(args.service.timeout.max(1)),
    };
    let client = GenerationClient::connect(&settings)?;
    let selection = client.selection();
    let unavailable = || "unavailable".to_string();

    println!(
        "Model: {}",
        selection.model.clone().unwrap_or_else(unavailable)
    );
    println!("Template: {}", client.template().label());
    if let Some(reason) = &selection.fallback_reason {
        println!("Note: {reason}");
    }
    println!(
        "Max context: {}",
        Generator::max_context(&client)
            .map(|value| value.to_string())
            .unwrap_or_else(unavailable)
    );
    println!("Version: {}", client.version().unwrap_or_else(unavailable));
    println!(
        "Instruction tokens: {}",
        client
            .count_tokens(DEFAULT_IMAGE_INSTRUCTION)
            .map(|value| value.to_string())
            .unwrap_or_else(unavailable)
    );
    Ok(if selection.model.is_some() { 0 } else { 1 })
}

fn spawn_control_listener(control: RunControl) -> Result<()> {
    thread::Builder::new()
        .name("pixtag-control".to_string())
        .spawn(move || {
            let stdin = io::stdin();
            let mut line = String::new();
            loop {
                line.clear();
                match stdin.lock().read_line(&mut line) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
                match parse_control(&line) {
                    Some(ControlCommand::Pause) => {
                        control.pause();
                        println!("Paused; the current file will finish first.");
                    }
                    Some(ControlCommand::Resume) => {
                        control.resume();
                        println!("Resumed.");
                    }
                    Some(ControlCommand::Stop) => {
                        control.stop();
                        println!("Stopping after the current file.");
                        break;
                    }
                    None => println!("Unknown command; use pause, resume or stop."),
                }
            }
        })
        .context("failed to spawn control thread")?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlCommand {
    Pause,
    Resume,
    Stop,
}

fn parse_control(line: &str) -> Option<ControlCommand> {
    match line.trim().to_ascii_lowercase().as_str() {
        "pause" | "p" => Some(ControlCommand::Pause),
        "resume" | "r" => Some(ControlCommand::Resume),
        "stop" | "q" | "quit" => Some(ControlCommand::Stop),
        _ => None,
    }
}

fn render_outcome(outcome: &FileOutcome, write: &WriteOptions) -> String {
    match outcome {
        FileOutcome::Skipped { path, reason } => format!("Skipping {}: {reason}", path.display()),
        FileOutcome::Failed { path, error } => format!("Failed {}: {error}", path.display()),
        FileOutcome::Processed(processed) => {
            let record = &processed.record;
            let metadata = &record.llm_metadata;
            let mut text = format!("File: {}\n", record.filename);
            if write.title {
                if let Some(title) = metadata.title() {
                    text.push_str(&format!("Title: {title}\n"));
                }
            }
            if write.subject && metadata.contains("Subject") {
                text.push_str(&format!("Subject: {}\n", metadata.subject().join(", ")));
            }
            if write.keywords && metadata.contains("Keywords") {
                text.push_str(&format!("Keywords: {}\n", metadata.keywords().join(", ")));
            }
            if write.caption {
                text.push_str(&format!(
                    "Caption: {}\n",
                    record.caption.as_deref().unwrap_or("N/A")
                ));
            }
            if write.description {
                if let Some(summary) = metadata.summary() {
                    text.push_str(&format!("Description: {summary}\n"));
                }
            }
            text
        }
    }
}

fn log_event(events: Option<&mut EventLog>, event: &PipelineEvent) {
    let Some(events) = events else {
        return;
    };
    if let Err(err) = events.record(event) {
        warn!(error = %format!("{err:#}"), path = %events.path().display(), "event write failed");
    }
}
