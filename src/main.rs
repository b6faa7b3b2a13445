// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::Level;

use modelyard::config::{self, Config, MODELS_DIR_ENV};
use modelyard::utils::{format_bytes, parse_rate};
use modelyard::{
    verify, AcquireError, ConfigurationError, DownloadStatus, LifecycleEvent, LoadError,
    ModelHub, RequestOutcome,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit codes following sysexits.h conventions
mod exit_codes {
    /// General error - unspecified error
    pub const ERROR: i32 = 1;
    /// Data error - artifact failed verification or is corrupted
    pub const DATA_ERR: i32 = 65;
    /// Internal software error - the model runtime failed
    pub const SOFTWARE: i32 = 70;
    /// Temporary failure - download failed or was cancelled; try again later
    pub const TEMP_FAIL: i32 = 75;
    /// Configuration error - unknown model, missing credential, bad config
    pub const CONFIG: i32 = 78;
}

use exit_codes::*;

#[derive(Parser)]
#[command(name = "modelyard", version = VERSION)]
#[command(about = "Download, verify and load local language models")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Override the models directory for this run
    #[arg(long, global = true, value_name = "DIR")]
    models_dir: Option<PathBuf>,

    /// Quiet mode: only warnings and errors are logged
    #[arg(short = 'q', long, global = true)]
    quiet: bool,

    /// Verbose mode: detailed output for debugging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List catalogue models and whether they are downloaded
    List,

    /// Download a model (the default model when none is given)
    ///
    /// Examples:
    ///   modelyard pull
    ///   modelyard pull tinyllama-1.1b-chat --limit 2M
    Pull {
        model: Option<String>,

        /// Bandwidth limit, e.g. 512K, 2M, 1G or bytes per second
        #[arg(long, value_parser = parse_rate)]
        limit: Option<u64>,

        /// Load and smoke-test the model once downloaded
        #[arg(long)]
        load: bool,
    },

    /// Check a downloaded artifact's size and hash
    Verify { model: Option<String> },

    /// Load a model (downloading it first if needed)
    Load {
        model: Option<String>,

        /// Prompt to run once loaded
        #[arg(short, long)]
        prompt: Option<String>,

        /// Leave the model loaded in the runtime on exit
        #[arg(long)]
        keep: bool,
    },

    /// Delete a model's artifact
    Remove { model: String },

    /// Show or initialise the configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration (tokens masked)
    Show,
    /// Print the configuration file path
    Path,
    /// Write a configuration file with defaults
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn init_logging(cli: &Cli) {
    let level = if cli.verbose {
        Level::DEBUG
    } else if cli.quiet {
        Level::WARN
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("{} Failed to create Tokio runtime: {}", "[X]".red(), e);
            std::process::exit(SOFTWARE);
        }
    };

    if let Err(err) = runtime.block_on(run(cli)) {
        eprintln!("{} {:#}", "[X]".red(), err);
        std::process::exit(exit_code(&err));
    }
}

/// Map an error to a sysexits code.
fn exit_code(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<ConfigurationError>().is_some() {
        return CONFIG;
    }
    if let Some(load) = err.downcast_ref::<LoadError>() {
        return load_exit_code(load);
    }
    match err.downcast_ref::<AcquireError>() {
        Some(AcquireError::Configuration(_)) => CONFIG,
        Some(AcquireError::Download { .. }) => TEMP_FAIL,
        Some(AcquireError::Load(load)) => load_exit_code(load),
        None => ERROR,
    }
}

fn load_exit_code(err: &LoadError) -> i32 {
    match err {
        LoadError::NotVerified { .. } | LoadError::Corrupted { .. } => DATA_ERR,
        LoadError::RuntimeFailure { .. } => SOFTWARE,
        LoadError::DownloadInProgress { .. } => TEMP_FAIL,
        LoadError::Configuration(_) => CONFIG,
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load()?;
    if let Some(dir) = &cli.models_dir {
        tracing::debug!(dir = %dir.display(), env = MODELS_DIR_ENV, "models dir overridden on the command line");
        config.models_dir_override = Some(dir.clone());
    }

    if let Commands::Config { command } = &cli.command {
        return handle_config(command, &config);
    }

    let hub = ModelHub::from_config(&config)?;
    let result = match cli.command {
        Commands::List => list_models(&hub),
        Commands::Pull { model, limit, load } => pull(&hub, model, limit, load, cli.quiet).await,
        Commands::Verify { model } => verify_model(&hub, model).await,
        Commands::Load { model, prompt, keep } => load_model(&hub, model, prompt, keep).await,
        Commands::Remove { model } => remove_model(&hub, &model),
        Commands::Config { .. } => Ok(()),
    };
    hub.shutdown();
    result
}

fn list_models(hub: &ModelHub) -> Result<()> {
    let default_id = hub.registry().default_id();
    println!();
    println!("{}", "Models".bold());
    println!("  {}", hub.models_dir().display().to_string().dimmed());
    println!();

    for id in hub.registry().list_ids() {
        let info = hub.model_info(id)?;
        let marker = if id == default_id { "*".cyan().bold() } else { " ".normal() };
        let state = if info.downloaded {
            "downloaded".green()
        } else {
            "not downloaded".dimmed()
        };
        println!(
            "{} {:<24} {:>9}  {:<16} {}",
            marker,
            id,
            format_bytes(info.descriptor.size_bytes),
            state,
            info.descriptor.name.dimmed()
        );
    }
    println!();
    println!("  {} default model", "*".cyan());
    Ok(())
}

fn progress_bar(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("  {spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} | {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓░"),
    );
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

async fn pull(
    hub: &ModelHub,
    model: Option<String>,
    limit: Option<u64>,
    load: bool,
    quiet: bool,
) -> Result<()> {
    if let Some(bps) = limit {
        hub.set_bandwidth_limit(bps);
    }
    let id = hub.registry().resolve(model.as_deref())?.id.clone();
    let mut events = hub.subscribe();

    let cancel_hub = hub.clone();
    let cancel_id = id.clone();
    let _ = ctrlc::set_handler(move || {
        cancel_hub.cancel(&cancel_id);
    });

    let outcome = hub.request(Some(id.as_str()))?;
    let mut handle = match outcome {
        RequestOutcome::Available(descriptor) => {
            println!("{} {} is already downloaded", "[OK]".green(), descriptor.name);
            return if load { load_model(hub, Some(id), None, false).await } else { Ok(()) };
        }
        RequestOutcome::Downloading(handle) => handle,
    };

    println!();
    println!("{} Pulling {}...", "[↓]".cyan(), id.bold());
    if let Some(bps) = limit.filter(|bps| *bps > 0) {
        println!("    limited to {}/s", format_bytes(bps));
    }

    let pb = progress_bar(handle.snapshot().total_bytes.unwrap_or(0));
    if quiet {
        pb.set_draw_target(indicatif::ProgressDrawTarget::hidden());
    }
    pb.set_message("starting");

    let last = loop {
        tokio::select! {
            last = handle.wait() => break last,
            Some(event) = events.recv() => render_event(&pb, &id, event),
        }
    };
    pb.finish_and_clear();

    match last.status {
        DownloadStatus::Completed => {
            println!("{} Downloaded {} ({})", "[OK]".green(), id, format_bytes(last.bytes_transferred));
            if last.retry_count > 0 {
                println!("    after {} retr{}", last.retry_count, if last.retry_count == 1 { "y" } else { "ies" });
            }
        }
        status => {
            return Err(AcquireError::Download {
                model: id,
                status,
                reason: last.last_error.unwrap_or_else(|| status.to_string()),
            }
            .into());
        }
    }

    if load {
        load_model(hub, Some(id), None, false).await?;
    }
    Ok(())
}

fn render_event(pb: &ProgressBar, id: &str, event: LifecycleEvent) {
    if event.model_id() != id {
        return;
    }
    match event {
        LifecycleEvent::QueuePosition { position, queue_len, .. } => {
            pb.set_message(format!("queued ({} of {})", position, queue_len));
        }
        LifecycleEvent::Progress(snapshot) => {
            if let Some(total) = snapshot.total_bytes {
                pb.set_length(total);
            }
            pb.set_position(snapshot.bytes_transferred);
            let speed = snapshot.speed_string().unwrap_or_default();
            let message = match snapshot.eta_string() {
                Some(eta) => format!("{} | ETA {}", speed, eta),
                None => speed,
            };
            pb.set_message(message);
        }
        LifecycleEvent::StateChanged { to, .. } => match to {
            DownloadStatus::Paused => pb.set_message("paused"),
            DownloadStatus::Verifying => pb.set_message("verifying"),
            DownloadStatus::Queued => pb.set_position(0),
            _ => {}
        },
        LifecycleEvent::RetryScheduled { attempt, max_attempts, delay, reason, .. } => {
            pb.println(format!(
                "  {} attempt failed ({}), retry {}/{} in {}s",
                "[!]".yellow(),
                reason,
                attempt,
                max_attempts,
                delay.as_secs()
            ));
        }
        LifecycleEvent::Terminal { status, reason, .. } if status != DownloadStatus::Completed => {
            pb.println(format!("  {} {}: {}", "[X]".red(), status, reason));
        }
        _ => {}
    }
}

async fn verify_model(hub: &ModelHub, model: Option<String>) -> Result<()> {
    let descriptor = hub.registry().resolve(model.as_deref())?.clone();
    let path = descriptor.artifact_path(hub.models_dir());

    let spinner = ProgressBar::new_spinner();
    spinner.set_message(format!("Verifying {}...", path.display()));
    spinner.enable_steady_tick(std::time::Duration::from_millis(80));

    let check_path = path.clone();
    let check_descriptor = descriptor.clone();
    let result = tokio::task::spawn_blocking(move || verify::verify(&check_path, &check_descriptor))
        .await
        .context("verification task failed")?;
    spinner.finish_and_clear();

    match result {
        Ok(()) => {
            let how = if descriptor.sha256.is_some() { "size and sha256" } else { "size" };
            println!("{} {} verified ({})", "[OK]".green(), descriptor.id, how);
            Ok(())
        }
        Err(source) => Err(LoadError::NotVerified { model: descriptor.id, source }.into()),
    }
}

async fn load_model(
    hub: &ModelHub,
    model: Option<String>,
    prompt: Option<String>,
    keep: bool,
) -> Result<()> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_message("Loading model...");
    spinner.enable_steady_tick(std::time::Duration::from_millis(80));

    let loaded = hub.ensure_loaded(model.as_deref()).await;
    spinner.finish_and_clear();
    let loaded = loaded?;

    println!("{} {} loaded and smoke-tested", "[OK]".green(), loaded.id().bold());
    if let Some(previous) = hub.swap_current(Arc::clone(&loaded)) {
        tracing::debug!(model = previous.id(), "replaced previous model");
    }

    if let Some(prompt) = prompt {
        let reply = hub.generate(&prompt).await?;
        println!();
        println!("{}", reply.trim());
    }

    if !keep {
        if let Some(current) = hub.take_current() {
            tokio::task::spawn_blocking(move || current.unload())
                .await
                .context("unload task failed")??;
        }
    }
    Ok(())
}

fn remove_model(hub: &ModelHub, model: &str) -> Result<()> {
    if hub.remove_artifact(model)? {
        println!("{} Removed {}", "[OK]".green(), model);
    } else {
        println!("{} {} was not downloaded", "[!]".yellow(), model);
    }
    Ok(())
}

fn handle_config(command: &ConfigCommands, config: &Config) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            println!("{}", serde_json::to_string_pretty(&config.redacted())?);
            println!();
            println!("{} {}", "models dir:".dimmed(), config.resolve_models_dir()?.display());
        }
        ConfigCommands::Path => {
            println!("{}", config::config_path()?.display());
        }
        ConfigCommands::Init { force } => {
            let path = config::config_path()?;
            if path.exists() && !force {
                println!("{} {} already exists (use --force to overwrite)", "[!]".yellow(), path.display());
                return Ok(());
            }
            Config::default().save_to(&path)?;
            println!("{} Wrote {}", "[OK]".green(), path.display());
        }
    }
    Ok(())
}
