use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use image_update_checker::config::{UpdateCheckConfig, log_path};
use image_update_checker::logging::init_logging;
use image_update_checker::parser::ImageReference;
use image_update_checker::update::{
    ContainerImage, StatusCache, UpdateScheduler, create_default_registries,
};

#[derive(Parser)]
#[command(name = "image-update-checker")]
#[command(version, about = "Detects newer container image versions in upstream registries")]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    /// Write logs to a file in the data directory instead of stderr
    #[arg(long, global = true)]
    log_file: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Parse an image reference and print its components as JSON
    Parse { image: String },

    /// Check every container of an inventory once and print the statuses
    Check {
        /// JSON array of {containerId, image, imageDigest?}
        #[arg(long)]
        inventory: PathBuf,

        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Run the daily update check until interrupted
    Run {
        #[arg(long)]
        inventory: PathBuf,

        #[arg(long)]
        config: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_file = cli.log_file.then(log_path);
    let _guard = init_logging(cli.log_json, log_file.as_deref());

    match cli.command {
        Command::Parse { image } => parse_command(&image),
        Command::Check { inventory, config } => tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?
            .block_on(check_command(&inventory, config.as_deref())),
        Command::Run { inventory, config } => tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?
            .block_on(run_command(&inventory, &config)),
    }
}

fn parse_command(image: &str) -> anyhow::Result<()> {
    let reference = ImageReference::parse(image);
    let output = serde_json::json!({
        "reference": reference,
        "canonical": reference.to_string(),
        "degraded": reference.is_degraded(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn load_inventory(path: &Path) -> anyhow::Result<Vec<ContainerImage>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read inventory {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse inventory {}", path.display()))
}

fn load_config(path: &Path) -> anyhow::Result<UpdateCheckConfig> {
    UpdateCheckConfig::from_file(path)
        .with_context(|| format!("Failed to load config {}", path.display()))
}

fn create_scheduler(
    config: UpdateCheckConfig,
) -> anyhow::Result<UpdateScheduler<StatusCache>> {
    let cache = Arc::new(StatusCache::new(
        config.check_time_of_day()?,
        config.force_guard(),
    ));
    let registries = create_default_registries(&config);
    Ok(UpdateScheduler::new(config, cache, registries)?)
}

async fn check_command(inventory: &Path, config: Option<&Path>) -> anyhow::Result<()> {
    let mut config = match config {
        Some(path) => load_config(path)?,
        None => UpdateCheckConfig::default(),
    };
    // An explicit check runs regardless of the scheduling toggle
    config.check_enabled = true;

    let containers = load_inventory(inventory)?;
    let scheduler = create_scheduler(config)?;
    scheduler.sync_inventory(containers);

    let statuses = scheduler.request_forced_check_all().await;
    println!("{}", serde_json::to_string_pretty(&statuses)?);

    scheduler.stop().await;
    Ok(())
}

async fn run_command(inventory: &Path, config: &Path) -> anyhow::Result<()> {
    let config = load_config(config)?;
    let containers = load_inventory(inventory)?;

    let scheduler = create_scheduler(config)?;
    let changes = scheduler.sync_inventory(containers);
    info!("Tracking {} containers", changes.added.len());

    if !scheduler.is_checking_enabled() {
        warn!("checkEnabled is false, no update checks will run");
    }
    scheduler.start();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    scheduler.stop().await;
    println!("{}", serde_json::to_string_pretty(&scheduler.statuses())?);
    Ok(())
}
