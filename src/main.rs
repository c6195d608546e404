use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use drive_revenant::drives::{DiscoveredDrive, DriveEnumerator, DriveType, SysinfoEnumerator};
use drive_revenant::{
    NdjsonSink, NullSink, RevenantConfig, SchedulerLoop, StaticPolicyInputs, SystemClock,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "drive-revenant")]
#[command(about = "Keeps selected storage volumes awake with tiny, strictly paced probes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Configuration file path
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List detected volumes with type and size
    List,

    /// Run the scheduler in the foreground until interrupted
    Run {
        /// NDJSON event output path
        #[arg(long)]
        events: Option<PathBuf>,

        /// Disable event output entirely
        #[arg(long)]
        no_events: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::List => list_volumes(),
        Commands::Run { events, no_events } => run(cli.config, events, no_events).await,
    }
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("", "", "drive-revenant")
        .context("could not determine a home directory for config and event files")
}

fn list_volumes() -> Result<()> {
    let volumes = SysinfoEnumerator::new().list()?;
    if volumes.is_empty() {
        println!("No lettered volumes detected. Drives can still be managed");
        println!("through explicit entries in the configuration file.");
        return Ok(());
    }

    for volume in volumes {
        let gib = volume.size_bytes as f64 / (1024.0 * 1024.0 * 1024.0);
        println!(
            "{}:  {:<9}  {:>8.1} GiB{}",
            volume.letter,
            format!("{:?}", volume.drive_type).to_lowercase(),
            gib,
            if volume.removable { "  removable" } else { "" }
        );
    }
    Ok(())
}

async fn run(
    config_path: Option<PathBuf>,
    events_path: Option<PathBuf>,
    no_events: bool,
) -> Result<()> {
    let dirs = project_dirs()?;
    let config_path = config_path.unwrap_or_else(|| dirs.config_dir().join("config.json"));
    let config = RevenantConfig::load(&config_path)?;

    let seed = seed_drives(&config)?;
    if seed.is_empty() {
        anyhow::bail!(
            "no volumes to manage; add drive entries to {}",
            config_path.display()
        );
    }

    let sink: Arc<dyn drive_revenant::EventSink> = if no_events {
        Arc::new(NullSink)
    } else {
        let path = events_path.unwrap_or_else(|| dirs.data_dir().join("events.ndjson"));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        tracing::info!(path = %path.display(), "writing events");
        Arc::new(NdjsonSink::new(Box::new(file)))
    };

    // Battery and idle probes are host-specific collaborators; the built-in
    // source reports mains power and no idle until one is wired up.
    let policy_inputs = Arc::new(StaticPolicyInputs::new());

    let (scheduler, handle) = SchedulerLoop::new(
        config,
        Arc::new(SystemClock::new()),
        policy_inputs,
        sink,
        seed,
    );
    let scheduler_task = tokio::spawn(scheduler.run());

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutdown requested");
    handle.shutdown();

    if tokio::time::timeout(Duration::from_secs(3), scheduler_task)
        .await
        .is_err()
    {
        tracing::warn!("scheduler did not drain in time, exiting anyway");
    }
    Ok(())
}

/// Merge enumeration with config-only drive entries.
fn seed_drives(config: &RevenantConfig) -> Result<Vec<DiscoveredDrive>> {
    let mut seed = SysinfoEnumerator::new().list()?;

    for entry in &config.drives {
        let letter = match drive_revenant::drives::normalize_letter(&entry.letter) {
            Ok(letter) => letter,
            Err(error) => {
                tracing::warn!(%error, "skipping config drive entry");
                continue;
            }
        };
        if seed.iter().any(|d| d.letter == letter) {
            continue;
        }
        // Present only in the config file, typically a volume the
        // enumerator cannot see on this platform.
        seed.push(DiscoveredDrive {
            letter,
            drive_type: entry.drive_type.unwrap_or(DriveType::Unknown),
            size_bytes: 0,
            removable: entry.drive_type == Some(DriveType::Removable),
        });
    }

    seed.sort_by_key(|d| d.letter);
    Ok(seed)
}
