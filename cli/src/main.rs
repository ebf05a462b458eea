mod commands;
mod config;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use commands::{
    backup::BackupCommand, check::CheckCommand, dump::DumpCommand, forget::ForgetCommand,
    init::InitCommand, locks::{LocksCommand, WaitUnlockedCommand}, restore::RestoreCommand,
    snapshots::SnapshotsCommand, unlock::UnlockCommand,
};
use config::CliConfig;
use resticwrap_engine::ResticWrapper;
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(
    name = "resticwrap",
    about = "Drive restic across several storage backends",
    long_about = "Resticwrap runs restic against every configured backend, aggregates backup statistics and coordinates repository locks"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, short = 'c', env = "RESTICWRAP_CONFIG", help = "Path to the configuration file")]
    config: Option<PathBuf>,

    #[arg(long, env = "RESTICWRAP_REPO", help = "Repository identifier from the configuration")]
    repo: Option<String>,

    #[arg(long, help = "Do not log the commands being run")]
    hide_cmd: bool,

    #[arg(short, long, help = "Enable verbose output")]
    verbose: bool,

    #[arg(short, long, help = "Enable quiet mode")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Initialize the repository unless it already exists")]
    Init(InitCommand),

    #[command(about = "Back up paths or command output into every backend")]
    Backup(BackupCommand),

    #[command(about = "List snapshots")]
    Snapshots(SnapshotsCommand),

    #[command(about = "Restore files from snapshots")]
    Restore(RestoreCommand),

    #[command(about = "Write a file from a snapshot to stdout")]
    Dump(DumpCommand),

    #[command(about = "Check repository integrity and report its size")]
    Check(CheckCommand),

    #[command(about = "Forget snapshots and prune unreferenced data")]
    Forget(ForgetCommand),

    #[command(about = "Remove repository locks")]
    Unlock(UnlockCommand),

    #[command(about = "List repository locks")]
    Locks(LocksCommand),

    #[command(about = "Wait until no backend holds an exclusive lock")]
    WaitUnlocked(WaitUnlockedCommand),
}

impl Cli {
    fn load_config(&self) -> Result<CliConfig> {
        let path = self
            .config
            .clone()
            .or_else(config::default_config_path)
            .ok_or_else(|| anyhow!("Configuration file required (--config or RESTICWRAP_CONFIG)"))?;
        debug!(path = %path.display(), "loading configuration");
        config::load_config(&path)
    }

    /// Loads the configuration and sets up every backend.
    async fn open(&self) -> Result<(CliConfig, ResticWrapper)> {
        let config = self.load_config()?;
        let mut wrapper = ResticWrapper::new(config.setup_options()).await?;
        if self.hide_cmd {
            wrapper.hide_cmd();
        }
        Ok((config, wrapper))
    }

    fn repository(&self, config: &CliConfig) -> Result<String> {
        config.repository(self.repo.as_deref())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.quiet)?;

    info!("Starting resticwrap");

    match cli.command {
        Commands::Init(ref cmd) => cmd.run(&cli).await,
        Commands::Backup(ref cmd) => cmd.run(&cli).await,
        Commands::Snapshots(ref cmd) => cmd.run(&cli).await,
        Commands::Restore(ref cmd) => cmd.run(&cli).await,
        Commands::Dump(ref cmd) => cmd.run(&cli).await,
        Commands::Check(ref cmd) => cmd.run(&cli).await,
        Commands::Forget(ref cmd) => cmd.run(&cli).await,
        Commands::Unlock(ref cmd) => cmd.run(&cli).await,
        Commands::Locks(ref cmd) => cmd.run(&cli).await,
        Commands::WaitUnlocked(ref cmd) => cmd.run(&cli).await,
    }
}

fn init_tracing(verbose: bool, quiet: bool) -> Result<()> {
    let level = if quiet {
        "warn"
    } else if verbose {
        "debug"
    } else {
        "info"
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(format!("resticwrap={}", level)))
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow!("Setting default subscriber failed: {e}"))
}
