use anyhow::Result;
use clap::Args;
use resticwrap_core::PollConfig;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Args)]
pub struct LocksCommand {
    #[arg(long, help = "Only show exclusive locks")]
    exclusive: bool,
}

impl LocksCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let (config, wrapper) = cli.open().await?;
        let repository = cli.repository(&config)?;

        let ids = wrapper.lock_ids(&repository).await?;
        if ids.is_empty() {
            println!("No locks in {}", repository);
            return Ok(());
        }

        println!("{:<10} {:<10} {:<20} {:<15} {:<10} {}",
            "ID", "Type", "Created", "Host", "User", "PID");
        println!("{:-<80}", "");

        for id in ids {
            let stats = match wrapper.lock_stats(&repository, &id).await {
                Ok(stats) => stats,
                Err(e) => {
                    warn!(lock = %id, error = %e, "failed to inspect lock");
                    continue;
                }
            };
            if self.exclusive && !stats.exclusive {
                continue;
            }
            println!("{:<10} {:<10} {:<20} {:<15} {:<10} {}",
                id.chars().take(8).collect::<String>(),
                if stats.exclusive { "exclusive" } else { "shared" },
                stats.time.format("%Y-%m-%d %H:%M:%S"),
                stats.hostname,
                stats.username,
                stats.pid
            );
        }
        Ok(())
    }
}

#[derive(Args)]
pub struct WaitUnlockedCommand {
    #[arg(long, default_value_t = 5, help = "Seconds between lock checks")]
    interval: u64,

    #[arg(long, default_value_t = 600, help = "Seconds to wait before giving up")]
    timeout: u64,
}

impl WaitUnlockedCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let (_config, wrapper) = cli.open().await?;

        let cancel = CancellationToken::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received interrupt, cancelling lock wait");
                on_signal.cancel();
            }
        });

        let poll = PollConfig {
            interval: Duration::from_secs(self.interval),
            timeout: Duration::from_secs(self.timeout),
            immediate: true,
        };
        wrapper.ensure_no_exclusive_lock_with(&poll, &cancel).await?;
        println!("No exclusive locks held");
        Ok(())
    }
}
