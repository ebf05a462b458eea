use anyhow::{anyhow, Result};
use clap::Args;
use resticwrap_engine::options::DEFAULT_HOST;
use resticwrap_engine::RestoreOptions;
use tracing::info;

#[derive(Args)]
pub struct RestoreCommand {
    #[arg(long, help = "Snapshot ID to restore; repeat for several")]
    snapshot: Vec<String>,

    #[arg(long, help = "Restore the latest snapshot of this path; repeat for several")]
    path: Vec<String>,

    #[arg(long, help = "Host whose snapshots are restored")]
    source_host: Option<String>,

    #[arg(long, help = "Host the restore is reported for")]
    host: Option<String>,

    #[arg(long, short = 't', help = "Target directory for restore")]
    target: String,

    #[arg(long, help = "Include patterns")]
    include: Vec<String>,

    #[arg(long, help = "Exclude patterns")]
    exclude: Vec<String>,

    #[arg(last = true, help = "Extra arguments passed to restic restore")]
    args: Vec<String>,
}

impl RestoreCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        if self.snapshot.is_empty() && self.path.is_empty() {
            return Err(anyhow!("Either --snapshot or --path must be specified"));
        }

        let (config, wrapper) = cli.open().await?;
        let repository = cli.repository(&config)?;

        let host = self.host.clone().unwrap_or_else(|| DEFAULT_HOST.to_string());
        let options = RestoreOptions {
            source_host: self.source_host.clone().unwrap_or_else(|| host.clone()),
            host,
            restore_paths: self.path.clone(),
            snapshots: self.snapshot.clone(),
            destination: self.target.clone(),
            exclude: self.exclude.clone(),
            include: self.include.clone(),
            args: self.args.clone(),
        };

        info!(repository = %repository, target = %self.target, "restoring");
        let stats = wrapper.run_restore(&repository, &options).await.into_result()?;

        match stats.duration {
            Some(duration) => println!(
                "Restore into {} completed in {:.1}s",
                self.target,
                duration.as_secs_f64()
            ),
            None => println!("Restore into {} completed", self.target),
        }
        Ok(())
    }
}
