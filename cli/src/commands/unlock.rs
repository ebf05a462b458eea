use anyhow::Result;
use clap::Args;

#[derive(Args)]
pub struct UnlockCommand {
    #[arg(long, help = "Only remove locks whose holder is gone")]
    stale: bool,
}

impl UnlockCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let (config, wrapper) = cli.open().await?;
        let repository = cli.repository(&config)?;

        if self.stale {
            wrapper.unlock_stale_locks(&repository).await?;
            println!("Removed stale locks from {}", repository);
        } else {
            wrapper.unlock_repository(&repository).await?;
            println!("Removed all locks from {}", repository);
        }
        Ok(())
    }
}
