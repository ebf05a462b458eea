use anyhow::Result;
use clap::Args;
use tracing::info;

#[derive(Args)]
pub struct ForgetCommand {
    #[arg(required = true, help = "Snapshot IDs to forget")]
    ids: Vec<String>,
}

impl ForgetCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let (config, wrapper) = cli.open().await?;
        let repository = cli.repository(&config)?;

        info!(repository = %repository, count = self.ids.len(), "forgetting snapshots");
        let output = wrapper.delete_snapshots(&repository, &self.ids).await?;
        print!("{}", String::from_utf8_lossy(&output));
        Ok(())
    }
}
