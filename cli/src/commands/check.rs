use anyhow::{anyhow, Result};
use clap::Args;
use tracing::info;

#[derive(Args)]
pub struct CheckCommand {
    #[arg(long, help = "Output format (table, json)")]
    format: Option<String>,
}

impl CheckCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let (config, wrapper) = cli.open().await?;
        let repository = cli.repository(&config)?;

        info!(repository = %repository, "checking repository");
        let stats = wrapper.verify_repository_integrity(&repository).await?;

        match self.format.as_deref().unwrap_or("table") {
            "table" => {
                println!("Repository: {}", repository);
                println!("Integrity:  {}", if stats.integrity { "ok" } else { "FAILED" });
                println!("Size:       {}", stats.size);
            }
            "json" => println!("{}", serde_json::to_string_pretty(&stats)?),
            other => return Err(anyhow!("Unsupported format: {}", other)),
        }

        if !stats.integrity {
            return Err(anyhow!("Repository {} failed the integrity check", repository));
        }
        Ok(())
    }
}
