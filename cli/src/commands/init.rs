use anyhow::Result;
use clap::Args;
use tracing::info;

#[derive(Args)]
pub struct InitCommand {
    #[arg(long, help = "Initialize every configured backend instead of one repository")]
    all: bool,
}

impl InitCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let (config, wrapper) = cli.open().await?;

        let repositories: Vec<String> = if self.all {
            config.backends.iter().map(|b| b.repository.clone()).collect()
        } else {
            vec![cli.repository(&config)?]
        };

        for repository in repositories {
            info!(repository = %repository, "ensuring repository exists");
            if wrapper.ensure_repository(&repository).await? {
                println!("Successfully initialized repository {}", repository);
            } else {
                println!("Repository {} already exists", repository);
            }
        }

        Ok(())
    }
}
