use anyhow::Result;
use clap::Args;
use resticwrap_core::Command;
use resticwrap_engine::options::DEFAULT_HOST;
use resticwrap_engine::DumpOptions;
use tokio::io::AsyncWriteExt;

#[derive(Args)]
pub struct DumpCommand {
    #[arg(help = "File name inside the snapshot")]
    file_name: Option<String>,

    #[arg(long, help = "Snapshot ID (defaults to the latest)")]
    snapshot: Option<String>,

    #[arg(long, help = "Only consider snapshots containing this path")]
    path: Option<String>,

    #[arg(long, help = "Only consider snapshots of this host")]
    source_host: Option<String>,

    #[arg(long, help = "Shell command the dumped data is piped through; repeat to build a pipe")]
    pipe: Vec<String>,
}

impl DumpCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let (config, wrapper) = cli.open().await?;
        let repository = cli.repository(&config)?;

        let options = DumpOptions {
            host: DEFAULT_HOST.to_string(),
            source_host: self.source_host.clone().unwrap_or_default(),
            snapshot: self.snapshot.clone().unwrap_or_default(),
            path: self.path.clone().unwrap_or_default(),
            file_name: self.file_name.clone().unwrap_or_default(),
            stdout_pipe_commands: self
                .pipe
                .iter()
                .map(|c| Command::new("sh").arg("-c").arg(c.clone()))
                .collect(),
        };

        let data = wrapper.dump_once(&repository, &options).await?;

        let mut stdout = tokio::io::stdout();
        stdout.write_all(&data).await?;
        stdout.flush().await?;
        Ok(())
    }
}
