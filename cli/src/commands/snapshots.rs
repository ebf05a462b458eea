use anyhow::{anyhow, Result};
use clap::Args;
use tracing::info;

#[derive(Args)]
pub struct SnapshotsCommand {
    #[arg(help = "Only show these snapshot IDs")]
    ids: Vec<String>,

    #[arg(long, help = "Output format (table, json)")]
    format: Option<String>,

    #[arg(long, help = "Filter by hostname")]
    hostname: Option<String>,

    #[arg(long, help = "Filter by tag")]
    tag: Vec<String>,

    #[arg(long, help = "Show latest N snapshots")]
    latest: Option<usize>,
}

impl SnapshotsCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let (config, wrapper) = cli.open().await?;
        let repository = cli.repository(&config)?;

        info!(repository = %repository, "listing snapshots");
        let mut snapshots = wrapper.list_snapshots(&repository, &self.ids).await?;
        let format = self.format.as_deref().unwrap_or("table");

        if let Some(hostname_filter) = &self.hostname {
            snapshots.retain(|s| s.hostname == *hostname_filter);
        }

        if !self.tag.is_empty() {
            snapshots.retain(|s| s.tags.iter().any(|tag| self.tag.contains(tag)));
        }

        if let Some(latest) = self.latest {
            snapshots.sort_by(|a, b| b.time.cmp(&a.time));
            snapshots.truncate(latest);
        }

        match format {
            "table" => {
                if snapshots.is_empty() {
                    println!("No snapshots found");
                    return Ok(());
                }
                println!("{:<10} {:<20} {:<15} {:<20} {}",
                    "ID", "Date", "Host", "Tags", "Paths");
                println!("{:-<100}", "");

                for snapshot in snapshots {
                    println!("{:<10} {:<20} {:<15} {:<20} {}",
                        snapshot.short_id(),
                        snapshot.time.format("%Y-%m-%d %H:%M:%S"),
                        snapshot.hostname,
                        snapshot.tags.join(","),
                        snapshot.paths.join(",")
                    );
                }
            },
            "json" => {
                let json = serde_json::to_string_pretty(&snapshots)?;
                println!("{}", json);
            },
            _ => {
                return Err(anyhow!("Unsupported format: {}", format));
            }
        }

        Ok(())
    }
}
