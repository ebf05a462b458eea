use anyhow::{anyhow, Result};
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use resticwrap_core::{BackupOutput, Command, HostBackupPhase};
use resticwrap_engine::options::{DEFAULT_HOST, DEFAULT_OUTPUT_FILE_NAME};
use resticwrap_engine::BackupOptions;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Args)]
pub struct BackupCommand {
    #[arg(help = "Paths to backup")]
    paths: Vec<String>,

    #[arg(long, help = "Host name recorded in the snapshot; repeat to back up several hosts in parallel")]
    host: Vec<String>,

    #[arg(long, help = "Backup tags")]
    tag: Vec<String>,

    #[arg(long, help = "Exclude patterns")]
    exclude: Vec<String>,

    #[arg(long, help = "Shell command whose output is backed up instead of paths; repeat to build a pipe")]
    stdin_command: Vec<String>,

    #[arg(long, help = "File name given to data read from stdin")]
    stdin_filename: Option<String>,

    #[arg(long, help = "Maximum number of hosts backed up at once")]
    max_concurrency: Option<usize>,

    #[arg(long, help = "Write the backup statistics as JSON to this directory")]
    output_dir: Option<PathBuf>,

    #[arg(last = true, help = "Extra arguments passed to restic backup")]
    args: Vec<String>,
}

impl BackupCommand {
    fn options_for(&self, host: &str) -> BackupOptions {
        BackupOptions {
            host: host.to_string(),
            backup_paths: self.paths.clone(),
            stdin_pipe_commands: self
                .stdin_command
                .iter()
                .map(|c| Command::new("sh").arg("-c").arg(c.clone()))
                .collect(),
            stdin_file_name: self.stdin_filename.clone().unwrap_or_default(),
            exclude: self.exclude.clone(),
            tags: self.tag.clone(),
            args: self.args.clone(),
        }
    }

    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        if self.paths.is_empty() && self.stdin_command.is_empty() {
            return Err(anyhow!("At least one path or --stdin-command must be specified"));
        }

        let (config, wrapper) = cli.open().await?;

        let hosts: Vec<String> = if self.host.is_empty() {
            vec![DEFAULT_HOST.to_string()]
        } else {
            self.host.clone()
        };

        info!(hosts = hosts.len(), backends = wrapper.backends().len(), "starting backup");

        let pb = ProgressBar::new_spinner();
        pb.set_style(ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] {msg}")?);
        pb.enable_steady_tick(Duration::from_millis(120));
        pb.set_message(format!("Backing up {} host(s)...", hosts.len()));

        let report = if let [host] = hosts.as_slice() {
            wrapper.run_backup(&self.options_for(host)).await
        } else {
            let options = hosts.iter().map(|h| self.options_for(h)).collect();
            let concurrency = self
                .max_concurrency
                .or(config.max_concurrency)
                .unwrap_or(hosts.len());
            wrapper.run_parallel_backup(options, concurrency).await
        };

        pb.finish_with_message("Backup finished");

        for (backend, output) in wrapper.backends().iter().zip(&report.outputs) {
            print_output(&backend.repository, output);
        }

        if let Some(dir) = &self.output_dir {
            tokio::fs::create_dir_all(dir).await?;
            let path = dir.join(DEFAULT_OUTPUT_FILE_NAME);
            tokio::fs::write(&path, serde_json::to_vec_pretty(&report.outputs)?).await?;
            info!(path = %path.display(), "backup statistics written");
        }

        match report.error {
            Some(err) => {
                warn!(error = %err, "backup finished with errors");
                Err(err.into())
            }
            None => Ok(()),
        }
    }
}

fn print_output(repository: &str, output: &BackupOutput) {
    println!("Repository {}", repository);
    for host in &output.stats {
        let phase = match host.phase {
            Some(HostBackupPhase::Succeeded) => "succeeded",
            Some(HostBackupPhase::Failed) => "failed",
            None => "unknown",
        };
        println!("  host {} {}", host.hostname, phase);
        for snapshot in &host.snapshots {
            println!(
                "    {} {} ({} files, {:.2} MB processed, {:.2} MB added, {:.1}s)",
                snapshot.name.chars().take(8).collect::<String>(),
                snapshot.path,
                snapshot.file_stats.total_files,
                snapshot.total_size as f64 / (1024.0 * 1024.0),
                snapshot.uploaded as f64 / (1024.0 * 1024.0),
                snapshot.processing_time
            );
        }
        if let Some(error) = &host.error {
            println!("    error: {}", error);
        }
    }
}
