use crate::commands::RestoreParams;
use crate::options::RestoreOptions;
use crate::wrapper::ResticWrapper;
use resticwrap_core::{Error, HostRestorePhase, HostRestoreStats, Result};
use tokio::time::Instant;
use tracing::info;

#[derive(Debug)]
pub struct RestoreReport {
    pub stats: HostRestoreStats,
    pub error: Option<Error>,
}

impl RestoreReport {
    pub fn into_result(self) -> Result<HostRestoreStats> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.stats),
        }
    }
}

impl ResticWrapper {
    /// Restores explicit snapshots, or the latest snapshot of every restore path.
    pub async fn run_restore(&self, repository: &str, options: &RestoreOptions) -> RestoreReport {
        let started = Instant::now();
        let result = self.restore_all(repository, options).await;

        let stats = match &result {
            Ok(()) => HostRestoreStats {
                hostname: options.host.clone(),
                phase: HostRestorePhase::Succeeded,
                duration: Some(started.elapsed()),
                error: None,
            },
            Err(err) => HostRestoreStats {
                hostname: options.host.clone(),
                phase: HostRestorePhase::Failed,
                duration: None,
                error: Some(err.to_string()),
            },
        };
        RestoreReport {
            stats,
            error: result.err(),
        }
    }

    async fn restore_all(&self, repository: &str, options: &RestoreOptions) -> Result<()> {
        let base = RestoreParams {
            destination: &options.destination,
            includes: &options.include,
            excludes: &options.exclude,
            args: &options.args,
            ..Default::default()
        };

        if !options.snapshots.is_empty() {
            for snapshot in &options.snapshots {
                let params = RestoreParams {
                    snapshot_id: snapshot,
                    ..base.clone()
                };
                self.restore_step(repository, &params).await?;
            }
            return Ok(());
        }

        for path in &options.restore_paths {
            let params = RestoreParams {
                path,
                host: &options.source_host,
                ..base.clone()
            };
            self.restore_step(repository, &params).await?;
        }
        Ok(())
    }

    async fn restore_step(&self, repository: &str, params: &RestoreParams<'_>) -> Result<()> {
        info!(
            repository,
            snapshot = params.snapshot_id,
            path = params.path,
            "restoring backed up data"
        );
        let started = Instant::now();
        self.run(vec![self.restore_command(repository, params)])
            .await
            .map_err(|e| e.context(format!("restoring into {repository}")))?;
        self.update_elapsed_timeout(started);
        Ok(())
    }
}
