//! Lock Coordinator.
//!
//! Exclusive locks block every other lock holder; non-exclusive locks only block
//! exclusive ones. Staleness is decided by the tool itself through a plain
//! `unlock`, so the coordinator never guesses whether a holder is alive. It only
//! waits for exclusive locks that survive stale-lock removal.

use crate::wrapper::ResticWrapper;
use resticwrap_core::output::{extract_lock_ids, extract_lock_stats};
use resticwrap_core::{poll_until, Error, LockStats, PollConfig, PollError, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A lock found in a repository together with its decoded metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    pub id: String,
    pub stats: LockStats,
}

impl ResticWrapper {
    /// Removes every lock, stale or not.
    pub async fn unlock_repository(&self, repository: &str) -> Result<()> {
        info!(repository, "unlocking restic repository");
        self.run(vec![self.unlock_command(repository)]).await?;
        Ok(())
    }

    /// Removes locks whose holders the tool considers gone.
    pub async fn unlock_stale_locks(&self, repository: &str) -> Result<()> {
        info!(repository, "removing stale locks from restic repository");
        self.run(vec![self.unlock_stale_command(repository)]).await?;
        Ok(())
    }

    pub async fn lock_ids(&self, repository: &str) -> Result<Vec<String>> {
        let out = self.run(vec![self.list_locks_command(repository)]).await?;
        Ok(extract_lock_ids(&out))
    }

    pub async fn lock_stats(&self, repository: &str, lock_id: &str) -> Result<LockStats> {
        let out = self.run(vec![self.lock_stats_command(repository, lock_id)]).await?;
        extract_lock_stats(&out)
    }

    /// Returns the first exclusive lock among the repository's locks.
    ///
    /// A lock that cannot be inspected is logged and skipped. Failing to list the
    /// locks at all is an error.
    pub async fn find_exclusive_lock(&self, repository: &str) -> Result<Option<LockInfo>> {
        let ids = self
            .lock_ids(repository)
            .await
            .map_err(|e| e.context("failed to list locks"))?;

        for id in ids {
            match self.lock_stats(repository, &id).await {
                Ok(stats) if stats.exclusive => {
                    info!(repository, lock_id = %id, hostname = %stats.hostname, "found exclusive lock");
                    return Ok(Some(LockInfo { id, stats }));
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(repository, lock_id = %id, error = %err, "failed to inspect lock");
                }
            }
        }
        Ok(None)
    }

    /// Waits until no backend holds an exclusive lock, polling every 10s for up to 1h
    /// per backend.
    pub async fn ensure_no_exclusive_lock(&self, cancel: &CancellationToken) -> Result<()> {
        self.ensure_no_exclusive_lock_with(&PollConfig::lock_wait(), cancel)
            .await
    }

    /// Processes backends one after another. Backends already found free stay free
    /// if a later one fails.
    pub async fn ensure_no_exclusive_lock_with(
        &self,
        config: &PollConfig,
        cancel: &CancellationToken,
    ) -> Result<()> {
        info!("ensuring repository is ready for new operation");

        for backend in self.backends() {
            let repository = backend.repository.as_str();
            info!(repository, "processing repository");

            self.try_unlock_stale(repository).await;
            let lock = self.find_exclusive_lock(repository).await.map_err(|e| {
                e.context(format!(
                    "failed to check for exclusive locks in repository {repository}"
                ))
            })?;
            let Some(lock) = lock else {
                info!(repository, "no exclusive lock found, repository is ready");
                continue;
            };

            info!(
                repository,
                holder = %lock.stats.hostname,
                lock_id = %lock.id,
                timeout = ?config.timeout,
                "exclusive lock found, waiting for it to be released"
            );
            let this = self;
            poll_until(config, cancel, "exclusive lock release", move || async move {
                this.try_unlock_stale(repository).await;
                let lock = this.find_exclusive_lock(repository).await?;
                if let Some(lock) = &lock {
                    info!(repository, holder = %lock.stats.hostname, "exclusive lock still held");
                }
                Ok::<_, Error>(lock.is_none())
            })
            .await
            .map_err(|err| match err {
                PollError::TimedOut(_) => Error::LockWaitTimeout {
                    repository: repository.to_string(),
                },
                PollError::Cancelled => Error::Cancelled {
                    operation: format!("waiting for exclusive lock in repository {repository}"),
                },
                PollError::Failed(e) => e.context(format!(
                    "failed to check for exclusive locks in repository {repository}"
                )),
            })?;

            info!(repository, "exclusive lock released, repository is ready");
        }

        info!("all repositories are ready for new operations");
        Ok(())
    }

    async fn try_unlock_stale(&self, repository: &str) {
        if let Err(err) = self.unlock_stale_locks(repository).await {
            warn!(repository, error = %err, "failed to remove stale locks");
        }
    }
}
