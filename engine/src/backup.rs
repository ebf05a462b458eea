use crate::commands::BackupParams;
use crate::options::BackupOptions;
use crate::wrapper::ResticWrapper;
use chrono::Utc;
use resticwrap_core::output::{extract_backup_info, extract_check_info, extract_stats_info};
use resticwrap_core::{
    BackupOutput, Error, HostBackupPhase, HostBackupStats, RepositoryStats, Result,
};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Error strings the tool prints when no repository exists at the location.
const REPOSITORY_NOT_FOUND_MARKERS: &[&str] = &[
    "Is there a repository at the following location?",
    "unable to open config file",
    "repository does not exist",
];

/// Per-repository backup results together with every failure that occurred.
///
/// Outputs are positional: entry `i` belongs to the `i`-th configured backend.
#[derive(Debug, Default)]
pub struct BackupReport {
    pub outputs: Vec<BackupOutput>,
    pub error: Option<Error>,
}

impl BackupReport {
    pub fn into_result(self) -> Result<Vec<BackupOutput>> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.outputs),
        }
    }
}

fn finish_host_stats(
    stats: &mut HostBackupStats,
    started: Instant,
    started_at: chrono::DateTime<Utc>,
    result: &Result<()>,
) {
    match result {
        Ok(()) => {
            stats.phase = Some(HostBackupPhase::Succeeded);
            stats.duration = Some(started.elapsed());
            stats.start_time = Some(started_at);
            stats.end_time = Some(Utc::now());
        }
        Err(err) => {
            stats.phase = Some(HostBackupPhase::Failed);
            stats.error = Some(err.to_string());
        }
    }
}

impl ResticWrapper {
    /// Backs up one target into every configured backend.
    pub async fn run_backup(&self, options: &BackupOptions) -> BackupReport {
        let started = Instant::now();
        let started_at = Utc::now();

        let (mut host_stats, result) = self.backup_host(options).await;
        for stats in &mut host_stats {
            finish_host_stats(stats, started, started_at, &result);
        }

        BackupReport {
            outputs: host_stats
                .into_iter()
                .map(|stats| BackupOutput { stats: vec![stats] })
                .collect(),
            error: result.err(),
        }
    }

    /// Runs one backup per options entry with at most `max_concurrency` in flight.
    ///
    /// Every task runs to completion on its own copy of the wrapper; failures are
    /// collected into one aggregate error and every host appears in the outputs.
    pub async fn run_parallel_backup(
        &self,
        backup_options: Vec<BackupOptions>,
        max_concurrency: usize,
    ) -> BackupReport {
        let limiter = Arc::new(Semaphore::new(max_concurrency.max(1)));
        let mut tasks = Vec::with_capacity(backup_options.len());

        for options in backup_options {
            let wrapper = self.copy();
            let limiter = Arc::clone(&limiter);
            let host = options.host.clone();
            let task = tokio::spawn(async move {
                let _permit = match limiter.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        let err = Error::Other("concurrency limiter closed".to_string());
                        return (Vec::new(), Err(err));
                    }
                };
                let started = Instant::now();
                let started_at = Utc::now();
                let (mut host_stats, result) = wrapper.backup_host(&options).await;
                for stats in &mut host_stats {
                    finish_host_stats(stats, started, started_at, &result);
                }
                (host_stats, result)
            });
            tasks.push((host, task));
        }

        let mut outputs = vec![BackupOutput::default(); self.backends().len()];
        let mut errors = Vec::new();
        for (host, task) in tasks {
            let (host_stats, result) = match task.await {
                Ok(finished) => finished,
                Err(join_error) => {
                    error!(host = %host, error = %join_error, "backup task did not complete");
                    let err = Error::Other(format!("backup task did not complete: {join_error}"));
                    (Vec::new(), Err(err))
                }
            };
            for (output, stats) in outputs.iter_mut().zip(host_stats) {
                output.upsert_host_backup_stats(stats);
            }
            if let Err(err) = result {
                warn!(host = %host, error = %err, "backup failed");
                errors.push(err.context(format!("backup of host {host}")));
            }
        }

        BackupReport {
            outputs,
            error: Error::aggregate(errors),
        }
    }

    /// One host's backup, returning whatever stats were gathered before any failure.
    async fn backup_host(&self, options: &BackupOptions) -> (Vec<HostBackupStats>, Result<()>) {
        let mut host_stats = vec![HostBackupStats::new(options.host.clone()); self.backends().len()];
        let result = if options.is_stdin() {
            self.backup_stdin_into(options, &mut host_stats).await
        } else {
            self.backup_paths_into(options, &mut host_stats).await
        };
        (host_stats, result)
    }

    async fn backup_stdin_into(
        &self,
        options: &BackupOptions,
        host_stats: &mut [HostBackupStats],
    ) -> Result<()> {
        info!(host = %options.host, "backing up stdin data");
        let started = Instant::now();
        let out = self.run(self.backup_from_stdin_commands(options)).await?;
        let file_name = if options.stdin_file_name.is_empty() {
            "stdin"
        } else {
            options.stdin_file_name.as_str()
        };
        let snapshots = extract_backup_info(&out, file_name)?;
        for (stats, snapshot) in host_stats.iter_mut().zip(snapshots) {
            stats.upsert_snapshot_stats(snapshot);
        }
        self.update_elapsed_timeout(started);
        Ok(())
    }

    async fn backup_paths_into(
        &self,
        options: &BackupOptions,
        host_stats: &mut [HostBackupStats],
    ) -> Result<()> {
        for path in &options.backup_paths {
            info!(host = %options.host, path = %path, "backing up target data");
            let started = Instant::now();
            let params = BackupParams {
                path,
                host: &options.host,
                tags: &options.tags,
                excludes: &options.exclude,
                args: &options.args,
            };
            let out = self.run(self.backup_commands(&params)).await?;
            let snapshots = extract_backup_info(&out, path)?;
            for (stats, snapshot) in host_stats.iter_mut().zip(snapshots) {
                stats.upsert_snapshot_stats(snapshot);
            }
            self.update_elapsed_timeout(started);
        }
        Ok(())
    }

    /// True when a snapshot listing succeeds. Any failure counts as absent.
    pub async fn repository_already_exist(&self, repository: &str) -> bool {
        info!(repository, "checking whether the backend repository exists");
        self.run(vec![self.probe_command(repository)]).await.is_ok()
    }

    /// Like [`repository_already_exist`](Self::repository_already_exist) but only
    /// reports absence when the tool says so. Other failures are returned.
    pub async fn probe_repository(&self, repository: &str) -> Result<bool> {
        match self.run(vec![self.probe_command(repository)]).await {
            Ok(_) => Ok(true),
            Err(err) => {
                let message = err.to_string();
                if REPOSITORY_NOT_FOUND_MARKERS.iter().any(|m| message.contains(m)) {
                    Ok(false)
                } else {
                    Err(err.context(format!("probing repository {repository}")))
                }
            }
        }
    }

    fn probe_command(&self, repository: &str) -> resticwrap_core::Command {
        self.restic_command(
            self.backend(repository),
            vec!["snapshots".to_string(), "--json".to_string(), "--no-lock".to_string()],
        )
    }

    pub async fn initialize_repository(&self, repository: &str) -> Result<()> {
        self.init_repository(repository).await
    }

    /// Initializes the repository unless it already exists. Returns whether it was created.
    pub async fn ensure_repository(&self, repository: &str) -> Result<bool> {
        if self.probe_repository(repository).await? {
            info!(repository, "repository already exists");
            return Ok(false);
        }
        self.init_repository(repository).await?;
        Ok(true)
    }

    /// Runs `check` and then `stats`; a failing check skips the stats step.
    pub async fn verify_repository_integrity(&self, repository: &str) -> Result<RepositoryStats> {
        info!(repository, "checking integrity of repository");
        let out = self
            .run(vec![self.check_command(repository)])
            .await
            .map_err(|e| e.context(format!("checking repository {repository}")))?;
        let integrity = extract_check_info(&out);

        info!(repository, "reading repository status");
        let out = self
            .run(vec![self.stats_command(repository, "")])
            .await
            .map_err(|e| e.context(format!("reading stats of repository {repository}")))?;
        let size = extract_stats_info(&out)?;

        Ok(RepositoryStats { integrity, size })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::SetupOptions;
    use crate::testing::{local_backends, summary_line, wrapper_with, Reply, ScriptedExecutor};
    use async_trait::async_trait;
    use resticwrap_core::{CommandExecutor, ExecError, Pipeline, StderrBuffer};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn options(host: &str, paths: &[&str]) -> BackupOptions {
        BackupOptions {
            host: host.to_string(),
            backup_paths: paths.iter().map(|p| p.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_parallel_backup_reports_every_host() {
        let scratch = tempfile::tempdir().unwrap();
        let executor = ScriptedExecutor::new(|call| {
            if call.has_arg("host-b") {
                return Reply::fail("x\nFatal: unable to save snapshot: disk full\n");
            }
            let host = if call.has_arg("host-a") { "a" } else { "c" };
            Reply::ok(summary_line(&format!("snap-{host}"), 10))
        });
        let wrapper = wrapper_with(executor, scratch.path(), &["repoA"], None).await;

        let report = wrapper
            .run_parallel_backup(
                vec![
                    options("host-a", &["/a"]),
                    options("host-b", &["/b"]),
                    options("host-c", &["/c"]),
                ],
                2,
            )
            .await;

        assert_eq!(report.outputs.len(), 1);
        let stats = &report.outputs[0].stats;
        assert_eq!(stats.len(), 3);
        for host in ["host-a", "host-b", "host-c"] {
            let entry = stats.iter().find(|s| s.hostname == host).unwrap();
            let expected = if host == "host-b" {
                HostBackupPhase::Failed
            } else {
                HostBackupPhase::Succeeded
            };
            assert_eq!(entry.phase, Some(expected));
        }
        let succeeded = stats.iter().find(|s| s.hostname == "host-a").unwrap();
        assert_eq!(succeeded.snapshots[0].name, "snap-a");
        assert!(succeeded.start_time.is_some());

        let err = report.error.unwrap();
        assert_eq!(err.errors().len(), 1);
        let message = err.to_string();
        assert!(message.contains("host-b"));
        assert!(message.contains("disk full"));
        assert!(!message.contains("host-a"));
        assert!(!message.contains("host-c"));
    }

    #[tokio::test]
    async fn test_parallel_backup_respects_concurrency_limit() {
        let scratch = tempfile::tempdir().unwrap();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let executor = {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            ScriptedExecutor::new(move |_| {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                Reply::ok(summary_line("snap", 1)).after(Duration::from_millis(20))
            })
        };
        let counting = CountingExecutor {
            inner: executor,
            in_flight,
        };
        let options_list: Vec<BackupOptions> =
            (0..6).map(|i| options(&format!("host-{i}"), &["/data"])).collect();

        let wrapper = ResticWrapper::with_executor(
            SetupOptions {
                scratch_dir: scratch.path().to_path_buf(),
                backends: local_backends(scratch.path(), &["repoA"]),
                ..Default::default()
            },
            Arc::new(counting),
        )
        .await
        .unwrap();

        let report = wrapper.run_parallel_backup(options_list, 2).await;
        assert!(report.error.is_none());
        assert_eq!(report.outputs[0].stats.len(), 6);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    /// Decrements the in-flight counter once the scripted call returns.
    struct CountingExecutor {
        inner: Arc<ScriptedExecutor>,
        in_flight: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CommandExecutor for CountingExecutor {
        async fn execute(
            &self,
            pipeline: Pipeline,
            stderr: StderrBuffer,
        ) -> std::result::Result<Vec<u8>, ExecError> {
            let result = self.inner.execute(pipeline, stderr).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_budget_is_consumed() {
        let scratch = tempfile::tempdir().unwrap();
        let executor = ScriptedExecutor::new(|_| {
            Reply::ok(summary_line("snap", 1)).after(Duration::from_secs(30))
        });
        let wrapper = wrapper_with(
            executor,
            scratch.path(),
            &["repoA"],
            Some(Duration::from_secs(100)),
        )
        .await;

        let report = wrapper.run_backup(&options("host-0", &["/data"])).await;
        assert!(report.error.is_none());

        let remaining = wrapper.remaining_timeout().unwrap();
        assert!(remaining <= Duration::from_secs(70));
        assert!(remaining >= Duration::from_secs(69));
    }

    #[tokio::test]
    async fn test_fan_out_stats_are_positional() {
        let scratch = tempfile::tempdir().unwrap();
        let executor = ScriptedExecutor::new(|call| {
            let path = if call.has_arg("/a") { "a" } else { "b" };
            Reply::ok(format!(
                "{}\n{}\n",
                summary_line(&format!("{path}-repo1"), 1),
                summary_line(&format!("{path}-repo2"), 2)
            ))
        });
        let wrapper = wrapper_with(executor, scratch.path(), &["repo1", "repo2"], None).await;

        let outputs = wrapper
            .run_backup(&options("host-0", &["/a", "/b"]))
            .await
            .into_result()
            .unwrap();

        assert_eq!(outputs.len(), 2);
        let names: Vec<Vec<String>> = outputs
            .iter()
            .map(|o| o.stats[0].snapshots.iter().map(|s| s.name.clone()).collect())
            .collect();
        assert_eq!(names[0], vec!["a-repo1", "b-repo1"]);
        assert_eq!(names[1], vec!["a-repo2", "b-repo2"]);
    }

    #[tokio::test]
    async fn test_failed_stdin_backup_still_reports_host() {
        let scratch = tempfile::tempdir().unwrap();
        let executor = ScriptedExecutor::new(|_| Reply::fail("x\npg_dumpall: connection refused\n"));
        let wrapper = wrapper_with(executor, scratch.path(), &["repoA", "repoB"], None).await;

        let report = wrapper
            .run_backup(&BackupOptions {
                host: "db".into(),
                stdin_pipe_commands: vec![resticwrap_core::Command::new("pg_dumpall")],
                ..Default::default()
            })
            .await;

        assert_eq!(report.outputs.len(), 2);
        for output in &report.outputs {
            assert_eq!(output.stats[0].hostname, "db");
            assert_eq!(output.stats[0].phase, Some(HostBackupPhase::Failed));
        }
        assert!(report.error.is_some());
    }

    #[tokio::test]
    async fn test_probe_distinguishes_absence_from_failure() {
        let scratch = tempfile::tempdir().unwrap();
        let executor = ScriptedExecutor::new(|call| {
            if call.starts_with(&["init"]) {
                Reply::ok("created restic repository")
            } else if call.envs()["RESTIC_REPOSITORY"].ends_with("missing") {
                Reply::fail("x\nFatal: unable to open config file: stat /storage/missing/config: no such file or directory\nIs there a repository at the following location?\n")
            } else {
                Reply::fail("x\nFatal: unable to list: connection reset by peer\n")
            }
        });
        let wrapper = wrapper_with(executor.clone(), scratch.path(), &["missing", "flaky"], None).await;

        assert!(!wrapper.repository_already_exist("flaky").await);
        assert!(!wrapper.probe_repository("missing").await.unwrap());
        assert!(wrapper.probe_repository("flaky").await.is_err());
        assert!(wrapper.ensure_repository("flaky").await.is_err());
        assert_eq!(executor.count(&["init"]), 0);

        assert!(wrapper.ensure_repository("missing").await.unwrap());
        assert_eq!(executor.count(&["init"]), 1);
    }

    #[tokio::test]
    async fn test_verify_integrity() {
        let scratch = tempfile::tempdir().unwrap();
        let executor = ScriptedExecutor::new(|call| {
            if call.starts_with(&["check"]) {
                Reply::ok("using temporary cache\nno errors were found\n")
            } else {
                Reply::ok(r#"{"total_size":4096,"total_file_count":7}"#)
            }
        });
        let wrapper = wrapper_with(executor, scratch.path(), &["repoA"], None).await;

        let stats = wrapper.verify_repository_integrity("repoA").await.unwrap();
        assert_eq!(
            stats,
            RepositoryStats {
                integrity: true,
                size: "4096".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_failed_check_skips_stats() {
        let scratch = tempfile::tempdir().unwrap();
        let executor = ScriptedExecutor::new(|_| Reply::fail("x\nFatal: repository contains errors\n"));
        let wrapper = wrapper_with(executor.clone(), scratch.path(), &["repoA"], None).await;

        assert!(wrapper.verify_repository_integrity("repoA").await.is_err());
        assert_eq!(executor.count(&["stats"]), 0);
    }
}
