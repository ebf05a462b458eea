//! Argument building for every tool operation, plus the thin runners around them.

use crate::options::{BackupOptions, DumpOptions, KeyOptions};
use crate::wrapper::ResticWrapper;
use resticwrap_core::output::extract_snapshots;
use resticwrap_core::{Command, Result, Snapshot, RESTIC_CMD};
use tracing::{info, warn};

/// Parameters of one path backup.
#[derive(Debug, Clone, Default)]
pub(crate) struct BackupParams<'a> {
    pub path: &'a str,
    pub host: &'a str,
    pub tags: &'a [String],
    pub excludes: &'a [String],
    pub args: &'a [String],
}

#[derive(Debug, Clone, Default)]
pub(crate) struct RestoreParams<'a> {
    pub path: &'a str,
    pub host: &'a str,
    pub snapshot_id: &'a str,
    pub destination: &'a str,
    pub includes: &'a [String],
    pub excludes: &'a [String],
    pub args: &'a [String],
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn push_flag(args: &mut Vec<String>, flag: &str, value: &str) {
    if !value.is_empty() {
        args.push(flag.to_string());
        args.push(value.to_string());
    }
}

fn push_repeated(args: &mut Vec<String>, flag: &str, values: &[String]) {
    for value in values {
        args.push(flag.to_string());
        args.push(value.clone());
    }
}

impl ResticWrapper {
    fn single(&self, repository: &str, args: Vec<String>) -> Command {
        self.restic_command(self.backend(repository), args)
    }

    pub fn snapshots_command(&self, repository: &str, snapshot_ids: &[String]) -> Command {
        let mut command = self.single(repository, strings(&["snapshots", "--json", "--quiet", "--no-lock"]));
        command.args.extend(snapshot_ids.iter().cloned());
        command
    }

    pub fn forget_command(&self, repository: &str, snapshot_ids: &[String]) -> Command {
        let mut command = self.single(repository, strings(&["forget", "--quiet", "--prune"]));
        command.args.extend(snapshot_ids.iter().cloned());
        command
    }

    pub fn init_command(&self, repository: &str) -> Command {
        self.single(repository, strings(&["init"]))
    }

    pub fn check_command(&self, repository: &str) -> Command {
        self.single(repository, strings(&["check", "--no-lock"]))
    }

    pub fn stats_command(&self, repository: &str, snapshot_id: &str) -> Command {
        let mut args = strings(&["stats"]);
        if !snapshot_id.is_empty() {
            args.push(snapshot_id.to_string());
        }
        args.extend(strings(&["--quiet", "--json", "--mode", "raw-data", "--no-lock"]));
        self.single(repository, args)
    }

    pub fn unlock_command(&self, repository: &str) -> Command {
        self.single(repository, strings(&["unlock", "--remove-all"]))
    }

    /// Only removes locks the tool itself considers stale.
    pub fn unlock_stale_command(&self, repository: &str) -> Command {
        self.single(repository, strings(&["unlock"]))
    }

    pub fn list_locks_command(&self, repository: &str) -> Command {
        self.single(repository, strings(&["list", "locks", "--no-lock"]))
    }

    pub fn lock_stats_command(&self, repository: &str, lock_id: &str) -> Command {
        self.single(repository, strings(&["cat", "lock", lock_id, "--no-lock"]))
    }

    pub fn add_key_command(&self, repository: &str, options: &KeyOptions) -> Command {
        let mut args = strings(&["key", "add", "--no-lock"]);
        push_flag(&mut args, "--host", &options.host);
        push_flag(&mut args, "--user", &options.user);
        push_flag(&mut args, "--new-password-file", &options.file);
        self.single(repository, args)
    }

    pub fn list_keys_command(&self, repository: &str) -> Command {
        self.single(repository, strings(&["key", "list", "--json", "--no-lock"]))
    }

    pub fn update_key_command(&self, repository: &str, options: &KeyOptions) -> Command {
        let mut args = strings(&["key", "passwd", "--no-lock"]);
        push_flag(&mut args, "--new-password-file", &options.file);
        self.single(repository, args)
    }

    pub fn remove_key_command(&self, repository: &str, options: &KeyOptions) -> Command {
        self.single(repository, strings(&["key", "remove", options.id.as_str(), "--no-lock"]))
    }

    pub(crate) fn restore_command(&self, repository: &str, params: &RestoreParams<'_>) -> Command {
        let snapshot = if params.snapshot_id.is_empty() {
            "latest"
        } else {
            params.snapshot_id
        };
        let destination = if params.destination.is_empty() {
            "/"
        } else {
            params.destination
        };

        let mut args = strings(&["restore", snapshot]);
        push_flag(&mut args, "--path", params.path);
        push_flag(&mut args, "--host", params.host);
        push_flag(&mut args, "--target", destination);
        push_repeated(&mut args, "--include", params.includes);
        push_repeated(&mut args, "--exclude", params.excludes);
        args.extend(params.args.iter().cloned());
        self.single(repository, args)
    }

    /// The dump invocation followed by the caller's downstream pipe commands.
    pub fn dump_commands(&self, repository: &str, options: &DumpOptions) -> Vec<Command> {
        let snapshot = if options.snapshot.is_empty() {
            "latest"
        } else {
            options.snapshot.as_str()
        };
        let file_name = if options.file_name.is_empty() {
            "stdin"
        } else {
            options.file_name.as_str()
        };

        let mut args = strings(&["dump", "--quiet", snapshot, file_name]);
        push_flag(&mut args, "--host", &options.source_host);
        push_flag(&mut args, "--path", &options.path);

        let mut commands = vec![self.single(repository, args)];
        commands.extend(options.stdout_pipe_commands.iter().cloned());
        commands
    }

    /// One tool invocation per configured backend for the same path.
    pub(crate) fn backup_commands(&self, params: &BackupParams<'_>) -> Vec<Command> {
        let mut common = strings(&["backup", params.path, "--quiet", "--json"]);
        push_flag(&mut common, "--host", params.host);
        push_repeated(&mut common, "--tag", params.tags);
        push_repeated(&mut common, "--exclude", params.excludes);
        common.extend(params.args.iter().cloned());
        self.fan_out(common)
    }

    /// The caller's producer commands followed by one `--stdin` invocation per backend.
    pub(crate) fn backup_from_stdin_commands(&self, options: &BackupOptions) -> Vec<Command> {
        let mut common = strings(&["backup", "--stdin", "--quiet", "--json"]);
        push_flag(&mut common, "--host", &options.host);
        push_flag(&mut common, "--stdin-filename", &options.stdin_file_name);
        push_repeated(&mut common, "--tag", &options.tags);

        let mut commands = options.stdin_pipe_commands.clone();
        commands.extend(self.fan_out(common));
        commands
    }

    fn fan_out(&self, mut common: Vec<String>) -> Vec<Command> {
        self.append_cache_dir_flag(&mut common);
        self.append_cleanup_cache_flag(&mut common);
        self.backends()
            .iter()
            .map(|backend| {
                let mut args = common.clone();
                backend.append_backend_flags(&mut args);
                Command::new(RESTIC_CMD).args(args).envs(&backend.envs)
            })
            .collect()
    }

    pub async fn list_snapshots(&self, repository: &str, snapshot_ids: &[String]) -> Result<Vec<Snapshot>> {
        let out = self.run(vec![self.snapshots_command(repository, snapshot_ids)]).await?;
        extract_snapshots(&out).map_err(|e| e.context(format!("listing snapshots of {repository}")))
    }

    /// Forgets and prunes the snapshots, unlocking and retrying once if the
    /// repository was found locked.
    pub async fn delete_snapshots(&self, repository: &str, snapshot_ids: &[String]) -> Result<Vec<u8>> {
        let err = match self.run(vec![self.forget_command(repository, snapshot_ids)]).await {
            Ok(out) => return Ok(out),
            Err(err) if err.is_lock_contention() => err,
            Err(err) => return Err(err),
        };
        warn!(repository, error = %err, "repository found locked, unlocking before pruning");
        self.run(vec![self.unlock_command(repository)]).await?;
        self.run(vec![self.forget_command(repository, snapshot_ids)]).await
    }

    pub(crate) async fn init_repository(&self, repository: &str) -> Result<()> {
        info!(repository, "initializing new restic repository");
        let backend = self.backend(repository);
        backend.create_local_dir().await?;
        self.run(vec![self.init_command(repository)]).await?;
        Ok(())
    }

    pub async fn dump_once(&self, repository: &str, options: &DumpOptions) -> Result<Vec<u8>> {
        info!(repository, snapshot = %options.snapshot, "dumping backed up data");
        self.run(self.dump_commands(repository, options)).await
    }
}

#[cfg(test)]
mod tests {
    use crate::options::{BackupOptions, DumpOptions};
    use crate::testing::{args_of, wrapper_with, Reply, ScriptedExecutor};
    use resticwrap_core::Command;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_backup_fans_out_to_every_backend() {
        let scratch = tempfile::tempdir().unwrap();
        let executor = ScriptedExecutor::new(|_| Reply::ok(""));
        let wrapper = wrapper_with(executor, scratch.path(), &["repoA", "repoB"], None).await;

        let tags = vec!["nightly".to_string()];
        let excludes = vec!["*.tmp".to_string()];
        let commands = wrapper.backup_commands(&super::BackupParams {
            path: "/data",
            host: "host-0",
            tags: &tags,
            excludes: &excludes,
            args: &[],
        });

        assert_eq!(commands.len(), 2);
        for (command, repository) in commands.iter().zip(["repoA", "repoB"]) {
            assert_eq!(
                &command.args[..10],
                &["backup", "/data", "--quiet", "--json", "--host", "host-0", "--tag", "nightly", "--exclude", "*.tmp"]
            );
            assert_eq!(command.args[10], "--no-cache");
            assert!(command.envs["RESTIC_REPOSITORY"].contains(repository));
        }
    }

    #[tokio::test]
    async fn test_stdin_backup_keeps_producers_in_front() {
        let scratch = tempfile::tempdir().unwrap();
        let executor = ScriptedExecutor::new(|_| Reply::ok(""));
        let wrapper = wrapper_with(executor, scratch.path(), &["repoA", "repoB"], None).await;

        let options = BackupOptions {
            host: "db".into(),
            stdin_pipe_commands: vec![Command::new("pg_dumpall")],
            stdin_file_name: "dump.sql".into(),
            ..Default::default()
        };
        let commands = wrapper.backup_from_stdin_commands(&options);

        assert_eq!(commands.len(), 3);
        assert_eq!(commands[0].name, "pg_dumpall");
        assert!(commands[1..].iter().all(Command::is_restic));
        assert_eq!(
            &commands[1].args[..8],
            &["backup", "--stdin", "--quiet", "--json", "--host", "db", "--stdin-filename", "dump.sql"]
        );
    }

    #[tokio::test]
    async fn test_restore_defaults() {
        let scratch = tempfile::tempdir().unwrap();
        let executor = ScriptedExecutor::new(|_| Reply::ok(""));
        let wrapper = wrapper_with(executor, scratch.path(), &["repoA"], None).await;

        let command = wrapper.restore_command("repoA", &super::RestoreParams::default());
        assert_eq!(&command.args[..4], &["restore", "latest", "--target", "/"]);

        let command = wrapper.restore_command(
            "repoA",
            &super::RestoreParams {
                snapshot_id: "abc123",
                destination: "/restore",
                path: "/data",
                host: "host-1",
                ..Default::default()
            },
        );
        assert_eq!(
            &command.args[..8],
            &["restore", "abc123", "--path", "/data", "--host", "host-1", "--target", "/restore"]
        );
    }

    #[tokio::test]
    async fn test_dump_chain_and_stats_args() {
        let scratch = tempfile::tempdir().unwrap();
        let executor = ScriptedExecutor::new(|_| Reply::ok(""));
        let wrapper = wrapper_with(executor, scratch.path(), &["repoA"], None).await;

        let commands = wrapper.dump_commands(
            "repoA",
            &DumpOptions {
                source_host: "db".into(),
                stdout_pipe_commands: vec![Command::new("gunzip")],
                ..Default::default()
            },
        );
        assert_eq!(commands.len(), 2);
        assert_eq!(&commands[0].args[..6], &["dump", "--quiet", "latest", "stdin", "--host", "db"]);
        assert_eq!(commands[1].name, "gunzip");

        let stats = wrapper.stats_command("repoA", "");
        assert_eq!(
            &stats.args[..6],
            &["stats", "--quiet", "--json", "--mode", "raw-data", "--no-lock"]
        );
    }

    #[tokio::test]
    async fn test_delete_retries_once_after_unlock() {
        let scratch = tempfile::tempdir().unwrap();
        let forgets = AtomicUsize::new(0);
        let executor = ScriptedExecutor::new(move |call| {
            if call.starts_with(&["forget"]) && forgets.fetch_add(1, Ordering::SeqCst) == 0 {
                return Reply::fail(
                    "repo snapshot\nunable to create lock in backend: repository is already locked exclusively by PID 11\nuse `restic unlock` to remove it\n",
                );
            }
            Reply::ok("")
        });
        let wrapper = wrapper_with(executor.clone(), scratch.path(), &["repoA"], None).await;

        wrapper
            .delete_snapshots("repoA", &["abc".to_string()])
            .await
            .unwrap();

        let calls: Vec<Vec<String>> = executor.calls().iter().map(args_of).collect();
        assert_eq!(calls.len(), 3);
        assert_eq!(&calls[0][..3], &["forget", "--quiet", "--prune"]);
        assert_eq!(&calls[1][..2], &["unlock", "--remove-all"]);
        assert_eq!(&calls[2][..3], &["forget", "--quiet", "--prune"]);
    }

    #[tokio::test]
    async fn test_delete_does_not_retry_other_failures() {
        let scratch = tempfile::tempdir().unwrap();
        let executor = ScriptedExecutor::new(|_| Reply::fail("x\nFatal: wrong password or no key found\n"));
        let wrapper = wrapper_with(executor.clone(), scratch.path(), &["repoA"], None).await;

        let err = wrapper.delete_snapshots("repoA", &[]).await.unwrap_err();
        assert_eq!(err.to_string(), "Fatal: wrong password or no key found");
        assert_eq!(executor.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_list_snapshots_parse_error() {
        let scratch = tempfile::tempdir().unwrap();
        let executor = ScriptedExecutor::new(|_| Reply::ok("not json"));
        let wrapper = wrapper_with(executor, scratch.path(), &["repoA"], None).await;

        let err = wrapper.list_snapshots("repoA", &[]).await.unwrap_err();
        assert!(err.to_string().contains("listing snapshots of repoA"));
    }
}
