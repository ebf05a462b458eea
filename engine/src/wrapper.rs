use crate::options::SetupOptions;
use resticwrap_backends::secret::{RESTIC_PROGRESS_FPS, RESTIC_REPOSITORY};
use resticwrap_backends::{prepare_backend, BackendDescriptor, BackendRegistry, RESTIC_CACHE_DIR};
use resticwrap_core::{
    Command, CommandExecutor, CommandRunner, Error, ProcessExecutor, Result, Session, RESTIC_CMD,
};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

const PROGRESS_FPS: &str = "0.016666";

/// Immutable configuration shared by a wrapper and all of its copies.
///
/// The timeout budget is the only mutable piece and is consumed by every copy.
#[derive(Debug)]
pub struct WrapperConfig {
    pub enable_cache: bool,
    pub scratch_dir: PathBuf,
    pub registry: BackendRegistry,
    timeout: Mutex<Option<Duration>>,
}

impl WrapperConfig {
    pub fn cache_dir(&self) -> PathBuf {
        self.scratch_dir.join(RESTIC_CACHE_DIR)
    }
}

/// Handle combining a process session with the shared wrapper configuration.
///
/// A single handle must not run operations concurrently; use [`copy`](Self::copy)
/// to get an independent session for each concurrent task.
#[derive(Debug)]
pub struct ResticWrapper {
    session: Session,
    runner: CommandRunner,
    config: Arc<WrapperConfig>,
}

impl ResticWrapper {
    pub async fn new(options: SetupOptions) -> Result<Self> {
        Self::with_executor(options, Arc::new(ProcessExecutor::new())).await
    }

    /// Resolves every backend, builds the registry and prepares the session.
    ///
    /// All backends are attempted; their failures are returned together.
    pub async fn with_executor(
        options: SetupOptions,
        executor: Arc<dyn CommandExecutor>,
    ) -> Result<Self> {
        let SetupOptions {
            enable_cache,
            scratch_dir,
            nice,
            ionice,
            timeout,
            backends,
        } = options;

        let mut session = Session {
            dir: Some(scratch_dir.clone()),
            show_cmd: true,
            ..Default::default()
        };
        session
            .env
            .insert(RESTIC_PROGRESS_FPS.to_string(), PROGRESS_FPS.to_string());

        if enable_cache {
            tokio::fs::create_dir_all(scratch_dir.join(RESTIC_CACHE_DIR)).await?;
        }

        let mut registry = BackendRegistry::new(backends);
        let mut errors = Vec::new();
        for backend in registry.backends_mut() {
            info!(repository = %backend.repository, "setting up backend");
            if let Err(err) = prepare_backend(backend, &scratch_dir).await {
                errors.push(err);
            }
        }
        if let Some(err) = Error::aggregate(errors) {
            return Err(err);
        }
        registry.build_index()?;

        let runner = CommandRunner::new(executor)
            .with_nice(nice)
            .with_ionice(ionice);

        Ok(Self {
            session,
            runner,
            config: Arc::new(WrapperConfig {
                enable_cache,
                scratch_dir,
                registry,
                timeout: Mutex::new(timeout),
            }),
        })
    }

    /// Independent session state over the same shared configuration.
    pub fn copy(&self) -> Self {
        Self {
            session: self.session.clone(),
            runner: self.runner.clone(),
            config: Arc::clone(&self.config),
        }
    }

    pub fn config(&self) -> &WrapperConfig {
        &self.config
    }

    pub fn set_env(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.session.env.insert(key.into(), value.into());
    }

    pub fn get_env(&self, key: &str) -> Option<&str> {
        self.session.env.get(key).map(String::as_str)
    }

    /// Repository URL exported into the session, if any.
    pub fn get_repo(&self) -> Option<&str> {
        self.get_env(RESTIC_REPOSITORY)
    }

    pub fn set_show_cmd(&mut self, show_cmd: bool) {
        self.session.show_cmd = show_cmd;
    }

    pub fn hide_cmd(&mut self) {
        self.session.show_cmd = false;
    }

    pub fn get_ca_path(&self, repository: &str) -> Option<&Path> {
        self.backend(repository).ca_cert_file.as_deref()
    }

    /// Writes the backend's environment followed by the sorted session environment
    /// as `KEY=VALUE` lines into `dir/file`, readable by the owner only.
    pub async fn dump_env(&self, repository: &str, dir: &Path, file: &str) -> Result<()> {
        tokio::fs::create_dir_all(dir).await?;

        let mut contents = String::new();
        let backend = self.backend(repository);
        for (key, value) in backend.envs.iter().chain(self.session.env.iter()) {
            let _ = writeln!(contents, "{key}={value}");
        }

        let path = dir.join(file);
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut handle = options.open(&path).await?;
        tokio::io::AsyncWriteExt::write_all(&mut handle, contents.as_bytes()).await?;
        debug!(path = %path.display(), "environment dumped");
        Ok(())
    }

    pub fn remaining_timeout(&self) -> Option<Duration> {
        *self
            .config
            .timeout
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Charges the time spent since `start` against the shared timeout budget.
    pub fn update_elapsed_timeout(&self, start: Instant) {
        let mut timeout = self
            .config
            .timeout
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(remaining) = timeout.as_mut() {
            *remaining = remaining.saturating_sub(start.elapsed());
        }
    }

    /// Backend owning `repository`, or the zero descriptor.
    pub fn backend(&self, repository: &str) -> &BackendDescriptor {
        self.config.registry.matched(repository)
    }

    pub fn backends(&self) -> &[BackendDescriptor] {
        self.config.registry.backends()
    }

    pub(crate) async fn run(&self, commands: Vec<Command>) -> Result<Vec<u8>> {
        self.runner
            .run(&self.session, self.remaining_timeout(), commands)
            .await
    }

    pub(crate) fn append_cache_dir_flag(&self, args: &mut Vec<String>) {
        if self.config.enable_cache {
            args.push("--cache-dir".to_string());
            args.push(self.config.cache_dir().display().to_string());
        } else {
            args.push("--no-cache".to_string());
        }
    }

    pub(crate) fn append_cleanup_cache_flag(&self, args: &mut Vec<String>) {
        if self.config.enable_cache {
            args.push("--cleanup-cache".to_string());
        }
    }

    /// Tool invocation against one backend: cache flags, backend flags, backend env.
    pub(crate) fn restic_command(&self, backend: &BackendDescriptor, mut args: Vec<String>) -> Command {
        self.append_cache_dir_flag(&mut args);
        backend.append_backend_flags(&mut args);
        Command::new(RESTIC_CMD).args(args).envs(&backend.envs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{wrapper_with, Reply, ScriptedExecutor};

    #[tokio::test]
    async fn test_copy_has_independent_session() {
        let scratch = tempfile::tempdir().unwrap();
        let executor = ScriptedExecutor::new(|_| Reply::ok(""));
        let mut original = wrapper_with(executor, scratch.path(), &["repoA"], None).await;

        let mut copy = original.copy();
        copy.set_env("EXTRA", "1");
        copy.hide_cmd();
        original.set_env("OTHER", "2");

        assert_eq!(copy.get_env("EXTRA"), Some("1"));
        assert_eq!(original.get_env("EXTRA"), None);
        assert_eq!(copy.get_env("OTHER"), None);
        assert!(original.session.show_cmd);
        assert!(!copy.session.show_cmd);
        assert_eq!(copy.get_env(RESTIC_PROGRESS_FPS), Some(PROGRESS_FPS));
        assert!(Arc::ptr_eq(&original.config, &copy.config));
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_timeout_saturates_at_zero() {
        let scratch = tempfile::tempdir().unwrap();
        let executor = ScriptedExecutor::new(|_| Reply::ok(""));
        let wrapper = wrapper_with(executor, scratch.path(), &["repoA"], Some(Duration::from_secs(5))).await;

        let start = Instant::now();
        tokio::time::advance(Duration::from_secs(3)).await;
        wrapper.update_elapsed_timeout(start);
        assert_eq!(wrapper.remaining_timeout(), Some(Duration::from_secs(2)));

        let start = Instant::now();
        tokio::time::advance(Duration::from_secs(10)).await;
        wrapper.copy().update_elapsed_timeout(start);
        assert_eq!(wrapper.remaining_timeout(), Some(Duration::ZERO));
    }

    #[tokio::test]
    async fn test_dump_env_writes_backend_then_sorted_session_env() {
        let scratch = tempfile::tempdir().unwrap();
        let executor = ScriptedExecutor::new(|_| Reply::ok(""));
        let mut wrapper = wrapper_with(executor, scratch.path(), &["repoA"], None).await;
        wrapper.set_env("ZETA", "z");
        wrapper.set_env("ALPHA", "a");

        let out = scratch.path().join("dump");
        wrapper.dump_env("repoA", &out, "restic-envs").await.unwrap();

        let contents = std::fs::read_to_string(out.join("restic-envs")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert!(lines.iter().any(|l| l.starts_with("RESTIC_PASSWORD=")));
        let alpha = lines.iter().position(|l| *l == "ALPHA=a").unwrap();
        let zeta = lines.iter().position(|l| *l == "ZETA=z").unwrap();
        assert!(alpha < zeta);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(out.join("restic-envs")).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn test_session_accessors() {
        use resticwrap_backends::secret::{CA_CERT_DATA, RESTIC_PASSWORD};
        use resticwrap_backends::{FnResolver, Provider, Secret};

        let scratch = tempfile::tempdir().unwrap();
        let bucket = scratch.path().join("storage").display().to_string();
        let with_ca = BackendDescriptor::new("secure").with_resolver(Arc::new(FnResolver(
            move |b: &mut BackendDescriptor| {
                b.provider = Some(Provider::Local);
                b.bucket = bucket.clone();
                b.encryption_secret = Some(Secret::new("enc").with(RESTIC_PASSWORD, "pw"));
                b.storage_secret = Some(Secret::new("storage").with(CA_CERT_DATA, "PEM"));
                Ok(())
            },
        )));
        let mut backends = crate::testing::local_backends(scratch.path(), &["plain"]);
        backends.push(with_ca);
        let options = SetupOptions {
            scratch_dir: scratch.path().to_path_buf(),
            backends,
            ..Default::default()
        };
        let executor = ScriptedExecutor::new(|_| Reply::ok(""));
        let mut wrapper = ResticWrapper::with_executor(options, executor).await.unwrap();

        assert_eq!(wrapper.get_repo(), None);
        wrapper.set_env(RESTIC_REPOSITORY, "/srv/repo");
        assert_eq!(wrapper.get_repo(), Some("/srv/repo"));

        assert_eq!(wrapper.get_ca_path("plain"), None);
        assert_eq!(wrapper.get_ca_path("unknown"), None);
        let ca = wrapper.get_ca_path("secure").unwrap();
        assert_eq!(std::fs::read_to_string(ca).unwrap(), "PEM");

        wrapper.set_show_cmd(false);
        assert!(!wrapper.session.show_cmd);
        wrapper.set_show_cmd(true);
        assert!(wrapper.session.show_cmd);
    }

    #[tokio::test]
    async fn test_setup_failures_are_aggregated() {
        let scratch = tempfile::tempdir().unwrap();
        let options = SetupOptions {
            scratch_dir: scratch.path().to_path_buf(),
            backends: vec![BackendDescriptor::new("repoA"), BackendDescriptor::new("repoB")],
            ..Default::default()
        };
        let executor = ScriptedExecutor::new(|_| Reply::ok(""));

        let err = ResticWrapper::with_executor(options, executor).await.unwrap_err();
        assert_eq!(err.errors().len(), 2);
        assert!(err.to_string().contains("repoA"));
        assert!(err.to_string().contains("repoB"));
    }
}
