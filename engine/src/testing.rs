//! Scripted executor standing in for the real tool in engine tests.

use crate::options::SetupOptions;
use crate::wrapper::ResticWrapper;
use async_trait::async_trait;
use resticwrap_backends::secret::RESTIC_PASSWORD;
use resticwrap_backends::{BackendDescriptor, FnResolver, Provider, Secret};
use resticwrap_core::{Command, CommandExecutor, ExecError, Pipeline, StderrBuffer};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub(crate) struct Reply {
    pub stdout: Vec<u8>,
    pub stderr: String,
    pub fail: bool,
    pub delay: Option<Duration>,
}

impl Reply {
    pub fn ok(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    pub fn fail(stderr: impl Into<String>) -> Self {
        Self {
            stderr: stderr.into(),
            fail: true,
            ..Default::default()
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// The commands of one executed pipeline.
#[derive(Debug, Clone)]
pub(crate) struct Call {
    pub commands: Vec<Command>,
}

impl Call {
    pub fn restic(&self) -> impl Iterator<Item = &Command> {
        self.commands.iter().filter(|c| c.is_restic())
    }

    /// Whether the first tool invocation starts with these arguments.
    pub fn starts_with(&self, prefix: &[&str]) -> bool {
        self.restic()
            .next()
            .is_some_and(|c| c.args.len() >= prefix.len() && c.args.iter().zip(prefix).all(|(a, p)| a == p))
    }

    pub fn has_arg(&self, arg: &str) -> bool {
        self.restic().any(|c| c.args.iter().any(|a| a == arg))
    }

    pub fn envs(&self) -> &std::collections::BTreeMap<String, String> {
        &self.commands[self.commands.len() - 1].envs
    }
}

pub(crate) fn args_of(call: &Call) -> Vec<String> {
    call.restic().next().map(|c| c.args.clone()).unwrap_or_default()
}

type Handler = Box<dyn Fn(&Call) -> Reply + Send + Sync>;

pub(crate) struct ScriptedExecutor {
    handler: Handler,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedExecutor {
    pub fn new(handler: impl Fn(&Call) -> Reply + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &[&str]) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn execute(&self, pipeline: Pipeline, stderr: StderrBuffer) -> Result<Vec<u8>, ExecError> {
        let call = Call {
            commands: pipeline.stages.into_iter().map(|s| s.command).collect(),
        };
        let reply = (self.handler)(&call);
        self.calls.lock().unwrap().push(call);

        if let Some(delay) = reply.delay {
            tokio::time::sleep(delay).await;
        }
        stderr.write(reply.stderr.as_bytes());
        if reply.fail {
            return Err(ExecError::Exit {
                command: "restic".to_string(),
                status: "exit status: 1".to_string(),
            });
        }
        Ok(reply.stdout)
    }
}

/// Local backends rooted in `scratch`, one per repository name.
pub(crate) fn local_backends(scratch: &Path, repositories: &[&str]) -> Vec<BackendDescriptor> {
    repositories
        .iter()
        .map(|repository| {
            let bucket = scratch.join("storage").display().to_string();
            let directory = repository.to_string();
            let resolver = FnResolver(move |b: &mut BackendDescriptor| {
                b.provider = Some(Provider::Local);
                b.bucket = bucket.clone();
                b.directory = directory.clone();
                b.encryption_secret = Some(Secret::new("encryption").with(RESTIC_PASSWORD, "secret"));
                Ok(())
            });
            BackendDescriptor::new(*repository).with_resolver(Arc::new(resolver))
        })
        .collect()
}

pub(crate) async fn wrapper_with(
    executor: Arc<ScriptedExecutor>,
    scratch: &Path,
    repositories: &[&str],
    timeout: Option<Duration>,
) -> ResticWrapper {
    let options = SetupOptions {
        scratch_dir: scratch.to_path_buf(),
        timeout,
        backends: local_backends(scratch, repositories),
        ..Default::default()
    };
    ResticWrapper::with_executor(options, executor).await.unwrap()
}

/// One `summary` line as printed by `backup --json`.
pub(crate) fn summary_line(snapshot_id: &str, bytes: u64) -> String {
    format!(
        r#"{{"message_type":"summary","files_new":1,"files_changed":0,"files_unmodified":2,"data_added":{bytes},"total_files_processed":3,"total_bytes_processed":{bytes},"total_duration":1.5,"snapshot_id":"{snapshot_id}"}}"#
    )
}
