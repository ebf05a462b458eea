use crate::command::{Command, CommandExecutor, ExecError, Pipeline, Stage, StderrBuffer, RESTIC_CMD};
use crate::error::{DEADLINE_EXCEEDED, SIGNAL_TERMINATED};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// CPU priority applied through `nice`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NiceSettings {
    pub adjustment: Option<i32>,
}

/// I/O priority applied through `ionice`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoNiceSettings {
    pub class: Option<i32>,
    pub class_data: Option<i32>,
}

/// Per-handle process state: working directory, extra environment, echo flag.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub env: BTreeMap<String, String>,
    pub dir: Option<PathBuf>,
    pub show_cmd: bool,
}

pub type PathLookup = fn(&str) -> std::result::Result<PathBuf, which::Error>;

fn lookup_in_path(name: &str) -> std::result::Result<PathBuf, which::Error> {
    which::which(name)
}

/// Turns commands into a pipeline, runs it and maps failures into [`Error`].
#[derive(Clone)]
pub struct CommandRunner {
    executor: Arc<dyn CommandExecutor>,
    nice: Option<NiceSettings>,
    ionice: Option<IoNiceSettings>,
    lookup: PathLookup,
    stderr_capacity: usize,
}

impl fmt::Debug for CommandRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRunner")
            .field("nice", &self.nice)
            .field("ionice", &self.ionice)
            .field("stderr_capacity", &self.stderr_capacity)
            .finish_non_exhaustive()
    }
}

impl CommandRunner {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            nice: None,
            ionice: None,
            lookup: lookup_in_path,
            stderr_capacity: StderrBuffer::DEFAULT_CAPACITY,
        }
    }

    pub fn with_nice(mut self, nice: Option<NiceSettings>) -> Self {
        self.nice = nice;
        self
    }

    pub fn with_ionice(mut self, ionice: Option<IoNiceSettings>) -> Self {
        self.ionice = ionice;
        self
    }

    pub fn with_path_lookup(mut self, lookup: PathLookup) -> Self {
        self.lookup = lookup;
        self
    }

    /// Runs the commands as one pipeline under an optional overall timeout.
    pub async fn run(
        &self,
        session: &Session,
        timeout: Option<Duration>,
        commands: Vec<Command>,
    ) -> Result<Vec<u8>> {
        let stages = self.prepare(commands)?;
        if session.show_cmd {
            for stage in &stages {
                info!(command = %stage.command, leaf = stage.leaf, "running command");
            }
        }

        let stderr = StderrBuffer::new(self.stderr_capacity);
        let pipeline = Pipeline {
            stages,
            dir: session.dir.clone(),
            env: session.env.clone(),
        };
        let execution = self.executor.execute(pipeline, stderr.clone());
        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, execution).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(Error::DeadlineExceeded(format!(
                        "{DEADLINE_EXCEEDED}: command did not finish within {limit:?}"
                    )));
                }
            },
            None => execution.await,
        };

        match result {
            Ok(output) => {
                debug!(output = %String::from_utf8_lossy(&output), "command output");
                Ok(output)
            }
            Err(err) => Err(format_error(err, &stderr.contents())),
        }
    }

    /// Marks leaf stages and applies priority wrappers.
    pub fn prepare(&self, commands: Vec<Command>) -> Result<Vec<Stage>> {
        let leaf_required = is_leaf_command_necessary(&commands);
        commands
            .into_iter()
            .map(|command| {
                let leaf = leaf_required && command.is_restic();
                let command = self.apply_nice_settings_if_command_matches(command, &[RESTIC_CMD])?;
                Ok(Stage { command, leaf })
            })
            .collect()
    }

    fn apply_nice_settings_if_command_matches(
        &self,
        command: Command,
        matching: &[&str],
    ) -> Result<Command> {
        if !matching.contains(&command.name.as_str()) {
            return Ok(command);
        }
        let command = self.apply_nice_settings(command)?;
        self.apply_ionice_settings(command)
    }

    fn apply_nice_settings(&self, command: Command) -> Result<Command> {
        let Some(nice) = &self.nice else {
            return Ok(command);
        };
        let mut wrapped = Command::new(self.locate("nice")?);
        if let Some(adjustment) = nice.adjustment {
            wrapped = wrapped.arg("-n").arg(adjustment.to_string());
        }
        Ok(wrap(wrapped, command))
    }

    fn apply_ionice_settings(&self, command: Command) -> Result<Command> {
        let Some(ionice) = &self.ionice else {
            return Ok(command);
        };
        let mut wrapped = Command::new(self.locate("ionice")?);
        if let Some(class) = ionice.class {
            wrapped = wrapped.arg("-c").arg(class.to_string());
        }
        if let Some(class_data) = ionice.class_data {
            wrapped = wrapped.arg("-n").arg(class_data.to_string());
        }
        Ok(wrap(wrapped, command))
    }

    fn locate(&self, name: &str) -> Result<String> {
        let path = (self.lookup)(name).map_err(|source| Error::ToolNotFound {
            name: name.to_string(),
            source,
        })?;
        Ok(path.display().to_string())
    }
}

fn wrap(wrapper: Command, inner: Command) -> Command {
    let Command { name, args, envs } = inner;
    let mut wrapped = wrapper.arg(name).args(args);
    wrapped.envs = envs;
    wrapped
}

/// Several tool invocations in one chain run as leaves instead of pipe stages.
pub fn is_leaf_command_necessary(commands: &[Command]) -> bool {
    commands.iter().filter(|c| c.is_restic()).count() > 1
}

/// Builds the user-facing error from the captured tail of stderr.
///
/// The first captured line may be cut by the ring buffer and is skipped when more
/// lines follow. A signal-termination marker on the second line turns the error
/// into a deadline condition.
pub fn format_error(err: ExecError, stderr: &str) -> Error {
    let lines: Vec<&str> = stderr
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .collect();

    match lines.as_slice() {
        [_, second, rest @ ..] if second.contains(SIGNAL_TERMINATED) => {
            let mut parts = vec![DEADLINE_EXCEEDED];
            parts.extend(rest.iter().copied());
            Error::DeadlineExceeded(parts.join(" "))
        }
        [_, rest @ ..] if !rest.is_empty() => Error::Command(rest.join(" ")),
        [only] => Error::Command(format!("{err}: {only}")),
        _ => Error::Command(err.to_string()),
    }
}
