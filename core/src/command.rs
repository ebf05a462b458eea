use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::task::JoinHandle;
use tracing::debug;

pub const RESTIC_CMD: &str = "restic";

/// An external program invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub args: Vec<String>,
    pub envs: BTreeMap<String, String>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn envs(mut self, envs: &BTreeMap<String, String>) -> Self {
        self.envs
            .extend(envs.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn is_restic(&self) -> bool {
        self.name == RESTIC_CMD
    }
}

// Environment values carry credentials and are left out on purpose.
impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// One step of a pipeline.
///
/// Regular stages are chained stdout to stdin. Leaf stages all read the output of
/// the last regular stage, and their outputs are concatenated in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub command: Command,
    pub leaf: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    pub stages: Vec<Stage>,
    pub dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("empty command pipeline")]
    Empty,

    #[error("failed to start {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("{command} exited with {status}")]
    Exit { command: String, status: String },

    #[error("pipeline I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Keeps the last `capacity` bytes written to it. Cloning shares the buffer.
#[derive(Debug, Clone)]
pub struct StderrBuffer {
    inner: Arc<Mutex<VecDeque<u8>>>,
    capacity: usize,
}

impl StderrBuffer {
    pub const DEFAULT_CAPACITY: usize = 256;

    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn write(&self, data: &[u8]) {
        let mut buf = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let data = if data.len() > self.capacity {
            &data[data.len() - self.capacity..]
        } else {
            data
        };
        let overflow = (buf.len() + data.len()).saturating_sub(self.capacity);
        buf.drain(..overflow);
        buf.extend(data);
    }

    pub fn contents(&self) -> String {
        let buf = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let bytes: Vec<u8> = buf.iter().copied().collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl Default for StderrBuffer {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

/// Runs a pipeline of external commands and returns its stdout.
///
/// Implementations write everything the commands print on stderr into `stderr`.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, pipeline: Pipeline, stderr: StderrBuffer) -> Result<Vec<u8>, ExecError>;
}

/// Executes pipelines as real child processes.
///
/// Children are killed when the returned future is dropped, which is how callers
/// enforce timeouts.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    passthrough_stderr: bool,
}

impl ProcessExecutor {
    pub fn new() -> Self {
        Self {
            passthrough_stderr: true,
        }
    }

    /// Stops copying child stderr to this process's stderr.
    pub fn quiet(mut self) -> Self {
        self.passthrough_stderr = false;
        self
    }

    fn spawn(
        &self,
        command: &Command,
        dir: &Option<PathBuf>,
        env: &BTreeMap<String, String>,
        stdin: Stdio,
    ) -> Result<Child, ExecError> {
        let mut cmd = tokio::process::Command::new(&command.name);
        cmd.args(&command.args)
            .envs(env)
            .envs(&command.envs)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }
        cmd.spawn().map_err(|source| ExecError::Spawn {
            command: command.name.clone(),
            source,
        })
    }

    fn capture_stderr(&self, child: &mut Child, buffer: &StderrBuffer) -> Option<JoinHandle<()>> {
        let mut pipe = child.stderr.take()?;
        let buffer = buffer.clone();
        let passthrough = self.passthrough_stderr;
        Some(tokio::spawn(async move {
            let mut chunk = [0u8; 4096];
            let mut echo = tokio::io::stderr();
            loop {
                match pipe.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        buffer.write(&chunk[..n]);
                        if passthrough {
                            let _ = echo.write_all(&chunk[..n]).await;
                        }
                    }
                }
            }
        }))
    }
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn execute(&self, pipeline: Pipeline, stderr: StderrBuffer) -> Result<Vec<u8>, ExecError> {
        let Pipeline { stages, dir, env } = pipeline;
        if stages.is_empty() {
            return Err(ExecError::Empty);
        }
        let (chain, leaves): (Vec<Stage>, Vec<Stage>) = stages.into_iter().partition(|s| !s.leaf);

        let mut children: Vec<(String, Child)> = Vec::new();
        let mut stderr_tasks = Vec::new();
        let mut upstream: Option<ChildStdout> = None;

        for stage in &chain {
            let stdin = match upstream.take() {
                Some(out) => TryInto::<Stdio>::try_into(out)?,
                None => Stdio::null(),
            };
            let mut child = self.spawn(&stage.command, &dir, &env, stdin)?;
            stderr_tasks.extend(self.capture_stderr(&mut child, &stderr));
            upstream = child.stdout.take();
            children.push((stage.command.name.clone(), child));
        }

        let mut readers = Vec::new();
        let mut tee_task = None;
        if leaves.is_empty() {
            readers.extend(upstream.take().map(read_all));
        } else {
            let mut sinks: Vec<ChildStdin> = Vec::new();
            for stage in &leaves {
                let stdin = if upstream.is_some() {
                    Stdio::piped()
                } else {
                    Stdio::null()
                };
                let mut child = self.spawn(&stage.command, &dir, &env, stdin)?;
                stderr_tasks.extend(self.capture_stderr(&mut child, &stderr));
                sinks.extend(child.stdin.take());
                readers.extend(child.stdout.take().map(read_all));
                children.push((stage.command.name.clone(), child));
            }
            if let Some(source) = upstream.take() {
                tee_task = Some(tokio::spawn(tee(source, sinks)));
            }
        }

        let mut failure = None;
        for (name, mut child) in children {
            let status = child.wait().await?;
            if failure.is_none() && !status.success() {
                failure = Some(exit_error(name, status));
            }
        }

        let mut output = Vec::new();
        for reader in readers {
            let chunk = reader.await.map_err(io::Error::other)??;
            output.extend(chunk);
        }
        for task in stderr_tasks {
            let _ = task.await;
        }
        if let Some(task) = tee_task {
            if let Err(err) = task.await.map_err(io::Error::other)? {
                debug!(error = %err, "pipeline fan-out stopped early");
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(output),
        }
    }
}

fn exit_error(command: String, status: ExitStatus) -> ExecError {
    ExecError::Exit {
        command,
        status: status.to_string(),
    }
}

fn read_all<R>(mut reader: R) -> JoinHandle<io::Result<Vec<u8>>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        Ok(buf)
    })
}

// Copies one stream into every sink. A sink that stops accepting data is dropped
// without starving the others.
async fn tee(mut source: ChildStdout, mut sinks: Vec<ChildStdin>) -> io::Result<()> {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = source.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        let mut closed = Vec::new();
        for (idx, sink) in sinks.iter_mut().enumerate() {
            if sink.write_all(&buf[..n]).await.is_err() {
                closed.push(idx);
            }
        }
        for idx in closed.into_iter().rev() {
            sinks.remove(idx);
        }
        if sinks.is_empty() {
            return Ok(());
        }
    }
}
