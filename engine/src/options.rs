use resticwrap_backends::BackendDescriptor;
use resticwrap_core::{Command, IoNiceSettings, NiceSettings};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_SCRATCH_DIR: &str = "/tmp";
pub const DEFAULT_HOST: &str = "host-0";
pub const DEFAULT_OUTPUT_FILE_NAME: &str = "output.json";

/// Everything a wrapper needs at construction time.
#[derive(Debug, Clone)]
pub struct SetupOptions {
    pub enable_cache: bool,
    pub scratch_dir: PathBuf,
    pub nice: Option<NiceSettings>,
    pub ionice: Option<IoNiceSettings>,
    /// Overall budget shared by every command the wrapper runs
    pub timeout: Option<Duration>,
    pub backends: Vec<BackendDescriptor>,
}

impl Default for SetupOptions {
    fn default() -> Self {
        Self {
            enable_cache: false,
            scratch_dir: PathBuf::from(DEFAULT_SCRATCH_DIR),
            nice: None,
            ionice: None,
            timeout: None,
            backends: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    pub host: String,
    pub backup_paths: Vec<String>,
    /// Commands whose output is streamed into the tool instead of reading paths
    pub stdin_pipe_commands: Vec<Command>,
    pub stdin_file_name: String,
    pub exclude: Vec<String>,
    pub tags: Vec<String>,
    pub args: Vec<String>,
}

impl BackupOptions {
    pub fn is_stdin(&self) -> bool {
        !self.stdin_pipe_commands.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    pub host: String,
    pub source_host: String,
    pub restore_paths: Vec<String>,
    /// When set, `source_host` and `restore_paths` are ignored
    pub snapshots: Vec<String>,
    pub destination: String,
    pub exclude: Vec<String>,
    pub include: Vec<String>,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DumpOptions {
    pub host: String,
    pub source_host: String,
    pub snapshot: String,
    pub path: String,
    pub file_name: String,
    pub stdout_pipe_commands: Vec<Command>,
}

#[derive(Debug, Clone, Default)]
pub struct KeyOptions {
    pub id: String,
    pub user: String,
    pub host: String,
    pub file: String,
}
