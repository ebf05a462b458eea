pub mod command;
pub mod error;
pub mod output;
pub mod poll;
pub mod runner;
pub mod types;

pub use command::{Command, CommandExecutor, ExecError, Pipeline, ProcessExecutor, Stage, StderrBuffer, RESTIC_CMD};
pub use error::{AggregateError, Error, Result};
pub use poll::{poll_until, PollConfig, PollError};
pub use runner::{CommandRunner, IoNiceSettings, NiceSettings, Session};
pub use types::*;
