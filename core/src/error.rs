use std::fmt;
use thiserror::Error;

/// Stderr marker the backup tool prints when it is killed by a signal.
pub const SIGNAL_TERMINATED: &str = "signal terminated";

/// Message prefix used for every timeout or signal-kill condition.
pub const DEADLINE_EXCEEDED: &str = "deadline exceeded or signal terminated";

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("failed to parse output of {operation}: {source}")]
    Parse {
        operation: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{name} not found in PATH: {source}")]
    ToolNotFound {
        name: String,
        #[source]
        source: which::Error,
    },

    #[error("{0}")]
    Command(String),

    #[error("{0}")]
    DeadlineExceeded(String),

    #[error("timeout waiting for exclusive lock to be released in repository {repository}")]
    LockWaitTimeout { repository: String },

    #[error("{operation} cancelled")]
    Cancelled { operation: String },

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },

    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wraps the error with a description of what was being attempted.
    pub fn context(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Combines errors into one value. Returns `None` when there is nothing to report.
    pub fn aggregate(errors: Vec<Error>) -> Option<Error> {
        if errors.is_empty() {
            None
        } else {
            Some(Error::Aggregate(AggregateError(errors)))
        }
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        match self {
            Error::DeadlineExceeded(_) => true,
            Error::Context { source, .. } => source.is_deadline_exceeded(),
            _ => false,
        }
    }

    /// True when the tool refused to run because the repository is locked.
    pub fn is_lock_contention(&self) -> bool {
        let message = self.to_string();
        message.contains("unlock") || message.contains("already locked")
    }

    /// Failures of the individual operations when this is an aggregate.
    pub fn errors(&self) -> &[Error] {
        match self {
            Error::Aggregate(aggregate) => aggregate.errors(),
            other => std::slice::from_ref(other),
        }
    }
}

/// Several independent failures reported together.
#[derive(Debug)]
pub struct AggregateError(Vec<Error>);

impl AggregateError {
    pub fn errors(&self) -> &[Error] {
        &self.0
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let [single] = self.0.as_slice() {
            return write!(f, "{single}");
        }
        let messages: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        write!(f, "[{}]", messages.join(", "))
    }
}

impl std::error::Error for AggregateError {}
