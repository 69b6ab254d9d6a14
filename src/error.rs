//! Error handling module for hostops
//!
//! Provides the error taxonomy used across the crate:
//!
//! - [`PreconditionError`]: the environment is unfit, the run never starts
//! - [`ExecutionError`]: an external command could not be spawned or timed out
//! - [`StepFailure`]: a step judged a command result unsatisfactory
//! - [`HostOpsError`]: everything else (config, IO, usage, state transitions)

use std::time::Duration;

use thiserror::Error;

use crate::types::{OsFamily, Privilege};

/// Main error type for hostops
#[derive(Error, Debug)]
pub enum HostOpsError {
    /// IO errors (log files, lock files, config files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors (loading, parsing, validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid command-line usage (unknown step names, bad parameters)
    #[error("Usage error: {0}")]
    Usage(String),

    /// An input required by a procedure could not be obtained
    #[error("Input error: {0}")]
    Input(#[from] InputError),

    /// Environment precondition failed
    #[error("Precondition failed: {0}")]
    Precondition(#[from] PreconditionError),

    /// Run state machine transition errors
    #[error("Run transition error: {0}")]
    RunTransition(String),

    /// Report was modified after it was sealed
    #[error("Report error: {0}")]
    Report(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for hostops operations
pub type Result<T> = std::result::Result<T, HostOpsError>;

impl HostOpsError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a usage error
    pub fn usage(msg: impl Into<String>) -> Self {
        Self::Usage(msg.into())
    }

    /// Create a run transition error
    pub fn run_transition(msg: impl Into<String>) -> Self {
        Self::RunTransition(msg.into())
    }

    /// Create a report error
    pub fn report(msg: impl Into<String>) -> Self {
        Self::Report(msg.into())
    }
}

/// Reasons the environment is unfit for a procedure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PreconditionError {
    #[error("insufficient privilege: {required} required")]
    InsufficientPrivilege { required: Privilege },

    #[error("missing dependency: {0}")]
    MissingDependency(String),

    #[error("unsupported platform: expected {expected}, found {found}")]
    UnsupportedPlatform { expected: OsFamily, found: OsFamily },

    #[error("resource '{resource}' is held by another run")]
    ResourceBusy { resource: String },
}

/// Failure to run an external command at all.
///
/// A command that runs and exits non-zero is NOT an execution error; the
/// calling step decides what an exit code means.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("command not found: {program}")]
    NotFound { program: String },

    #[error("permission denied executing {program}")]
    PermissionDenied { program: String },

    #[error("{program} timed out after {}s", .timeout.as_secs_f64())]
    Timeout { program: String, timeout: Duration },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl ExecutionError {
    /// Map a spawn-time IO error to the matching variant.
    pub fn from_spawn(program: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound {
                program: program.to_string(),
            },
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied {
                program: program.to_string(),
            },
            _ => Self::Spawn {
                program: program.to_string(),
                source: err,
            },
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// A step's verdict that its work did not succeed.
#[derive(Error, Debug)]
pub enum StepFailure {
    #[error("{program} exited with {}: {stderr}", .exit_code.map_or_else(|| "signal".to_string(), |c| format!("code {c}")))]
    CommandFailed {
        program: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("missing parameter: {0}")]
    MissingParameter(String),

    #[error(transparent)]
    Input(#[from] InputError),

    #[error("{0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StepFailure {
    /// Create a generic failure from a message
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}

/// Errors raised by input providers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InputError {
    #[error("no answer available for '{0}' (running non-interactively)")]
    Unavailable(String),

    #[error("input closed while reading '{0}'")]
    Closed(String),

    #[error("failed to read input: {0}")]
    Read(String),
}
