//! Steps and their outcomes.
//!
//! A [`Step`] is one named unit of orchestrated work. Its action receives the
//! run's read-only [`Context`] and returns an [`Outcome`]; returning
//! `Err(StepFailure)` is shorthand for `Outcome::Failure`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::error::StepFailure;

/// Boxed step body
pub type StepAction = Box<dyn Fn(&Context) -> Result<Outcome, StepFailure> + Send + Sync>;

/// Result of executing one step. Produced once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success { detail: String },
    Failure { error: String, detail: String },
    Skipped { reason: String },
}

impl Outcome {
    pub fn success(detail: impl Into<String>) -> Self {
        Self::Success {
            detail: detail.into(),
        }
    }

    pub fn failure(error: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Failure {
            error: error.into(),
            detail: detail.into(),
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped { .. })
    }

    /// Short label used in log lines
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::Failure { .. } => "failure",
            Self::Skipped { .. } => "skipped",
        }
    }
}

impl From<StepFailure> for Outcome {
    fn from(err: StepFailure) -> Self {
        let detail = match &err {
            StepFailure::CommandFailed { program, .. } => format!("command: {program}"),
            StepFailure::Execution(_) => "command could not be executed".to_string(),
            StepFailure::MissingParameter(_) | StepFailure::Input(_) => {
                "parameter not provided".to_string()
            }
            StepFailure::Invalid(_) | StepFailure::Io(_) => String::new(),
        };
        Self::Failure {
            error: err.to_string(),
            detail,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success { detail } if detail.is_empty() => write!(f, "success"),
            Self::Success { detail } => write!(f, "success: {detail}"),
            Self::Failure { error, detail } if detail.is_empty() => write!(f, "failure: {error}"),
            Self::Failure { error, detail } => write!(f, "failure: {error} ({detail})"),
            Self::Skipped { reason } => write!(f, "skipped: {reason}"),
        }
    }
}

/// One named unit of work.
pub struct Step {
    name: String,
    description: String,
    critical: bool,
    action: StepAction,
}

impl Step {
    /// A step whose failure aborts the rest of the run
    pub fn critical<F>(name: impl Into<String>, action: F) -> Self
    where
        F: Fn(&Context) -> Result<Outcome, StepFailure> + Send + Sync + 'static,
    {
        Self::new(name, true, action)
    }

    /// A step whose failure is recorded and the run continues
    pub fn optional<F>(name: impl Into<String>, action: F) -> Self
    where
        F: Fn(&Context) -> Result<Outcome, StepFailure> + Send + Sync + 'static,
    {
        Self::new(name, false, action)
    }

    pub fn new<F>(name: impl Into<String>, critical: bool, action: F) -> Self
    where
        F: Fn(&Context) -> Result<Outcome, StepFailure> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: String::new(),
            critical,
            action: Box::new(action),
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn is_critical(&self) -> bool {
        self.critical
    }

    /// Invoke the action; errors become `Outcome::Failure`.
    pub fn run(&self, ctx: &Context) -> Outcome {
        match (self.action)(ctx) {
            Ok(outcome) => outcome,
            Err(err) => err.into(),
        }
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("critical", &self.critical)
            .finish_non_exhaustive()
    }
}
