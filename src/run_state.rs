//! Run State Machine
//!
//! Tracks the lifecycle of a single run and rejects invalid transitions.
//!
//! ```text
//! NotStarted
//!     ↓ begin()
//! Running
//!     ↓ complete()          ↓ abort(reason)
//! Completed             Aborted
//! ```
//!
//! `Completed` and `Aborted` are terminal. A run is aborted by a critical
//! step failure, a precondition failure, or cancellation; non-critical
//! failures never abort. There are no automatic retries: re-running means
//! starting a new run.

use std::fmt;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    NotStarted,
    Running,
    Completed,
    Aborted,
}

impl RunState {
    /// Returns true if this is a terminal state (Completed or Aborted)
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::NotStarted => "Not started",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Aborted => "Aborted",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Why a run ended in `Aborted`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AbortReason {
    /// A step declared critical failed
    CriticalStepFailed { step: String },
    /// The environment check failed before any step ran
    Precondition { message: String },
    /// An operator signal arrived; the run stopped between steps
    Cancelled,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CriticalStepFailed { step } => write!(f, "critical step '{}' failed", step),
            Self::Precondition { message } => write!(f, "precondition failed: {}", message),
            Self::Cancelled => write!(f, "cancelled by operator"),
        }
    }
}

/// Errors that can occur during state transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunTransitionError {
    #[error("Cannot transition from terminal state {from}")]
    FromTerminalState { from: RunState },

    #[error("Run already started (state {from})")]
    AlreadyStarted { from: RunState },

    #[error("Run not started; cannot move to {to}")]
    NotRunning { to: RunState },
}

impl From<RunTransitionError> for crate::error::HostOpsError {
    fn from(err: RunTransitionError) -> Self {
        crate::error::HostOpsError::RunTransition(err.to_string())
    }
}

/// Owns the current state of one run plus its transition history.
#[derive(Debug, Clone)]
pub struct RunTracker {
    current: RunState,
    abort_reason: Option<AbortReason>,
    history: Vec<(RunState, DateTime<Local>)>,
}

impl Default for RunTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RunTracker {
    pub fn new() -> Self {
        Self {
            current: RunState::NotStarted,
            abort_reason: None,
            history: Vec::with_capacity(3),
        }
    }

    #[inline]
    pub fn state(&self) -> RunState {
        self.current
    }

    pub fn abort_reason(&self) -> Option<&AbortReason> {
        self.abort_reason.as_ref()
    }

    /// Transitions taken so far, with the time each was entered
    pub fn history(&self) -> &[(RunState, DateTime<Local>)] {
        &self.history
    }

    /// `NotStarted -> Running`
    pub fn begin(&mut self) -> Result<(), RunTransitionError> {
        match self.current {
            RunState::NotStarted => {
                self.enter(RunState::Running);
                Ok(())
            }
            state if state.is_terminal() => {
                Err(RunTransitionError::FromTerminalState { from: state })
            }
            state => Err(RunTransitionError::AlreadyStarted { from: state }),
        }
    }

    /// `Running -> Completed`
    pub fn complete(&mut self) -> Result<(), RunTransitionError> {
        self.ensure_running(RunState::Completed)?;
        self.enter(RunState::Completed);
        Ok(())
    }

    /// `Running -> Aborted`
    pub fn abort(&mut self, reason: AbortReason) -> Result<(), RunTransitionError> {
        self.ensure_running(RunState::Aborted)?;
        self.abort_reason = Some(reason);
        self.enter(RunState::Aborted);
        Ok(())
    }

    fn ensure_running(&self, to: RunState) -> Result<(), RunTransitionError> {
        match self.current {
            RunState::Running => Ok(()),
            RunState::NotStarted => Err(RunTransitionError::NotRunning { to }),
            from => Err(RunTransitionError::FromTerminalState { from }),
        }
    }

    fn enter(&mut self, state: RunState) {
        self.history.push((state, Local::now()));
        self.current = state;
    }
}
