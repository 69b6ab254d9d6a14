//! hostops Library
//!
//! Runs host maintenance procedures (updates, backups, hardening,
//! monitoring, user management) as ordered lists of steps with explicit
//! criticality, guarded subprocess execution and a timestamped run log.

pub mod cli;
pub mod command_executor;
pub mod config;
pub mod context;
pub mod error;
pub mod input;
pub mod preconditions;
pub mod procedure;
pub mod procedures;
pub mod process_guard;
pub mod report;
pub mod resource_lock;
pub mod run_state;
pub mod runner;
pub mod step;
pub mod types;

// Re-export main types for convenience
pub use command_executor::{
    CommandOutput, CommandSpec, Executor, ScriptedExecutor, ScriptedResponse, SystemExecutor,
};
pub use config::OpsConfig;
pub use context::{Context, Params};
pub use error::{ExecutionError, HostOpsError, InputError, PreconditionError, Result, StepFailure};
pub use input::{InputProvider, InputRequest, NonInteractive, PresetInput, PromptInput};
pub use preconditions::{Capabilities, HostProbe, PreconditionChecker, Requirements, SystemProbe};
pub use procedure::{orchestrate, Procedure, RunEnv, RunOutcome};
pub use process_guard::{CancelFlag, ChildRegistry, CommandProcessGroup, ProcessGuard};
pub use report::{ReportEntry, ReportSink, RunReport, Summary};
pub use resource_lock::ResourceLock;
pub use run_state::{AbortReason, RunState, RunTracker};
pub use runner::{StepFilter, StepRunner};
pub use step::{Outcome, Step};
pub use types::{FirewallBackend, LogLevel, OsFamily, PackageManager, Privilege, ServiceManager};
