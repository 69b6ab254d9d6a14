//! Procedures and the orchestration around a run.
//!
//! A [`Procedure`] declares what it needs (requirements, shared resource,
//! operator inputs) and the ordered [`Step`]s it runs. [`orchestrate`] wires
//! everything together:
//!
//! ```text
//! filter steps -> resolve inputs -> resource lock -> preconditions
//!              -> context -> step runner -> sealed report
//! ```
//!
//! A lock or precondition failure still produces a sealed report (zero
//! entries, `Aborted`) so every run leaves the same evidence behind.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Local;
use tracing::{error, info, warn};

use crate::command_executor::Executor;
use crate::config::OpsConfig;
use crate::context::{self, Context, Params, TIMESTAMP_TAG_FORMAT};
use crate::error::{HostOpsError, PreconditionError, Result};
use crate::input::{resolve_inputs, InputProvider, InputRequest, NonInteractive};
use crate::preconditions::{HostProbe, PreconditionChecker, Requirements, SystemProbe};
use crate::process_guard::CancelFlag;
use crate::report::{FileTarget, RunReport, Summary};
use crate::resource_lock::ResourceLock;
use crate::run_state::AbortReason;
use crate::runner::{validate_step_names, StepFilter, StepRunner};
use crate::step::Step;

/// A named, ordered list of steps plus what it needs from the host
pub trait Procedure: Send + Sync {
    /// CLI name, e.g. `system-update`
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn requirements(&self) -> Requirements {
        Requirements::new()
    }

    /// Shared resource held exclusively for the whole run
    fn resource(&self) -> Option<&'static str> {
        None
    }

    /// Answers collected before the run starts
    fn inputs(&self) -> Vec<InputRequest> {
        Vec::new()
    }

    fn steps(&self) -> Vec<Step>;
}

/// Everything a run needs besides the procedure itself
pub struct RunEnv {
    pub config: Arc<OpsConfig>,
    pub executor: Arc<dyn Executor>,
    pub probe: Box<dyn SystemProbe>,
    pub input: Box<dyn InputProvider>,
    pub filter: StepFilter,
    pub skip_root_check: bool,
    pub cancel: CancelFlag,
    /// Directory for the per-run log file; no file when `None`
    pub log_dir: Option<PathBuf>,
}

impl RunEnv {
    pub fn new(config: Arc<OpsConfig>, executor: Arc<dyn Executor>) -> Self {
        Self {
            config,
            executor,
            probe: Box::new(HostProbe),
            input: Box::new(NonInteractive),
            filter: StepFilter::default(),
            skip_root_check: false,
            cancel: CancelFlag::new(),
            log_dir: None,
        }
    }

    pub fn with_probe(mut self, probe: impl SystemProbe + 'static) -> Self {
        self.probe = Box::new(probe);
        self
    }

    pub fn with_input(mut self, input: Box<dyn InputProvider>) -> Self {
        self.input = input;
        self
    }

    pub fn with_filter(mut self, filter: StepFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn skip_root_check(mut self, skip: bool) -> Self {
        self.skip_root_check = skip;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }
}

/// Sealed report of one run plus where its log went
#[derive(Debug)]
pub struct RunOutcome {
    pub report: RunReport,
    pub summary: Summary,
    pub log_file: Option<PathBuf>,
}

impl RunOutcome {
    /// `0` clean, `1` aborted by a step or cancellation, `2` refused by a
    /// precondition
    pub fn exit_code(&self) -> i32 {
        match &self.report.abort_reason {
            _ if self.summary.is_clean() => 0,
            Some(AbortReason::Precondition { .. }) => 2,
            _ => 1,
        }
    }
}

/// Run `procedure` end to end.
///
/// Returns `Err` only when the run cannot be set up at all (unknown step in
/// the filter, unanswerable input, lock directory unusable); a refused or
/// failed run is an `Ok` with an aborted report.
pub fn orchestrate(
    procedure: &dyn Procedure,
    mut params: Params,
    mut runner: StepRunner,
    env: &RunEnv,
) -> Result<RunOutcome> {
    let name = procedure.name();
    let steps = env.filter.apply(procedure.steps())?;
    validate_step_names(&steps)?;

    resolve_inputs(&procedure.inputs(), &mut params, env.input.as_ref())?;

    let started_at = Local::now();
    let run_id = context::run_id(name, started_at);
    let log_file = env.log_dir.as_ref().and_then(|dir| {
        let tag = started_at.format(TIMESTAMP_TAG_FORMAT).to_string();
        match FileTarget::create_for_run(dir, name, &tag) {
            Ok(target) => {
                let path = target.path().to_path_buf();
                runner.add_target(Box::new(target));
                Some(path)
            }
            Err(e) => {
                warn!("Cannot create run log in {:?}: {}; logging to console only", dir, e);
                None
            }
        }
    });

    info!("Starting procedure '{}' (run {})", name, run_id);

    let _lock = match procedure.resource() {
        Some(resource) => match ResourceLock::acquire(&env.config.lock_dir, resource) {
            Ok(lock) => Some(lock),
            Err(HostOpsError::Precondition(e)) => {
                return refuse(runner, name, &run_id, steps.len(), e, log_file);
            }
            Err(e) => return Err(e),
        },
        None => None,
    };

    let checker =
        PreconditionChecker::new(env.probe.as_ref()).skip_privilege_check(env.skip_root_check);
    let capabilities = match checker.check(&procedure.requirements()) {
        Ok(capabilities) => capabilities,
        Err(e) => return refuse(runner, name, &run_id, steps.len(), e, log_file),
    };

    let ctx = Context::builder(name, Arc::clone(&env.config), Arc::clone(&env.executor))
        .capabilities(capabilities)
        .params(params)
        .cancel_flag(env.cancel.clone())
        .started_at(started_at)
        .build();

    let report = runner.run(&steps, &ctx)?;
    let summary = report.summary();
    Ok(RunOutcome {
        report,
        summary,
        log_file,
    })
}

fn refuse(
    runner: StepRunner,
    procedure: &str,
    run_id: &str,
    declared_steps: usize,
    err: PreconditionError,
    log_file: Option<PathBuf>,
) -> Result<RunOutcome> {
    error!("Procedure '{}' refused: {}", procedure, err);
    let report = runner.reject(
        procedure,
        run_id,
        declared_steps,
        AbortReason::Precondition {
            message: err.to_string(),
        },
    )?;
    let summary = report.summary();
    Ok(RunOutcome {
        report,
        summary,
        log_file,
    })
}
