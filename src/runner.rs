//! Step Runner
//!
//! Executes a procedure's steps strictly in order against one [`Context`]:
//!
//! 1. `NotStarted -> Running`
//! 2. for each step: cancellation check, start line, guarded invocation,
//!    one [`ReportEntry`] recorded before the next step starts
//! 3. a critical failure stops the run (`Aborted`), a non-critical one is
//!    recorded and the run continues
//! 4. the report is sealed and the summary printed
//!
//! There is no rollback and no automatic retry. Re-running a subset of steps
//! is an operator decision expressed through [`StepFilter`].

use std::any::Any;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use chrono::Local;
use tracing::{debug, error, warn};

use crate::context::Context;
use crate::error::{HostOpsError, Result};
use crate::report::{LogTarget, ReportEntry, ReportSink, RunReport};
use crate::run_state::{AbortReason, RunTracker};
use crate::step::{Outcome, Step};
use crate::types::LogLevel;

/// Reject step lists with a repeated name
pub fn validate_step_names(steps: &[Step]) -> Result<()> {
    let mut seen = HashSet::with_capacity(steps.len());
    for step in steps {
        if !seen.insert(step.name()) {
            return Err(HostOpsError::usage(format!(
                "duplicate step name '{}'",
                step.name()
            )));
        }
    }
    Ok(())
}

/// `--only` / `--skip` selection applied before a run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepFilter {
    only: Vec<String>,
    skip: Vec<String>,
}

impl StepFilter {
    pub fn new(only: Vec<String>, skip: Vec<String>) -> Self {
        Self { only, skip }
    }

    pub fn is_empty(&self) -> bool {
        self.only.is_empty() && self.skip.is_empty()
    }

    /// Keep the selected steps in declaration order. Naming a step the
    /// procedure does not have is a usage error.
    pub fn apply(&self, steps: Vec<Step>) -> Result<Vec<Step>> {
        if self.is_empty() {
            return Ok(steps);
        }

        let known: HashSet<&str> = steps.iter().map(Step::name).collect();
        let unknown: Vec<&str> = self
            .only
            .iter()
            .chain(&self.skip)
            .map(String::as_str)
            .filter(|name| !known.contains(name))
            .collect();
        if !unknown.is_empty() {
            let mut available: Vec<&str> = steps.iter().map(Step::name).collect();
            available.sort_unstable();
            return Err(HostOpsError::usage(format!(
                "unknown step(s): {} (available: {})",
                unknown.join(", "),
                available.join(", ")
            )));
        }

        Ok(steps
            .into_iter()
            .filter(|s| self.only.is_empty() || self.only.iter().any(|n| n == s.name()))
            .filter(|s| !self.skip.iter().any(|n| n == s.name()))
            .collect())
    }
}

/// Drives one run and owns the log targets its report is mirrored to
#[derive(Default)]
pub struct StepRunner {
    targets: Vec<Box<dyn LogTarget>>,
}

impl StepRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_target(mut self, target: impl LogTarget + 'static) -> Self {
        self.targets.push(Box::new(target));
        self
    }

    pub fn add_target(&mut self, target: Box<dyn LogTarget>) {
        self.targets.push(target);
    }

    fn sink(self, report: RunReport) -> ReportSink {
        let mut sink = ReportSink::new(report);
        for target in self.targets {
            sink.add_target(target);
        }
        sink
    }

    /// Execute `steps` in order and return the sealed report.
    ///
    /// Fails only for a malformed step list (duplicate names); step failures
    /// and panics are recorded as entries, never returned.
    pub fn run(self, steps: &[Step], ctx: &Context) -> Result<RunReport> {
        validate_step_names(steps)?;

        let mut tracker = RunTracker::new();
        let mut report = RunReport::new(ctx.procedure(), ctx.run_id(), steps.len());
        report.started_at = ctx.started_at();
        let mut sink = self.sink(report);

        tracker.begin()?;
        let mode = if ctx.is_dry_run() { " [DRY RUN]" } else { "" };
        sink.log(
            LogLevel::Info,
            &format!(
                "Starting {} ({} steps, run {}){}",
                ctx.procedure(),
                steps.len(),
                ctx.run_id(),
                mode
            ),
        );

        let total = steps.len();
        let mut abort = None;
        for (index, step) in steps.iter().enumerate() {
            if ctx.is_cancelled() {
                warn!("Cancellation requested before step '{}'", step.name());
                abort = Some(AbortReason::Cancelled);
                break;
            }

            sink.log(
                LogLevel::Info,
                &format!("Step {}/{}: {}", index + 1, total, step.name()),
            );
            let started_at = Local::now();
            let clock = Instant::now();
            let outcome = invoke_guarded(step, ctx);
            let duration = clock.elapsed();
            debug!("Step '{}' finished in {:?}: {}", step.name(), duration, outcome.label());

            let halt = outcome.is_failure() && step.is_critical();
            sink.record(ReportEntry {
                step: step.name().to_string(),
                critical: step.is_critical(),
                outcome,
                started_at,
                duration,
            })?;

            if halt {
                // A signal kills the running command, so the step fails first
                abort = Some(if ctx.is_cancelled() {
                    warn!("Step '{}' failed after cancellation was requested", step.name());
                    AbortReason::Cancelled
                } else {
                    error!("Critical step '{}' failed, aborting run", step.name());
                    AbortReason::CriticalStepFailed {
                        step: step.name().to_string(),
                    }
                });
                break;
            }
        }

        match abort {
            Some(reason) => tracker.abort(reason)?,
            None => tracker.complete()?,
        }
        sink.finalize(tracker.state(), tracker.abort_reason().cloned());
        Ok(sink.into_report())
    }

    /// Seal a report for a run that was refused before any step started
    pub fn reject(
        self,
        procedure: &str,
        run_id: &str,
        declared_steps: usize,
        reason: AbortReason,
    ) -> Result<RunReport> {
        let mut tracker = RunTracker::new();
        let mut sink = self.sink(RunReport::new(procedure, run_id, declared_steps));
        tracker.begin()?;
        tracker.abort(reason)?;
        sink.finalize(tracker.state(), tracker.abort_reason().cloned());
        Ok(sink.into_report())
    }
}

/// Run a step, turning a panic into a `Failure`
fn invoke_guarded(step: &Step, ctx: &Context) -> Outcome {
    match panic::catch_unwind(AssertUnwindSafe(|| step.run(ctx))) {
        Ok(outcome) => outcome,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!("Step '{}' panicked: {}", step.name(), message);
            Outcome::failure(format!("step panicked: {message}"), "")
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_executor::ScriptedExecutor;
    use crate::config::OpsConfig;
    use crate::error::StepFailure;
    use crate::process_guard::CancelFlag;
    use crate::report::MemoryTarget;
    use crate::run_state::RunState;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn ctx() -> Context {
        Context::builder(
            "test",
            Arc::new(OpsConfig::default()),
            Arc::new(ScriptedExecutor::new()),
        )
        .build()
    }

    fn ok(name: &str) -> Step {
        Step::critical(name, |_| Ok(Outcome::success("")))
    }

    #[test]
    fn test_all_steps_succeed() {
        let steps = vec![ok("a"), ok("b"), ok("c")];
        let report = StepRunner::new().run(&steps, &ctx()).unwrap();
        assert_eq!(report.state, RunState::Completed);
        assert_eq!(report.entries.len(), 3);
        assert!(report.is_sealed());
        assert!(report.summary().is_clean());
    }

    #[test]
    fn test_critical_failure_stops_run() {
        let invoked = Arc::new(AtomicUsize::new(0));
        let counter = invoked.clone();
        let steps = vec![
            ok("a"),
            Step::critical("b", |_| Err(StepFailure::invalid("boom"))),
            Step::critical("c", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Outcome::success(""))
            }),
        ];
        let report = StepRunner::new().run(&steps, &ctx()).unwrap();
        assert_eq!(report.state, RunState::Aborted);
        assert_eq!(report.entries.len(), 2);
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(
            report.abort_reason,
            Some(AbortReason::CriticalStepFailed {
                step: "b".to_string()
            })
        );
        assert_eq!(report.summary().not_run, 1);
    }

    #[test]
    fn test_optional_failure_continues() {
        let steps = vec![
            ok("a"),
            Step::optional("b", |_| Err(StepFailure::invalid("meh"))),
            ok("c"),
        ];
        let report = StepRunner::new().run(&steps, &ctx()).unwrap();
        assert_eq!(report.state, RunState::Completed);
        let summary = report.summary();
        assert_eq!(
            (summary.succeeded, summary.failed_noncritical, summary.failed_critical),
            (2, 1, 0)
        );
    }

    #[test]
    fn test_panicking_step_is_recorded_as_failure() {
        let steps = vec![
            Step::optional("explodes", |_| panic!("index out of range")),
            ok("after"),
        ];
        let report = StepRunner::new().run(&steps, &ctx()).unwrap();
        let entry = report.entry("explodes").unwrap();
        match &entry.outcome {
            Outcome::Failure { error, .. } => assert!(error.contains("index out of range")),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(report.entry("after").unwrap().outcome.is_success());
    }

    #[test]
    fn test_cancellation_between_steps() {
        let flag = CancelFlag::new();
        let trigger = flag.clone();
        let ctx = Context::builder(
            "test",
            Arc::new(OpsConfig::default()),
            Arc::new(ScriptedExecutor::new()),
        )
        .cancel_flag(flag)
        .build();
        let steps = vec![
            Step::optional("a", move |_| {
                trigger.cancel();
                Ok(Outcome::success(""))
            }),
            ok("b"),
        ];
        let report = StepRunner::new().run(&steps, &ctx).unwrap();
        assert_eq!(report.state, RunState::Aborted);
        assert_eq!(report.abort_reason, Some(AbortReason::Cancelled));
        assert_eq!(report.entries.len(), 1);
    }

    #[test]
    fn test_step_interrupted_by_cancellation_reports_cancelled() {
        let flag = CancelFlag::new();
        let trigger = flag.clone();
        let memory = MemoryTarget::new();
        let ctx = Context::builder(
            "test",
            Arc::new(OpsConfig::default()),
            Arc::new(ScriptedExecutor::new()),
        )
        .cancel_flag(flag)
        .build();
        let steps = vec![
            Step::critical("a", move |_| {
                trigger.cancel();
                Err(StepFailure::invalid("killed by signal"))
            }),
            ok("b"),
        ];
        let report = StepRunner::new()
            .with_target(memory.clone())
            .run(&steps, &ctx)
            .unwrap();
        assert_eq!(report.state, RunState::Aborted);
        assert_eq!(report.abort_reason, Some(AbortReason::Cancelled));
        assert_eq!(report.entries.len(), 1);
        assert!(report.entries[0].outcome.is_failure());
        assert!(!memory.lines().iter().any(|l| l.contains("critical step 'a' failed")));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let steps = vec![ok("a"), ok("a")];
        let err = StepRunner::new().run(&steps, &ctx()).unwrap_err();
        assert!(matches!(err, HostOpsError::Usage(_)));
    }

    #[test]
    fn test_log_lines() {
        let memory = MemoryTarget::new();
        let steps = vec![ok("a"), Step::optional("b", |_| Ok(Outcome::skipped("n/a")))];
        StepRunner::new()
            .with_target(memory.clone())
            .run(&steps, &ctx())
            .unwrap();
        let lines = memory.lines();
        assert!(lines[0].contains("[INFO] Starting test (2 steps"));
        assert!(lines[1].contains("[INFO] Step 1/2: a"));
        assert!(lines[2].contains("[SUCCESS] a: success"));
        assert!(lines[4].contains("[INFO] b: skipped: n/a"));
        assert!(lines.last().unwrap().contains("[SUCCESS] Run Completed"));
    }

    #[test]
    fn test_reject_produces_empty_aborted_report() {
        let report = StepRunner::new()
            .reject(
                "harden",
                "harden-1",
                5,
                AbortReason::Precondition {
                    message: "insufficient privilege".to_string(),
                },
            )
            .unwrap();
        assert_eq!(report.state, RunState::Aborted);
        assert!(report.entries.is_empty());
        assert_eq!(report.summary().not_run, 5);
    }

    #[test]
    fn test_filter_only_and_skip() {
        let steps = vec![ok("a"), ok("b"), ok("c")];
        let filter = StepFilter::new(vec!["c".into(), "a".into()], vec![]);
        let names: Vec<String> = filter
            .apply(steps)
            .unwrap()
            .iter()
            .map(|s| s.name().to_string())
            .collect();
        assert_eq!(names, vec!["a", "c"]);

        let steps = vec![ok("a"), ok("b"), ok("c")];
        let filter = StepFilter::new(vec![], vec!["b".into()]);
        assert_eq!(filter.apply(steps).unwrap().len(), 2);
    }

    #[test]
    fn test_filter_unknown_step() {
        let filter = StepFilter::new(vec![], vec!["nope".into()]);
        let err = filter.apply(vec![ok("a")]).unwrap_err();
        assert!(err.to_string().contains("nope"));
    }
}
