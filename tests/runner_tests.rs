//! Step runner scenarios
//!
//! Each test builds a small step list with a known failure pattern and checks
//! the recorded entries, the final state and the summary counts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use hostops::command_executor::ScriptedExecutor;
use hostops::config::OpsConfig;
use hostops::context::Context;
use hostops::error::StepFailure;
use hostops::report::MemoryTarget;
use hostops::run_state::{AbortReason, RunState};
use hostops::runner::StepRunner;
use hostops::step::{Outcome, Step};

fn ctx() -> Context {
    Context::builder(
        "scenario",
        Arc::new(OpsConfig::default()),
        Arc::new(ScriptedExecutor::new()),
    )
    .build()
}

/// Step that records its name in `log` when invoked
fn tracked(name: &'static str, critical: bool, fail: bool, log: &Arc<Mutex<Vec<&'static str>>>) -> Step {
    let log = Arc::clone(log);
    Step::new(name, critical, move |_| {
        log.lock().unwrap().push(name);
        if fail {
            Err(StepFailure::invalid(format!("{name} failed")))
        } else {
            Ok(Outcome::success(""))
        }
    })
}

#[test]
fn test_noncritical_failure_completes_run() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let steps = vec![
        tracked("A", true, false, &log),
        tracked("B", false, true, &log),
        tracked("C", true, false, &log),
    ];
    let report = StepRunner::new().run(&steps, &ctx()).unwrap();

    let labels: Vec<&str> = report.entries.iter().map(|e| e.outcome.label()).collect();
    assert_eq!(labels, vec!["success", "failure", "success"]);
    assert_eq!(report.state, RunState::Completed);

    let summary = report.summary();
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed_noncritical, 1);
    assert_eq!(summary.failed_critical, 0);
    assert_eq!(*log.lock().unwrap(), vec!["A", "B", "C"]);
}

#[test]
fn test_critical_failure_aborts_run() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let steps = vec![
        tracked("A", true, false, &log),
        tracked("B", true, true, &log),
        tracked("C", true, false, &log),
    ];
    let report = StepRunner::new().run(&steps, &ctx()).unwrap();

    let labels: Vec<&str> = report.entries.iter().map(|e| e.outcome.label()).collect();
    assert_eq!(labels, vec!["success", "failure"]);
    assert_eq!(report.state, RunState::Aborted);
    assert_eq!(
        report.abort_reason,
        Some(AbortReason::CriticalStepFailed {
            step: "B".to_string()
        })
    );
    assert_eq!(*log.lock().unwrap(), vec!["A", "B"]);
    assert_eq!(report.summary().not_run, 1);
}

#[test]
fn test_entries_follow_declaration_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let names = ["zeta", "alpha", "mid"];
    let steps: Vec<Step> = names.iter().map(|&n| tracked(n, false, false, &log)).collect();
    let report = StepRunner::new().run(&steps, &ctx()).unwrap();
    let recorded: Vec<&str> = report.entries.iter().map(|e| e.step.as_str()).collect();
    assert_eq!(recorded, names);
}

#[test]
fn test_each_step_runs_once() {
    let count = Arc::new(AtomicUsize::new(0));
    let steps: Vec<Step> = (0..4)
        .map(|i| {
            let count = Arc::clone(&count);
            Step::optional(format!("step-{i}"), move |_| {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(Outcome::skipped("nothing to do"))
            })
        })
        .collect();
    let report = StepRunner::new().run(&steps, &ctx()).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 4);
    assert_eq!(report.summary().skipped, 4);
    assert_eq!(report.state, RunState::Completed);
}

#[test]
fn test_failures_are_logged_at_their_level() {
    let memory = MemoryTarget::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    let steps = vec![
        tracked("soft", false, true, &log),
        tracked("hard", true, true, &log),
    ];
    StepRunner::new()
        .with_target(memory.clone())
        .run(&steps, &ctx())
        .unwrap();

    let lines = memory.lines();
    assert!(lines.iter().any(|l| l.contains("[WARNING] soft: failure: soft failed")));
    assert!(lines.iter().any(|l| l.contains("[ERROR] hard: failure: hard failed")));
    assert!(lines
        .iter()
        .any(|l| l.contains("[ERROR] Run aborted: critical step 'hard' failed")));
    assert!(lines.last().unwrap().contains("[ERROR] Run Aborted"));
}

#[test]
fn test_empty_step_list_completes() {
    let report = StepRunner::new().run(&[], &ctx()).unwrap();
    assert_eq!(report.state, RunState::Completed);
    assert!(report.entries.is_empty());
    assert!(report.summary().is_clean());
}
