//! Integration tests for the system executor
//!
//! These spawn real processes and verify that:
//! 1. Exit codes are reported, never judged
//! 2. A timeout terminates the whole process group, grandchildren included
//!    and background processes do not outlive the command
//! 3. Output pipes are drained so chatty children cannot deadlock
//! 4. Dry-run mode skips mutating commands only

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use hostops::command_executor::{CommandSpec, Executor, SystemExecutor};
use hostops::error::ExecutionError;
use hostops::process_guard::{is_process_alive, ChildRegistry};

/// Helper: Wait for a process to die with timeout
fn wait_for_process_death(pid: u32, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if !is_process_alive(pid) {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    false
}

fn executor() -> SystemExecutor {
    SystemExecutor::new().with_registry(Arc::new(Mutex::new(ChildRegistry::default())))
}

#[test]
fn test_nonexistent_binary_is_not_found() {
    let err = executor()
        .execute(&CommandSpec::new("hostops-definitely-not-a-binary"))
        .unwrap_err();
    assert!(
        matches!(err, ExecutionError::NotFound { ref program } if program == "hostops-definitely-not-a-binary"),
        "unexpected error: {err:?}"
    );
}

#[test]
fn test_nonzero_exit_is_not_an_error() {
    let output = executor()
        .execute(&CommandSpec::new("sh").args(["-c", "echo oops >&2; exit 3"]))
        .unwrap();
    assert_eq!(output.exit_code, Some(3));
    assert!(!output.success());
    assert_eq!(output.stderr.trim(), "oops");
    assert!(output.ensure_success("sh").is_err());
    assert!(output.exit_code_in(&[0, 3]));
}

#[test]
fn test_timeout_stops_sleep() {
    let start = Instant::now();
    let err = executor()
        .with_kill_grace(Duration::from_millis(200))
        .execute(&CommandSpec::new("sleep").arg("5").timeout(Duration::from_secs(1)))
        .unwrap_err();
    let elapsed = start.elapsed();

    assert!(err.is_timeout(), "expected timeout, got {err:?}");
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(3), "took {elapsed:?}");
}

#[test]
fn test_timeout_kills_grandchildren() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("grandchild.pid");
    let script = format!("sleep 30 & echo $! > {}; wait", pid_file.display());

    let err = executor()
        .with_kill_grace(Duration::from_millis(200))
        .execute(&CommandSpec::new("sh").args(["-c", script.as_str()]).timeout(Duration::from_secs(1)))
        .unwrap_err();
    assert!(err.is_timeout());

    let grandchild: u32 = std::fs::read_to_string(&pid_file)
        .expect("shell should have written the grandchild PID")
        .trim()
        .parse()
        .unwrap();
    assert!(
        wait_for_process_death(grandchild, Duration::from_secs(3)),
        "grandchild {grandchild} survived the group kill"
    );
}

#[test]
fn test_background_process_does_not_outlive_leader() {
    let start = Instant::now();
    let output = executor()
        .with_kill_grace(Duration::from_millis(200))
        .execute(
            &CommandSpec::new("sh")
                .args(["-c", "sleep 6 & echo $!"])
                .timeout(Duration::from_secs(1)),
        )
        .unwrap();
    let elapsed = start.elapsed();

    assert!(output.success());
    assert!(elapsed < Duration::from_secs(3), "took {elapsed:?}");
    let background: u32 = output.stdout_trimmed().parse().unwrap();
    assert!(
        wait_for_process_death(background, Duration::from_secs(3)),
        "background sleep {background} survived its leader"
    );
}

#[test]
fn test_background_process_without_timeout_is_terminated() {
    let start = Instant::now();
    let output = executor()
        .with_kill_grace(Duration::from_millis(200))
        .execute(&CommandSpec::new("sh").args(["-c", "sleep 6 & echo started"]))
        .unwrap();
    assert_eq!(output.stdout, "started\n");
    assert!(start.elapsed() < Duration::from_secs(3));
}

#[test]
fn test_default_timeout_applies() {
    let err = executor()
        .with_default_timeout(Some(Duration::from_millis(300)))
        .with_kill_grace(Duration::from_millis(100))
        .execute(&CommandSpec::new("sleep").arg("5"))
        .unwrap_err();
    assert!(err.is_timeout());
}

#[test]
fn test_registry_is_empty_after_call() {
    let registry = Arc::new(Mutex::new(ChildRegistry::default()));
    let executor = SystemExecutor::new().with_registry(registry.clone());
    executor.execute(&CommandSpec::new("true")).unwrap();
    assert_eq!(registry.lock().unwrap().count(), 0);
}

#[test]
fn test_env_stdin_and_current_dir() {
    let dir = tempfile::tempdir().unwrap();
    let output = executor()
        .execute(
            &CommandSpec::new("sh")
                .args(["-c", "printf '%s:' \"$HOSTOPS_TEST\"; cat; pwd -P"])
                .env("HOSTOPS_TEST", "value")
                .stdin("from-stdin\n")
                .current_dir(dir.path()),
        )
        .unwrap();
    let expected_dir = dir.path().canonicalize().unwrap();
    assert_eq!(
        output.stdout,
        format!("value:from-stdin\n{}\n", expected_dir.display())
    );
}

#[test]
fn test_large_output_does_not_deadlock() {
    let output = executor()
        .execute(
            &CommandSpec::new("sh")
                .args(["-c", "head -c 1000000 /dev/zero | tr '\\0' a; head -c 200000 /dev/zero | tr '\\0' b >&2"])
                .timeout(Duration::from_secs(10)),
        )
        .unwrap();
    assert!(output.success());
    assert_eq!(output.stdout.len(), 1_000_000);
    assert_eq!(output.stderr.len(), 200_000);
}

#[test]
fn test_dry_run_skips_mutating_commands_only() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("created");
    let executor = executor().with_dry_run(true);

    let output = executor
        .execute(&CommandSpec::new("touch").arg(target.to_string_lossy()))
        .unwrap();
    assert!(output.dry_run);
    assert!(output.success());
    assert!(!target.exists());

    let output = executor
        .execute(&CommandSpec::new("echo").arg("probe").read_only())
        .unwrap();
    assert!(!output.dry_run);
    assert_eq!(output.stdout_trimmed(), "probe");
}
