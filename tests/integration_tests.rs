// Integration tests for hostops
//
// End-to-end runs through `orchestrate` with a scripted executor and a fake
// host probe, plus a few smoke tests of the built binary:
// - a full add-user run leaves a well-formed log file and JSON report
// - a refused run leaves a log file and runs nothing
// - usage and configuration errors map to exit code 3

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use chrono::DateTime;

use hostops::command_executor::{ScriptedExecutor, ScriptedResponse};
use hostops::config::OpsConfig;
use hostops::context::Params;
use hostops::input::PresetInput;
use hostops::preconditions::SystemProbe;
use hostops::procedure::{orchestrate, RunEnv};
use hostops::procedures::AddUser;
use hostops::run_state::{AbortReason, RunState};
use hostops::runner::{StepFilter, StepRunner};
use hostops::types::{LogLevel, OsFamily};

struct FakeHost {
    root: bool,
}

impl SystemProbe for FakeHost {
    fn os_family(&self) -> OsFamily {
        OsFamily::Linux
    }
    fn is_privileged(&self) -> bool {
        self.root
    }
    fn find_binary(&self, name: &str) -> Option<PathBuf> {
        Some(Path::new("/usr/sbin").join(name))
    }
    fn distro_id(&self) -> Option<String> {
        Some("debian".to_string())
    }
}

fn config(dir: &Path) -> Arc<OpsConfig> {
    Arc::new(OpsConfig {
        lock_dir: dir.join("lock"),
        log_dir: dir.join("logs"),
        backup_dir: dir.join("backups"),
        ..OpsConfig::default()
    })
}

/// Split `[timestamp] [LEVEL] message`, checking both bracketed fields
fn parse_log_line(line: &str) -> (LogLevel, String) {
    let rest = line
        .strip_prefix('[')
        .unwrap_or_else(|| panic!("line does not start with '[': {line}"));
    let (timestamp, rest) = rest.split_once("] [").expect("timestamp field");
    DateTime::parse_from_rfc3339(timestamp)
        .unwrap_or_else(|e| panic!("bad timestamp {timestamp:?}: {e}"));
    let (level, message) = rest.split_once("] ").expect("level field");
    (level.parse().expect("known level"), message.to_string())
}

fn hostops_bin() -> Command {
    Command::new(env!("CARGO_BIN_EXE_hostops"))
}

#[test]
fn test_add_user_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let executor = Arc::new(
        ScriptedExecutor::new().on("id", ScriptedResponse::exit(1, "id: 'alice': no such user")),
    );
    let env = RunEnv::new(config(dir.path()), executor.clone())
        .with_probe(FakeHost { root: true })
        .with_input(Box::new(
            PresetInput::default()
                .answer("username", "alice")
                .answer("groups", "wheel, docker"),
        ))
        .with_log_dir(dir.path().join("logs"));

    let outcome = orchestrate(&AddUser, Params::new(), StepRunner::new(), &env).unwrap();

    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(outcome.report.state, RunState::Completed);
    assert_eq!(outcome.summary.succeeded, 4);
    assert_eq!(
        executor.calls(),
        vec![
            "id -u alice",
            "id -u alice",
            "useradd -m alice",
            "usermod -aG wheel,docker alice",
        ]
    );

    let log = outcome.log_file.clone().expect("log file opened");
    assert!(log.starts_with(dir.path().join("logs")));
    let content = std::fs::read_to_string(&log).unwrap();
    let lines: Vec<(LogLevel, String)> = content.lines().map(parse_log_line).collect();
    assert!(lines[0].1.starts_with("Starting add-user (4 steps, run add-user-"));
    assert!(lines.contains(&(LogLevel::Info, "Step 3/4: create-user".to_string())));
    assert!(lines
        .iter()
        .any(|(level, msg)| *level == LogLevel::Success && msg.starts_with("create-user: success: created 'alice'")));
    assert_eq!(
        lines.last().unwrap(),
        &(LogLevel::Success, "Run Completed".to_string())
    );

    let json_path = dir.path().join("report.json");
    outcome.report.write_json(&json_path).unwrap();
    let value: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&json_path).unwrap()).unwrap();
    assert_eq!(value["procedure"], "add-user");
    assert_eq!(value["entries"].as_array().unwrap().len(), 4);
    assert_eq!(value["entries"][3]["step"], "add-groups");

    // Lock released on completion
    assert!(!dir.path().join("lock").join("user-accounts.lock").exists());
}

#[test]
fn test_existing_user_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let executor = Arc::new(ScriptedExecutor::new().on("id", ScriptedResponse::ok("1001\n")));
    let env = RunEnv::new(config(dir.path()), executor.clone())
        .with_probe(FakeHost { root: true })
        .with_input(Box::new(PresetInput::default().answer("username", "bob")));

    let outcome = orchestrate(&AddUser, Params::new(), StepRunner::new(), &env).unwrap();

    assert_eq!(outcome.exit_code(), 0);
    assert!(outcome.report.entry("create-user").unwrap().outcome.is_skipped());
    assert!(outcome.report.entry("add-groups").unwrap().outcome.is_skipped());
    assert!(!executor.calls().iter().any(|c| c.starts_with("useradd")));
}

#[test]
fn test_invalid_username_aborts_before_any_command() {
    let dir = tempfile::tempdir().unwrap();
    let executor = Arc::new(ScriptedExecutor::new());
    let env = RunEnv::new(config(dir.path()), executor.clone())
        .with_probe(FakeHost { root: true })
        .with_input(Box::new(PresetInput::default().answer("username", "Bad User")));

    let outcome = orchestrate(&AddUser, Params::new(), StepRunner::new(), &env).unwrap();

    assert_eq!(outcome.exit_code(), 1);
    assert_eq!(
        outcome.report.abort_reason,
        Some(AbortReason::CriticalStepFailed {
            step: "validate-username".to_string()
        })
    );
    assert_eq!(outcome.report.entries.len(), 1);
    assert_eq!(outcome.summary.not_run, 3);
    assert!(executor.calls().is_empty());
}

#[test]
fn test_refused_run_still_logs() {
    let dir = tempfile::tempdir().unwrap();
    let executor = Arc::new(ScriptedExecutor::new());
    let env = RunEnv::new(config(dir.path()), executor.clone())
        .with_probe(FakeHost { root: false })
        .with_input(Box::new(PresetInput::default().answer("username", "alice")))
        .with_log_dir(dir.path().join("logs"));

    let outcome = orchestrate(&AddUser, Params::new(), StepRunner::new(), &env).unwrap();

    assert_eq!(outcome.exit_code(), 2);
    assert!(outcome.report.entries.is_empty());
    assert!(executor.calls().is_empty());

    let content = std::fs::read_to_string(outcome.log_file.unwrap()).unwrap();
    let lines: Vec<(LogLevel, String)> = content.lines().map(parse_log_line).collect();
    assert!(lines.iter().any(|(level, msg)| *level == LogLevel::Error
        && msg == "Run aborted: precondition failed: insufficient privilege: root required"));
    assert!(lines.contains(&(LogLevel::Info, "Not run: 4".to_string())));
}

#[test]
fn test_filtered_run_executes_selected_steps_only() {
    let dir = tempfile::tempdir().unwrap();
    let executor = Arc::new(ScriptedExecutor::new().on("id", ScriptedResponse::ok("1001\n")));
    let env = RunEnv::new(config(dir.path()), executor.clone())
        .with_probe(FakeHost { root: true })
        .with_input(Box::new(PresetInput::default().answer("username", "bob")))
        .with_filter(StepFilter::new(vec!["check-existing".to_string()], Vec::new()));

    let outcome = orchestrate(&AddUser, Params::new(), StepRunner::new(), &env).unwrap();

    assert_eq!(outcome.report.declared_steps, 1);
    assert_eq!(outcome.report.entries.len(), 1);
    assert_eq!(executor.calls(), vec!["id -u bob"]);
}

#[test]
fn test_binary_lists_procedures() {
    let output = hostops_bin().arg("list").output().expect("run hostops");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for name in ["system-update", "backup", "harden", "monitor", "add-user"] {
        assert!(stdout.contains(&format!("{name}: ")), "missing {name} in:\n{stdout}");
    }
}

#[test]
fn test_binary_validate_config() {
    let dir = tempfile::tempdir().unwrap();
    let good = dir.path().join("good.json");
    std::fs::write(&good, r#"{"retention_days": 14}"#).unwrap();
    let status = hostops_bin()
        .args(["validate-config", good.to_str().unwrap()])
        .env_remove("HOSTOPS_RETENTION_DAYS")
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(0));

    let bad = dir.path().join("bad.json");
    std::fs::write(&bad, "{ not json").unwrap();
    let status = hostops_bin()
        .args(["validate-config", bad.to_str().unwrap()])
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(3));
}

#[test]
fn test_binary_unknown_step_is_usage_error() {
    let dir = tempfile::tempdir().unwrap();
    let output = hostops_bin()
        .args(["backup", "--only", "no-such-step", "--non-interactive"])
        .arg("--log-dir")
        .arg(dir.path())
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(3));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("no-such-step"), "stderr: {stderr}");
}

#[test]
fn test_binary_rejects_oversized_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let output = hostops_bin()
        .args(["monitor", "--non-interactive", "--timeout"])
        .arg(u64::MAX.to_string())
        .arg("--log-dir")
        .arg(dir.path())
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(3));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("command_timeout_secs"), "stderr: {stderr}");
}
