//! External command execution.
//!
//! All shell-outs made by steps go through an [`Executor`]. The production
//! implementation, [`SystemExecutor`], guarantees for every call:
//!
//! - exactly one process is spawned, in its own process group
//! - the PID is registered with [`ChildRegistry`] while it runs
//! - stdout/stderr are drained concurrently (no pipe deadlock)
//! - on timeout the whole group is terminated and the child is reaped
//! - group members left running after the leader exits are terminated
//!
//! Exit codes are reported, never interpreted: `grep` exiting 1 is a normal
//! [`CommandOutput`]. Steps decide what a code means.

use std::collections::VecDeque;
use std::fmt;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use tracing::{debug, info, warn};

use crate::error::{ExecutionError, StepFailure};
use crate::process_guard::{ChildRegistry, CommandProcessGroup, is_group_alive, send_signal_to_group};

/// How often a running child is polled while a timeout is armed
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Time between SIGTERM and SIGKILL when a command times out
const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);

/// A fully described external command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub timeout: Option<Duration>,
    /// Data written to the child's stdin; stdin is `/dev/null` otherwise
    pub stdin: Option<String>,
    pub current_dir: Option<PathBuf>,
    /// Whether the command changes host state (skipped in dry-run mode)
    pub mutating: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            timeout: None,
            stdin: None,
            current_dir: None,
            mutating: true,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn stdin(mut self, data: impl Into<String>) -> Self {
        self.stdin = Some(data.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Mark the command as a read-only probe; it still runs in dry-run mode.
    pub fn read_only(mut self) -> Self {
        self.mutating = false;
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{}'", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code (None if terminated by signal)
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    /// The command was skipped because the executor is in dry-run mode
    pub dry_run: bool,
}

impl CommandOutput {
    fn from_status(status: ExitStatus, stdout: String, stderr: String, duration: Duration) -> Self {
        Self {
            exit_code: status.code(),
            stdout,
            stderr,
            duration,
            dry_run: false,
        }
    }

    fn skipped(spec: &CommandSpec) -> Self {
        Self {
            exit_code: Some(0),
            stdout: format!("[DRY RUN] Skipped: {}\n", spec),
            stderr: String::new(),
            duration: Duration::ZERO,
            dry_run: true,
        }
    }

    /// Exit code 0
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// True when the command exited with one of `codes`
    pub fn exit_code_in(&self, codes: &[i32]) -> bool {
        self.exit_code.is_some_and(|c| codes.contains(&c))
    }

    /// Trimmed stdout, convenient for single-value probes
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    /// Treat a non-zero exit as a step failure.
    pub fn ensure_success(&self, program: &str) -> Result<&Self, StepFailure> {
        if self.success() {
            Ok(self)
        } else {
            Err(StepFailure::CommandFailed {
                program: program.to_string(),
                exit_code: self.exit_code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Runs external commands on behalf of steps.
pub trait Executor: Send + Sync {
    fn execute(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecutionError>;

    /// Whether mutating commands are only logged, not run
    fn is_dry_run(&self) -> bool {
        false
    }

    /// Execute and require exit code 0
    fn run_checked(&self, spec: &CommandSpec) -> Result<CommandOutput, StepFailure> {
        let output = self.execute(spec)?;
        output.ensure_success(&spec.program)?;
        Ok(output)
    }
}

/// Executor that spawns real processes.
#[derive(Debug, Clone)]
pub struct SystemExecutor {
    default_timeout: Option<Duration>,
    dry_run: bool,
    kill_grace: Duration,
    registry: Arc<Mutex<ChildRegistry>>,
}

impl Default for SystemExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemExecutor {
    pub fn new() -> Self {
        Self {
            default_timeout: None,
            dry_run: false,
            kill_grace: DEFAULT_KILL_GRACE,
            registry: ChildRegistry::global(),
        }
    }

    /// Timeout applied to commands that do not carry their own
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Skip mutating commands, run read-only probes
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Track children in a specific registry instead of the global one
    pub fn with_registry(mut self, registry: Arc<Mutex<ChildRegistry>>) -> Self {
        self.registry = registry;
        self
    }

    fn register(&self, pid: u32) {
        if let Ok(mut guard) = self.registry.lock() {
            guard.register(pid);
        }
    }

    fn unregister(&self, pid: u32) {
        if let Ok(mut guard) = self.registry.lock() {
            guard.unregister(pid);
        }
    }

    /// Wait for the child, killing its process group once `deadline` passes.
    fn wait_with_deadline(
        &self,
        child: &mut Child,
        deadline: Option<Instant>,
        timeout: Duration,
        program: &str,
    ) -> Result<ExitStatus, ExecutionError> {
        let io_err = |source| ExecutionError::Io {
            program: program.to_string(),
            source,
        };

        let Some(deadline) = deadline else {
            return child.wait().map_err(io_err);
        };

        loop {
            if let Some(status) = child.try_wait().map_err(io_err)? {
                return Ok(status);
            }
            let now = Instant::now();
            if now >= deadline {
                warn!("{} exceeded timeout of {:?}, terminating", program, timeout);
                self.kill_process_group(child);
                return Err(ExecutionError::Timeout {
                    program: program.to_string(),
                    timeout,
                });
            }
            thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }

    /// SIGTERM the group, give it `kill_grace`, then SIGKILL whatever is left
    /// and reap the child. Also used once the leader has exited, for
    /// background members still holding the output pipes.
    fn kill_process_group(&self, child: &mut Child) {
        let pgid = child.id();
        if let Err(e) = send_signal_to_group(pgid, Signal::SIGTERM) {
            debug!("SIGTERM to process group {} failed: {}", pgid, e);
            let _ = child.kill();
        }

        if let Some(grace_deadline) = Instant::now().checked_add(self.kill_grace) {
            while Instant::now() < grace_deadline {
                let leader_done = matches!(child.try_wait(), Ok(Some(_)));
                if leader_done && !is_group_alive(pgid) {
                    break;
                }
                thread::sleep(POLL_INTERVAL);
            }
        }

        // Grandchildren may outlive the leader; the group id stays valid
        if is_group_alive(pgid) {
            warn!("Process group {} still alive after {:?}, sending SIGKILL", pgid, self.kill_grace);
            let _ = send_signal_to_group(pgid, Signal::SIGKILL);
        }
        let _ = child.wait();
    }
}

impl Executor for SystemExecutor {
    fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    fn execute(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecutionError> {
        if self.dry_run && spec.mutating {
            info!("[DRY RUN] Skipped: {}", spec);
            return Ok(CommandOutput::skipped(spec));
        }

        let env_keys: Vec<&str> = spec.env.iter().map(|(k, _)| k.as_str()).collect();
        debug!("execute: {} env={:?}", spec, env_keys);

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .in_new_process_group();
        if let Some(dir) = &spec.current_dir {
            cmd.current_dir(dir);
        }

        let start = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| ExecutionError::from_spawn(&spec.program, e))?;
        let pid = child.id();
        self.register(pid);

        if let (Some(data), Some(mut stdin)) = (spec.stdin.clone(), child.stdin.take()) {
            thread::spawn(move || {
                // A child that exits without reading its input closes the pipe
                let _ = stdin.write_all(data.as_bytes());
            });
        }
        let stdout_reader = PipeReader::spawn(child.stdout.take());
        let stderr_reader = PipeReader::spawn(child.stderr.take());

        let timeout = spec.timeout.or(self.default_timeout);
        let deadline = timeout.and_then(|t| {
            let deadline = start.checked_add(t);
            if deadline.is_none() {
                debug!("{} timeout {:?} is unrepresentable, waiting without one", spec.program, t);
            }
            deadline
        });
        let waited = self.wait_with_deadline(
            &mut child,
            deadline,
            timeout.unwrap_or(Duration::ZERO),
            &spec.program,
        );
        if waited.is_ok() && is_group_alive(pid) {
            warn!("{} exited leaving background processes in its group, terminating them", spec.program);
            self.kill_process_group(&mut child);
        }
        self.unregister(pid);

        // On timeout the readers are left detached: a process that escaped
        // the group could hold the pipe open indefinitely.
        let status = waited?;
        // Group members are gone by now; only a process that left the group
        // can keep a pipe open past this point
        let drain_deadline = deadline.max(Instant::now().checked_add(self.kill_grace));
        let (Some(stdout), Some(stderr)) = (
            stdout_reader.finish(drain_deadline),
            stderr_reader.finish(drain_deadline),
        ) else {
            warn!("{} output still open after it exited", spec.program);
            return Err(ExecutionError::Timeout {
                program: spec.program.clone(),
                timeout: timeout.unwrap_or(self.kill_grace),
            });
        };
        let duration = start.elapsed();

        debug!(
            "{} finished with {:?} in {:?}",
            spec.program,
            status.code(),
            duration
        );
        Ok(CommandOutput::from_status(status, stdout, stderr, duration))
    }
}

/// Background drain of one output pipe.
struct PipeReader(Option<Receiver<String>>);

impl PipeReader {
    fn spawn<R: Read + Send + 'static>(pipe: Option<R>) -> Self {
        Self(pipe.map(|mut pipe| {
            let (tx, rx) = mpsc::channel();
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf);
                let _ = tx.send(String::from_utf8_lossy(&buf).to_string());
            });
            rx
        }))
    }

    /// Collected output, or `None` if the pipe is still open at `deadline`
    fn finish(self, deadline: Option<Instant>) -> Option<String> {
        let Some(rx) = self.0 else {
            return Some(String::new());
        };
        let received = match deadline {
            Some(deadline) => rx.recv_timeout(deadline.saturating_duration_since(Instant::now())),
            None => rx.recv().map_err(RecvTimeoutError::from),
        };
        match received {
            Ok(output) => Some(output),
            Err(RecvTimeoutError::Disconnected) => Some(String::new()),
            Err(RecvTimeoutError::Timeout) => None,
        }
    }
}

/// Canned response returned by [`ScriptedExecutor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedResponse {
    Exit {
        code: i32,
        stdout: String,
        stderr: String,
    },
    NotFound,
    Timeout,
}

impl ScriptedResponse {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self::Exit {
            code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn exit(code: i32, stderr: impl Into<String>) -> Self {
        Self::Exit {
            code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

#[derive(Debug, Clone)]
struct ScriptedRule {
    program: String,
    args_prefix: Vec<String>,
    responses: VecDeque<ScriptedResponse>,
}

/// Executor that never spawns anything: answers come from rules keyed by
/// program name (and optionally an argument prefix). Every call is recorded.
///
/// Rules are matched in insertion order, so register specific rules before
/// generic ones. A rule given several responses returns them in sequence and
/// keeps repeating the last one. Unmatched commands exit 0 with no output.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    rules: Mutex<Vec<ScriptedRule>>,
    calls: Mutex<Vec<CommandSpec>>,
    dry_run: bool,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer mutating commands like a dry-run [`SystemExecutor`] would
    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn on(self, program: &str, response: ScriptedResponse) -> Self {
        self.on_args(program, &[], response)
    }

    pub fn on_args(self, program: &str, args_prefix: &[&str], response: ScriptedResponse) -> Self {
        self.on_sequence(program, args_prefix, vec![response])
    }

    pub fn on_sequence(
        self,
        program: &str,
        args_prefix: &[&str],
        responses: Vec<ScriptedResponse>,
    ) -> Self {
        if let Ok(mut rules) = self.rules.lock() {
            rules.push(ScriptedRule {
                program: program.to_string(),
                args_prefix: args_prefix.iter().map(|a| a.to_string()).collect(),
                responses: responses.into(),
            });
        }
        self
    }

    /// Every command executed so far, rendered as a command line
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .map(|calls| calls.iter().map(ToString::to_string).collect())
            .unwrap_or_default()
    }

    /// Every command executed so far
    pub fn specs(&self) -> Vec<CommandSpec> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn next_response(&self, spec: &CommandSpec) -> ScriptedResponse {
        let Ok(mut rules) = self.rules.lock() else {
            return ScriptedResponse::ok("");
        };
        let rule = rules.iter_mut().find(|r| {
            r.program == spec.program
                && spec.args.len() >= r.args_prefix.len()
                && r.args_prefix.iter().zip(&spec.args).all(|(a, b)| a == b)
        });
        match rule {
            Some(rule) if rule.responses.len() > 1 => rule
                .responses
                .pop_front()
                .unwrap_or_else(|| ScriptedResponse::ok("")),
            Some(rule) => rule
                .responses
                .front()
                .cloned()
                .unwrap_or_else(|| ScriptedResponse::ok("")),
            None => ScriptedResponse::ok(""),
        }
    }
}

impl Executor for ScriptedExecutor {
    fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    fn execute(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecutionError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(spec.clone());
        }
        if self.dry_run && spec.mutating {
            return Ok(CommandOutput::skipped(spec));
        }
        match self.next_response(spec) {
            ScriptedResponse::Exit {
                code,
                stdout,
                stderr,
            } => Ok(CommandOutput {
                exit_code: Some(code),
                stdout,
                stderr,
                duration: Duration::ZERO,
                dry_run: false,
            }),
            ScriptedResponse::NotFound => Err(ExecutionError::NotFound {
                program: spec.program.clone(),
            }),
            ScriptedResponse::Timeout => Err(ExecutionError::Timeout {
                program: spec.program.clone(),
                timeout: spec.timeout.unwrap_or(Duration::ZERO),
            }),
        }
    }
}
