//! Run report and log sink.
//!
//! [`ReportSink`] owns the in-memory [`RunReport`] of a run and mirrors every
//! event as a timestamped line to its [`LogTarget`]s:
//!
//! ```text
//! [2026-10-18T14:25:01.123+02:00] [INFO] Step 1/5: refresh-index
//! [2026-10-18T14:25:09.481+02:00] [SUCCESS] refresh-index: success (8.36s)
//! ```
//!
//! Lines are written and flushed as they happen, so a crash mid-run still
//! leaves the log file with everything up to that point.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Local, SecondsFormat};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{HostOpsError, Result};
use crate::run_state::{AbortReason, RunState};
use crate::step::Outcome;
use crate::types::LogLevel;

/// One recorded step outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub step: String,
    pub critical: bool,
    pub outcome: Outcome,
    pub started_at: DateTime<Local>,
    pub duration: Duration,
}

impl ReportEntry {
    /// Log level this entry is printed with
    pub fn level(&self) -> LogLevel {
        match &self.outcome {
            Outcome::Success { .. } => LogLevel::Success,
            Outcome::Failure { .. } if self.critical => LogLevel::Error,
            Outcome::Failure { .. } => LogLevel::Warning,
            Outcome::Skipped { .. } => LogLevel::Info,
        }
    }
}

/// Ordered, append-only record of one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub procedure: String,
    pub run_id: String,
    pub declared_steps: usize,
    pub started_at: DateTime<Local>,
    pub finished_at: Option<DateTime<Local>>,
    pub state: RunState,
    pub abort_reason: Option<AbortReason>,
    pub entries: Vec<ReportEntry>,
    #[serde(skip)]
    sealed: bool,
}

impl RunReport {
    pub fn new(procedure: impl Into<String>, run_id: impl Into<String>, declared_steps: usize) -> Self {
        Self {
            procedure: procedure.into(),
            run_id: run_id.into(),
            declared_steps,
            started_at: Local::now(),
            finished_at: None,
            state: RunState::NotStarted,
            abort_reason: None,
            entries: Vec::with_capacity(declared_steps),
            sealed: false,
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Append an entry; fails once the report is sealed
    pub fn push(&mut self, entry: ReportEntry) -> Result<()> {
        if self.sealed {
            return Err(HostOpsError::report(format!(
                "cannot record step '{}': report for run {} is sealed",
                entry.step, self.run_id
            )));
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Freeze the report with its terminal state
    pub fn seal(&mut self, state: RunState, reason: Option<AbortReason>) {
        self.state = state;
        self.abort_reason = reason;
        self.finished_at = Some(Local::now());
        self.sealed = true;
    }

    pub fn entry(&self, step: &str) -> Option<&ReportEntry> {
        self.entries.iter().find(|e| e.step == step)
    }

    pub fn summary(&self) -> Summary {
        let mut summary = Summary {
            state: self.state,
            succeeded: 0,
            failed_noncritical: 0,
            failed_critical: 0,
            skipped: 0,
            not_run: self.declared_steps.saturating_sub(self.entries.len()),
            total_duration: self
                .finished_at
                .and_then(|end| (end - self.started_at).to_std().ok())
                .unwrap_or_else(|| self.entries.iter().map(|e| e.duration).sum()),
        };
        for entry in &self.entries {
            match (&entry.outcome, entry.critical) {
                (Outcome::Success { .. }, _) => summary.succeeded += 1,
                (Outcome::Failure { .. }, true) => summary.failed_critical += 1,
                (Outcome::Failure { .. }, false) => summary.failed_noncritical += 1,
                (Outcome::Skipped { .. }, _) => summary.skipped += 1,
            }
        }
        summary
    }

    /// Write the report as pretty-printed JSON
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

/// Counts per outcome category for a finished run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub state: RunState,
    pub succeeded: usize,
    pub failed_noncritical: usize,
    pub failed_critical: usize,
    pub skipped: usize,
    pub not_run: usize,
    pub total_duration: Duration,
}

impl Summary {
    /// Completed with zero critical failures
    pub fn is_clean(&self) -> bool {
        self.state == RunState::Completed && self.failed_critical == 0
    }

    pub fn lines(&self, procedure: &str) -> Vec<(LogLevel, String)> {
        let closing = match (self.state, self.failed_noncritical) {
            (RunState::Completed, 0) => LogLevel::Success,
            (RunState::Completed, _) => LogLevel::Warning,
            _ => LogLevel::Error,
        };
        vec![
            (LogLevel::Info, format!("==== Summary: {} ====", procedure)),
            (LogLevel::Info, format!("Succeeded: {}", self.succeeded)),
            (
                LogLevel::Info,
                format!("Failed (non-critical): {}", self.failed_noncritical),
            ),
            (
                LogLevel::Info,
                format!("Failed (critical): {}", self.failed_critical),
            ),
            (LogLevel::Info, format!("Skipped: {}", self.skipped)),
            (LogLevel::Info, format!("Not run: {}", self.not_run)),
            (
                LogLevel::Info,
                format!("Total duration: {}", format_duration(self.total_duration)),
            ),
            (closing, format!("Run {}", self.state)),
        ]
    }
}

/// `[ISO-8601 timestamp] [LEVEL] message`
pub fn format_line(timestamp: DateTime<Local>, level: LogLevel, message: &str) -> String {
    format!(
        "[{}] [{}] {}",
        timestamp.to_rfc3339_opts(SecondsFormat::Millis, false),
        level,
        message
    )
}

pub fn format_duration(duration: Duration) -> String {
    format!("{:.2}s", duration.as_secs_f64())
}

/// `<log_dir>/<procedure>_<tag>.log`
pub fn log_file_path(log_dir: &Path, procedure: &str, timestamp_tag: &str) -> PathBuf {
    log_dir.join(format!("{}_{}.log", procedure, timestamp_tag))
}

/// Destination for run log lines
pub trait LogTarget: Send {
    fn write_line(&mut self, level: LogLevel, line: &str) -> io::Result<()>;
}

/// Standard output, optionally coloured by level
pub struct ConsoleTarget {
    color: bool,
}

impl ConsoleTarget {
    pub fn new(color: bool) -> Self {
        Self { color }
    }
}

impl LogTarget for ConsoleTarget {
    fn write_line(&mut self, level: LogLevel, line: &str) -> io::Result<()> {
        let mut out = io::stdout().lock();
        if self.color {
            writeln!(out, "{}{}\x1b[0m", level.color_code(), line)?;
        } else {
            writeln!(out, "{}", line)?;
        }
        out.flush()
    }
}

/// Highest `-N` suffix tried when runs start within the same second
const MAX_LOG_SUFFIX: u32 = 100;

/// Plain-text log file owned by one run, flushed on every line
pub struct FileTarget {
    path: PathBuf,
    file: File,
}

impl FileTarget {
    /// Create a fresh log file `<procedure>_<tag>.log` in `log_dir`, falling
    /// back to `<procedure>_<tag>-N.log` when that name is already taken.
    pub fn create_for_run(log_dir: &Path, procedure: &str, timestamp_tag: &str) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;
        for n in 1..=MAX_LOG_SUFFIX {
            let path = if n == 1 {
                log_file_path(log_dir, procedure, timestamp_tag)
            } else {
                log_file_path(log_dir, procedure, &format!("{timestamp_tag}-{n}"))
            };
            match OpenOptions::new().append(true).create_new(true).open(&path) {
                Ok(file) => return Ok(Self { path, file }),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("no free log file name for {procedure}_{timestamp_tag}"),
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogTarget for FileTarget {
    fn write_line(&mut self, _level: LogLevel, line: &str) -> io::Result<()> {
        writeln!(self.file, "{}", line)?;
        self.file.flush()
    }
}

/// Collects lines in memory; clones share the same buffer
#[derive(Debug, Clone, Default)]
pub struct MemoryTarget {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

impl LogTarget for MemoryTarget {
    fn write_line(&mut self, _level: LogLevel, line: &str) -> io::Result<()> {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line.to_string());
        }
        Ok(())
    }
}

/// In-memory report plus line-oriented log output
pub struct ReportSink {
    report: RunReport,
    targets: Vec<Box<dyn LogTarget>>,
}

impl ReportSink {
    pub fn new(report: RunReport) -> Self {
        Self {
            report,
            targets: Vec::new(),
        }
    }

    pub fn with_target(mut self, target: impl LogTarget + 'static) -> Self {
        self.targets.push(Box::new(target));
        self
    }

    pub fn add_target(&mut self, target: Box<dyn LogTarget>) {
        self.targets.push(target);
    }

    pub fn report(&self) -> &RunReport {
        &self.report
    }

    pub fn into_report(self) -> RunReport {
        self.report
    }

    /// Write one line to every target. Target failures are reported, never
    /// propagated: losing a log line must not change the run's outcome.
    pub fn log(&mut self, level: LogLevel, message: &str) {
        let line = format_line(Local::now(), level, message);
        for target in &mut self.targets {
            if let Err(e) = target.write_line(level, &line) {
                warn!("Failed to write run log line: {}", e);
            }
        }
    }

    /// Append an entry and log its outcome immediately
    pub fn record(&mut self, entry: ReportEntry) -> Result<()> {
        let level = entry.level();
        let message = format!(
            "{}: {} ({})",
            entry.step,
            entry.outcome,
            format_duration(entry.duration)
        );
        self.report.push(entry)?;
        self.log(level, &message);
        Ok(())
    }

    /// Seal the report and print the summary block
    pub fn finalize(&mut self, state: RunState, reason: Option<AbortReason>) -> Summary {
        if let Some(reason) = &reason {
            self.log(LogLevel::Error, &format!("Run aborted: {}", reason));
        }
        self.report.seal(state, reason);
        let summary = self.report.summary();
        let procedure = self.report.procedure.clone();
        for (level, line) in summary.lines(&procedure) {
            self.log(level, &line);
        }
        summary
    }
}
