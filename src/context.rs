//! Per-run shared state handed to every step.
//!
//! A [`Context`] is built once at run start from the frozen configuration,
//! the capabilities resolved by the precondition checker and the procedure
//! parameters. Steps only ever see `&Context`; nothing in it changes while
//! the run is in progress.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Local};

use crate::command_executor::{CommandOutput, CommandSpec, Executor};
use crate::config::OpsConfig;
use crate::error::{ExecutionError, StepFailure};
use crate::preconditions::Capabilities;
use crate::process_guard::CancelFlag;

/// `strftime` pattern for timestamps embedded in file names
pub const TIMESTAMP_TAG_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Procedure parameters (`--flag value` pairs and resolved inputs)
pub type Params = BTreeMap<String, String>;

/// `<procedure>-<timestamp tag>-<pid>`
pub fn run_id(procedure: &str, started_at: DateTime<Local>) -> String {
    format!(
        "{}-{}-{}",
        procedure,
        started_at.format(TIMESTAMP_TAG_FORMAT),
        std::process::id()
    )
}

pub struct Context {
    procedure: String,
    run_id: String,
    started_at: DateTime<Local>,
    config: Arc<OpsConfig>,
    capabilities: Capabilities,
    executor: Arc<dyn Executor>,
    params: Params,
    cancel: CancelFlag,
}

impl Context {
    pub fn builder(
        procedure: impl Into<String>,
        config: Arc<OpsConfig>,
        executor: Arc<dyn Executor>,
    ) -> ContextBuilder {
        ContextBuilder {
            procedure: procedure.into(),
            config,
            executor,
            capabilities: Capabilities::default(),
            params: Params::new(),
            cancel: CancelFlag::new(),
            started_at: None,
        }
    }

    pub fn procedure(&self) -> &str {
        &self.procedure
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    /// Run start time formatted for file names, e.g. `20261018_142501`
    pub fn timestamp_tag(&self) -> String {
        self.started_at.format(TIMESTAMP_TAG_FORMAT).to_string()
    }

    pub fn config(&self) -> &OpsConfig {
        &self.config
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn executor(&self) -> &dyn Executor {
        self.executor.as_ref()
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Parameter that must be present for the step to proceed
    pub fn require_param(&self, key: &str) -> Result<&str, StepFailure> {
        self.param(key)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| StepFailure::MissingParameter(key.to_string()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Mutating commands are logged instead of run
    pub fn is_dry_run(&self) -> bool {
        self.executor.is_dry_run()
    }

    /// Run a command, reporting its exit code without judging it
    pub fn exec(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecutionError> {
        self.executor.execute(spec)
    }

    /// Run a command that must exit 0
    pub fn exec_checked(&self, spec: &CommandSpec) -> Result<CommandOutput, StepFailure> {
        self.executor.run_checked(spec)
    }
}

pub struct ContextBuilder {
    procedure: String,
    config: Arc<OpsConfig>,
    executor: Arc<dyn Executor>,
    capabilities: Capabilities,
    params: Params,
    cancel: CancelFlag,
    started_at: Option<DateTime<Local>>,
}

impl ContextBuilder {
    pub fn capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn started_at(mut self, started_at: DateTime<Local>) -> Self {
        self.started_at = Some(started_at);
        self
    }

    pub fn build(self) -> Context {
        let started_at = self.started_at.unwrap_or_else(Local::now);
        let run_id = run_id(&self.procedure, started_at);
        Context {
            procedure: self.procedure,
            run_id,
            started_at,
            config: self.config,
            capabilities: self.capabilities,
            executor: self.executor,
            params: self.params,
            cancel: self.cancel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_executor::ScriptedExecutor;
    use chrono::TimeZone;

    fn context() -> Context {
        let started = Local.with_ymd_and_hms(2026, 10, 18, 14, 25, 1).unwrap();
        Context::builder(
            "backup",
            Arc::new(OpsConfig::default()),
            Arc::new(ScriptedExecutor::new()),
        )
        .param("database", "shop")
        .param("empty", "  ")
        .started_at(started)
        .build()
    }

    #[test]
    fn test_timestamp_tag_and_run_id() {
        let ctx = context();
        assert_eq!(ctx.timestamp_tag(), "20261018_142501");
        assert!(ctx.run_id().starts_with("backup-20261018_142501-"));
        assert_eq!(ctx.procedure(), "backup");
    }

    #[test]
    fn test_params() {
        let ctx = context();
        assert_eq!(ctx.param("database"), Some("shop"));
        assert_eq!(ctx.require_param("database").unwrap(), "shop");
        assert!(matches!(
            ctx.require_param("empty"),
            Err(StepFailure::MissingParameter(_))
        ));
        assert!(ctx.require_param("absent").is_err());
    }

    #[test]
    fn test_cancel_flag_visible() {
        let flag = CancelFlag::new();
        let ctx = Context::builder(
            "monitor",
            Arc::new(OpsConfig::default()),
            Arc::new(ScriptedExecutor::new()),
        )
        .cancel_flag(flag.clone())
        .build();
        assert!(!ctx.is_cancelled());
        flag.cancel();
        assert!(ctx.is_cancelled());
    }
}
