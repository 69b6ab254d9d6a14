//! hostops - main entry point
//!
//! Parses the command line, loads the configuration, then hands the chosen
//! procedure to [`orchestrate`] and turns the outcome into an exit code:
//! `0` clean, `1` aborted, `2` precondition failure, `3` configuration or
//! usage error.

use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use hostops::cli::{Cli, Commands};
use hostops::command_executor::SystemExecutor;
use hostops::config::OpsConfig;
use hostops::error::{HostOpsError, Result};
use hostops::input::{InputProvider, NonInteractive, PromptInput};
use hostops::preconditions::should_skip_root_check;
use hostops::procedure::{orchestrate, RunEnv};
use hostops::process_guard::{self, CancelFlag, ProcessGuard};
use hostops::procedures;
use hostops::report::ConsoleTarget;
use hostops::runner::{StepFilter, StepRunner};

/// Configuration read when `--config` is not given, if present
const DEFAULT_CONFIG_PATH: &str = "/etc/hostops/config.json";

/// Diagnostics go to stderr; `RUST_LOG` overrides the default `info`
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    init_tracing();

    let cancel = CancelFlag::global();
    if let Err(e) = process_guard::init_signal_handlers(cancel.clone()) {
        warn!("Failed to initialize signal handlers: {}", e);
    }
    debug!("Signal handlers initialized");

    let cli = Cli::parse_args();

    let code = {
        // Terminates any child still registered before we exit
        let _guard = ProcessGuard::new();
        match run(&cli, cancel) {
            Ok(code) => code,
            Err(e) => {
                error!("{}", e);
                eprintln!("✗ {}", e);
                exit_code_for(&e)
            }
        }
    };
    std::process::exit(code);
}

fn exit_code_for(err: &HostOpsError) -> i32 {
    match err {
        HostOpsError::Config(_) | HostOpsError::Usage(_) | HostOpsError::Input(_) => 3,
        HostOpsError::Precondition(_) => 2,
        _ => 1,
    }
}

fn run(cli: &Cli, cancel: CancelFlag) -> Result<i32> {
    match &cli.command {
        Commands::List => {
            print_catalog();
            return Ok(0);
        }
        Commands::ValidateConfig { path } => {
            info!("Validating configuration file: {:?}", path);
            load_config(Some(path))?;
            println!("✓ Configuration file is valid: {}", path.display());
            return Ok(0);
        }
        _ => {}
    }

    let name = cli
        .command
        .procedure()
        .ok_or_else(|| HostOpsError::usage("no procedure selected"))?;
    let procedure = procedures::find(name)
        .ok_or_else(|| HostOpsError::usage(format!("unknown procedure '{name}'")))?;

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(dir) = &cli.log_dir {
        config.log_dir = dir.clone();
    }
    if let Some(secs) = cli.timeout {
        config.command_timeout_secs = secs;
    }
    config
        .validate()
        .map_err(|e| HostOpsError::config(format!("{e:#}")))?;
    let config = Arc::new(config);

    let executor = SystemExecutor::new()
        .with_default_timeout(config.command_timeout())
        .with_dry_run(cli.dry_run);
    if cli.dry_run {
        info!("Dry-run mode: mutating commands will be logged, not executed");
    }

    let input: Box<dyn InputProvider> = if cli.non_interactive || !io::stdin().is_terminal() {
        Box::new(NonInteractive)
    } else {
        Box::new(PromptInput::stdin())
    };

    let env = RunEnv::new(Arc::clone(&config), Arc::new(executor))
        .with_input(input)
        .with_filter(StepFilter::new(cli.only.clone(), cli.skip.clone()))
        .skip_root_check(cli.skip_root_check || should_skip_root_check())
        .with_cancel(cancel)
        .with_log_dir(config.log_dir.clone());

    let color =
        !cli.no_color && std::env::var_os("NO_COLOR").is_none() && io::stdout().is_terminal();
    let runner = StepRunner::new().with_target(ConsoleTarget::new(color));

    let outcome = orchestrate(procedure.as_ref(), cli.command.params(), runner, &env)?;

    if let Some(path) = &cli.report_json {
        outcome.report.write_json(path)?;
        info!("Report written to {}", path.display());
    }
    if let Some(log) = &outcome.log_file {
        info!("Run log: {}", log.display());
    }

    Ok(outcome.exit_code())
}

/// File (explicit or default location) -> environment overrides -> validation
fn load_config(path: Option<&Path>) -> Result<OpsConfig> {
    let path: Option<PathBuf> = match path {
        Some(p) => Some(p.to_path_buf()),
        None => Some(PathBuf::from(DEFAULT_CONFIG_PATH)).filter(|p| p.exists()),
    };

    let mut config = match &path {
        Some(p) => {
            debug!("Loading configuration from {:?}", p);
            OpsConfig::load_from_file(p).map_err(|e| HostOpsError::config(format!("{e:#}")))?
        }
        None => OpsConfig::default(),
    };
    config
        .apply_env_overrides()
        .map_err(|e| HostOpsError::config(format!("{e:#}")))?;
    config
        .validate()
        .map_err(|e| HostOpsError::config(format!("{e:#}")))?;
    Ok(config)
}

fn print_catalog() {
    for procedure in procedures::catalog() {
        let requirements = procedure.requirements();
        println!("{}: {}", procedure.name(), procedure.description());
        println!("  privilege: {}", requirements.privilege);
        if let Some(resource) = procedure.resource() {
            println!("  resource:  {}", resource);
        }
        for (i, step) in procedure.steps().iter().enumerate() {
            let kind = if step.is_critical() { "critical" } else { "optional" };
            println!(
                "  {}. {:<26} [{}] {}",
                i + 1,
                step.name(),
                kind,
                step.description()
            );
        }
        println!();
    }
}
