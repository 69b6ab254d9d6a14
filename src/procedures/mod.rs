//! Built-in procedures.
//!
//! Each submodule defines one [`Procedure`] and keeps its parsing helpers
//! next to it. Criticality is decided per step: actions whose failure leaves
//! the host in an unknown state are critical, probes and housekeeping are
//! not.

pub mod backup;
pub mod hardening;
pub mod maintenance;
pub mod monitoring;
pub mod users;

use crate::command_executor::CommandSpec;
use crate::context::Context;
use crate::error::StepFailure;
use crate::procedure::Procedure;
use crate::types::{FirewallBackend, PackageManager, ServiceManager};

pub use backup::Backup;
pub use hardening::Harden;
pub use maintenance::SystemUpdate;
pub use monitoring::Monitor;
pub use users::AddUser;

/// Every procedure, in `list` order
pub fn catalog() -> Vec<Box<dyn Procedure>> {
    vec![
        Box::new(SystemUpdate),
        Box::new(Backup),
        Box::new(Harden),
        Box::new(Monitor),
        Box::new(AddUser),
    ]
}

pub fn find(name: &str) -> Option<Box<dyn Procedure>> {
    catalog().into_iter().find(|p| p.name() == name)
}

fn command(program: &str, args: &[&str]) -> CommandSpec {
    CommandSpec::new(program).args(args.iter().copied())
}

fn package_manager(ctx: &Context) -> Result<PackageManager, StepFailure> {
    ctx.capabilities()
        .package_manager
        .ok_or_else(|| StepFailure::invalid("no supported package manager detected"))
}

fn firewall(ctx: &Context) -> Result<FirewallBackend, StepFailure> {
    ctx.capabilities()
        .firewall
        .ok_or_else(|| StepFailure::invalid("no supported firewall tool detected"))
}

fn service_manager(ctx: &Context) -> Option<ServiceManager> {
    ctx.capabilities().service_manager
}

/// `Ok(true)` when `service` is running
fn service_is_active(
    ctx: &Context,
    manager: ServiceManager,
    service: &str,
) -> Result<bool, StepFailure> {
    let (program, args) = manager.is_active_args(service);
    let output = ctx.exec(&CommandSpec::new(program).args(args).read_only())?;
    Ok(output.success())
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use crate::command_executor::ScriptedExecutor;
    use crate::config::OpsConfig;
    use crate::context::Context;
    use crate::preconditions::Capabilities;
    use crate::report::RunReport;
    use crate::runner::StepRunner;
    use crate::types::{FirewallBackend, OsFamily, PackageManager, ServiceManager};

    use super::Procedure;

    pub fn debian() -> Capabilities {
        Capabilities {
            os_family: OsFamily::Linux,
            distro: Some("debian".to_string()),
            package_manager: Some(PackageManager::Apt),
            firewall: Some(FirewallBackend::Ufw),
            service_manager: Some(ServiceManager::Systemd),
        }
    }

    pub fn context(
        procedure: &str,
        config: OpsConfig,
        capabilities: Capabilities,
        executor: Arc<ScriptedExecutor>,
    ) -> Context {
        Context::builder(procedure, Arc::new(config), executor)
            .capabilities(capabilities)
            .build()
    }

    /// Run every step of `procedure` against `ctx` and return the report
    pub fn run(procedure: &dyn Procedure, ctx: &Context) -> RunReport {
        StepRunner::new()
            .run(&procedure.steps(), ctx)
            .expect("well-formed step list")
    }
}
