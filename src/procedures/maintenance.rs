//! `system-update`: refresh, upgrade and tidy the package set.

use std::path::Path;

use crate::command_executor::CommandSpec;
use crate::context::Context;
use crate::error::{ExecutionError, StepFailure};
use crate::preconditions::Requirements;
use crate::procedure::Procedure;
use crate::step::{Outcome, Step};
use crate::types::PackageManager;

use super::{command, package_manager};

/// Flag file Debian-family systems create when an update needs a reboot
pub const REBOOT_REQUIRED_FLAG: &str = "/var/run/reboot-required";

pub struct SystemUpdate;

impl Procedure for SystemUpdate {
    fn name(&self) -> &'static str {
        "system-update"
    }

    fn description(&self) -> &'static str {
        "Refresh the package index, upgrade packages and clean up"
    }

    fn requirements(&self) -> Requirements {
        Requirements::new().root().package_manager()
    }

    fn resource(&self) -> Option<&'static str> {
        Some("package-manager")
    }

    fn steps(&self) -> Vec<Step> {
        vec![
            Step::critical("refresh-index", refresh_index).describe("Refresh the package index"),
            Step::critical("upgrade-packages", upgrade_packages)
                .describe("Upgrade all installed packages"),
            Step::optional("remove-orphans", remove_orphans)
                .describe("Remove dependencies nothing needs any more"),
            Step::optional("clean-cache", clean_cache).describe("Clean the download cache"),
            Step::optional("reboot-required", reboot_required)
                .describe("Report whether a reboot is pending"),
        ]
    }
}

fn pm_command(pm: PackageManager, args: &[&str]) -> CommandSpec {
    let spec = command(pm.binary(), args);
    match pm {
        PackageManager::Apt => spec.env("DEBIAN_FRONTEND", "noninteractive"),
        _ => spec,
    }
}

fn refresh_index(ctx: &Context) -> Result<Outcome, StepFailure> {
    let pm = package_manager(ctx)?;
    ctx.exec_checked(&pm_command(pm, pm.refresh_args()))?;
    Ok(Outcome::success(format!("{pm} index refreshed")))
}

fn upgrade_packages(ctx: &Context) -> Result<Outcome, StepFailure> {
    let pm = package_manager(ctx)?;
    let output = ctx.exec_checked(&pm_command(pm, pm.upgrade_args()))?;
    let changed = output
        .stdout
        .lines()
        .find(|l| l.contains("upgraded,") || l.starts_with("Upgraded:"))
        .map(str::trim)
        .unwrap_or("packages upgraded");
    Ok(Outcome::success(changed.to_string()))
}

fn remove_orphans(ctx: &Context) -> Result<Outcome, StepFailure> {
    let pm = package_manager(ctx)?;
    match pm.autoremove_args() {
        Some(args) => {
            ctx.exec_checked(&pm_command(pm, args))?;
            Ok(Outcome::success("orphaned packages removed"))
        }
        None => Ok(Outcome::skipped(format!("{pm} has no orphan removal"))),
    }
}

fn clean_cache(ctx: &Context) -> Result<Outcome, StepFailure> {
    let pm = package_manager(ctx)?;
    ctx.exec_checked(&pm_command(pm, pm.clean_args()))?;
    Ok(Outcome::success("package cache cleaned"))
}

fn reboot_required(ctx: &Context) -> Result<Outcome, StepFailure> {
    match package_manager(ctx)? {
        PackageManager::Apt => Ok(Outcome::success(reboot_message(
            Path::new(REBOOT_REQUIRED_FLAG).exists(),
        ))),
        PackageManager::Dnf | PackageManager::Yum => {
            // needs-restarting -r: 0 none pending, 1 reboot required
            let spec = command("needs-restarting", &["-r"]).read_only();
            match ctx.exec(&spec) {
                Ok(output) if output.exit_code_in(&[0, 1]) => {
                    Ok(Outcome::success(reboot_message(output.exit_code == Some(1))))
                }
                Ok(output) => {
                    output.ensure_success("needs-restarting")?;
                    Ok(Outcome::success(""))
                }
                Err(ExecutionError::NotFound { .. }) => {
                    Ok(Outcome::skipped("needs-restarting not installed"))
                }
                Err(e) => Err(e.into()),
            }
        }
        pm => Ok(Outcome::skipped(format!("no reboot detection for {pm}"))),
    }
}

fn reboot_message(required: bool) -> &'static str {
    if required {
        "reboot required"
    } else {
        "no reboot required"
    }
}
