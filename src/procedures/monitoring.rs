//! `monitor`: compare resource usage against configured thresholds.
//!
//! Every check is non-critical so a breach in one does not hide the others;
//! a breach is reported as a failed step, which prints at WARNING.

use std::fs;

use crate::context::Context;
use crate::error::StepFailure;
use crate::preconditions::Requirements;
use crate::procedure::Procedure;
use crate::step::{Outcome, Step};

use super::{command, service_is_active, service_manager};

/// Filesystems that never hold persistent data
const VIRTUAL_FILESYSTEMS: &[&str] = &["tmpfs", "devtmpfs", "udev", "overlay", "squashfs", "none"];

pub struct Monitor;

impl Procedure for Monitor {
    fn name(&self) -> &'static str {
        "monitor"
    }

    fn description(&self) -> &'static str {
        "Check disk, memory, load and service health against thresholds"
    }

    fn requirements(&self) -> Requirements {
        Requirements::new().binary("df")
    }

    fn steps(&self) -> Vec<Step> {
        vec![
            Step::optional("disk-usage", disk_usage).describe("Disk usage per mounted filesystem"),
            Step::optional("memory-usage", memory_usage).describe("Memory in use"),
            Step::optional("load-average", load_average)
                .describe("One-minute load relative to CPU count"),
            Step::optional("service-status", service_status)
                .describe("Monitored services are running"),
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiskUsage {
    pub mount: String,
    pub percent: f64,
}

/// Parse `df -P` output, ignoring virtual filesystems
pub fn parse_df(output: &str) -> Vec<DiskUsage> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 6 || VIRTUAL_FILESYSTEMS.contains(&fields[0]) {
                return None;
            }
            let percent = fields[4].trim_end_matches('%').parse().ok()?;
            Some(DiskUsage {
                mount: fields[5..].join(" "),
                percent,
            })
        })
        .collect()
}

/// Percentage of memory in use from `/proc/meminfo` content
pub fn parse_meminfo(content: &str) -> Option<f64> {
    let field = |name: &str| -> Option<f64> {
        content
            .lines()
            .find(|l| l.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    (total > 0.0).then(|| (total - available) / total * 100.0)
}

/// One-minute load average from `/proc/loadavg` content
pub fn parse_loadavg(content: &str) -> Option<f64> {
    content.split_whitespace().next()?.parse().ok()
}

fn disk_usage(ctx: &Context) -> Result<Outcome, StepFailure> {
    let threshold = ctx.config().thresholds.disk_percent;
    let output = ctx.exec_checked(&command("df", &["-P"]).read_only())?;
    let disks = parse_df(&output.stdout);
    if disks.is_empty() {
        return Err(StepFailure::invalid("df reported no filesystems"));
    }

    let breaches: Vec<String> = disks
        .iter()
        .filter(|d| d.percent >= threshold)
        .map(|d| format!("{} {:.0}%", d.mount, d.percent))
        .collect();
    if !breaches.is_empty() {
        return Err(StepFailure::invalid(format!(
            "disk usage at or above {threshold:.0}%: {}",
            breaches.join(", ")
        )));
    }

    let fullest = disks
        .iter()
        .max_by(|a, b| a.percent.total_cmp(&b.percent))
        .map(|d| format!("fullest: {} {:.0}%", d.mount, d.percent))
        .unwrap_or_default();
    Ok(Outcome::success(fullest))
}

fn memory_usage(ctx: &Context) -> Result<Outcome, StepFailure> {
    let threshold = ctx.config().thresholds.memory_percent;
    let content = fs::read_to_string("/proc/meminfo")?;
    let used = parse_meminfo(&content)
        .ok_or_else(|| StepFailure::invalid("cannot parse /proc/meminfo"))?;
    check_threshold("memory usage", used, threshold)
}

fn load_average(ctx: &Context) -> Result<Outcome, StepFailure> {
    let threshold = ctx.config().thresholds.cpu_percent;
    let content = fs::read_to_string("/proc/loadavg")?;
    let load = parse_loadavg(&content)
        .ok_or_else(|| StepFailure::invalid("cannot parse /proc/loadavg"))?;
    let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
    check_threshold("CPU load", load / cpus as f64 * 100.0, threshold)
}

fn check_threshold(what: &str, value: f64, threshold: f64) -> Result<Outcome, StepFailure> {
    if value >= threshold {
        Err(StepFailure::invalid(format!(
            "{what} {value:.1}% at or above threshold {threshold:.0}%"
        )))
    } else {
        Ok(Outcome::success(format!("{what} {value:.1}%")))
    }
}

fn service_status(ctx: &Context) -> Result<Outcome, StepFailure> {
    let Some(manager) = service_manager(ctx) else {
        return Ok(Outcome::skipped("no service manager detected"));
    };
    let services = &ctx.config().monitored_services;
    if services.is_empty() {
        return Ok(Outcome::skipped("no services monitored"));
    }

    let mut inactive = Vec::new();
    for service in services {
        if !service_is_active(ctx, manager, service)? {
            inactive.push(service.as_str());
        }
    }
    if inactive.is_empty() {
        Ok(Outcome::success(format!("{} service(s) active", services.len())))
    } else {
        Err(StepFailure::invalid(format!("not running: {}", inactive.join(", "))))
    }
}
