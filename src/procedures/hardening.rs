//! `harden`: firewall baseline, SSH audit, kernel network settings and
//! unused services.

use crate::command_executor::CommandSpec;
use crate::context::Context;
use crate::error::StepFailure;
use crate::preconditions::Requirements;
use crate::procedure::Procedure;
use crate::step::{Outcome, Step};
use crate::types::FirewallBackend;

use super::{command, firewall, service_is_active, service_manager};

pub const SSHD_CONFIG: &str = "/etc/ssh/sshd_config";

/// Kernel network settings applied by `apply-network-sysctls`
pub const NETWORK_SYSCTLS: &[(&str, &str)] = &[
    ("net.ipv4.conf.all.rp_filter", "1"),
    ("net.ipv4.conf.default.rp_filter", "1"),
    ("net.ipv4.conf.all.accept_redirects", "0"),
    ("net.ipv4.conf.all.send_redirects", "0"),
    ("net.ipv4.conf.all.accept_source_route", "0"),
    ("net.ipv4.icmp_echo_ignore_broadcasts", "1"),
    ("net.ipv4.tcp_syncookies", "1"),
];

pub struct Harden;

impl Procedure for Harden {
    fn name(&self) -> &'static str {
        "harden"
    }

    fn description(&self) -> &'static str {
        "Enable the firewall, audit SSH and tighten network settings"
    }

    fn requirements(&self) -> Requirements {
        Requirements::new().root().firewall()
    }

    fn resource(&self) -> Option<&'static str> {
        Some("firewall-config")
    }

    fn steps(&self) -> Vec<Step> {
        // SSH must be open before incoming traffic is denied
        vec![
            Step::critical("allow-ssh", allow_ssh).describe("Allow the SSH port"),
            Step::critical("enable-firewall", enable_firewall)
                .describe("Enable the firewall with incoming traffic denied by default"),
            Step::optional("audit-ssh-root-login", audit_root_login)
                .describe("Check that sshd refuses root logins"),
            Step::optional("apply-network-sysctls", apply_sysctls)
                .describe("Apply kernel network hardening settings"),
            Step::optional("disable-unused-services", disable_unused_services)
                .describe("Stop and disable services nothing should need"),
        ]
    }
}

/// Commands that turn `backend` on with a default-deny inbound policy
pub fn enable_commands(backend: FirewallBackend) -> Vec<CommandSpec> {
    match backend {
        FirewallBackend::Ufw => vec![
            command("ufw", &["default", "deny", "incoming"]),
            command("ufw", &["default", "allow", "outgoing"]),
            command("ufw", &["--force", "enable"]),
        ],
        FirewallBackend::Firewalld => vec![
            command("systemctl", &["enable", "--now", "firewalld"]),
            command("firewall-cmd", &["--set-default-zone=public"]),
            command("firewall-cmd", &["--reload"]),
        ],
        FirewallBackend::Iptables => vec![
            command("iptables", &["-A", "INPUT", "-i", "lo", "-j", "ACCEPT"]),
            command(
                "iptables",
                &[
                    "-A", "INPUT", "-m", "conntrack", "--ctstate", "ESTABLISHED,RELATED", "-j",
                    "ACCEPT",
                ],
            ),
            command("iptables", &["-P", "INPUT", "DROP"]),
        ],
        FirewallBackend::Netsh => vec![
            command("netsh", &["advfirewall", "set", "allprofiles", "state", "on"]),
            command(
                "netsh",
                &[
                    "advfirewall",
                    "set",
                    "allprofiles",
                    "firewallpolicy",
                    "blockinbound,allowoutbound",
                ],
            ),
        ],
    }
}

/// Commands that open TCP `port` on `backend`, whether or not it is running yet
pub fn allow_port_commands(backend: FirewallBackend, port: u16) -> Vec<CommandSpec> {
    match backend {
        FirewallBackend::Ufw => vec![command("ufw", &["allow", &format!("{port}/tcp")])],
        // Permanent config of the zone `enable_commands` selects; picked up on reload
        FirewallBackend::Firewalld => vec![command(
            "firewall-offline-cmd",
            &["--zone=public", &format!("--add-port={port}/tcp")],
        )],
        FirewallBackend::Iptables => vec![command(
            "iptables",
            &["-A", "INPUT", "-p", "tcp", "--dport", &port.to_string(), "-j", "ACCEPT"],
        )],
        FirewallBackend::Netsh => vec![command(
            "netsh",
            &[
                "advfirewall",
                "firewall",
                "add",
                "rule",
                "name=hostops-ssh",
                "dir=in",
                "action=allow",
                "protocol=TCP",
                &format!("localport={port}"),
            ],
        )],
    }
}

fn enable_firewall(ctx: &Context) -> Result<Outcome, StepFailure> {
    let backend = firewall(ctx)?;
    for spec in enable_commands(backend) {
        ctx.exec_checked(&spec)?;
    }
    Ok(Outcome::success(format!("{backend} enabled, incoming denied")))
}

fn allow_ssh(ctx: &Context) -> Result<Outcome, StepFailure> {
    let backend = firewall(ctx)?;
    let port = ctx.config().ssh_port;
    for spec in allow_port_commands(backend, port) {
        ctx.exec_checked(&spec)?;
    }
    Ok(Outcome::success(format!("port {port}/tcp allowed")))
}

fn audit_root_login(ctx: &Context) -> Result<Outcome, StepFailure> {
    let spec = command(
        "grep",
        &["-Eq", r"^[[:space:]]*PermitRootLogin[[:space:]]+no\b", SSHD_CONFIG],
    )
    .read_only();
    let output = ctx.exec(&spec)?;
    // 0 match, 1 no match, anything else is a real error
    match output.exit_code {
        Some(0) => Ok(Outcome::success("root login disabled")),
        Some(1) => Ok(Outcome::success(format!(
            "PermitRootLogin is not set to 'no' in {SSHD_CONFIG}; review recommended"
        ))),
        _ => {
            output.ensure_success("grep")?;
            Ok(Outcome::success(""))
        }
    }
}

fn apply_sysctls(ctx: &Context) -> Result<Outcome, StepFailure> {
    let mut failed = Vec::new();
    for (key, value) in NETWORK_SYSCTLS {
        let spec = command("sysctl", &["-w", &format!("{key}={value}")]);
        match ctx.exec(&spec) {
            Ok(output) if output.success() => {}
            Ok(_) | Err(_) => failed.push(*key),
        }
    }
    if failed.is_empty() {
        Ok(Outcome::success(format!(
            "{} settings applied",
            NETWORK_SYSCTLS.len()
        )))
    } else {
        Err(StepFailure::invalid(format!(
            "could not set {}",
            failed.join(", ")
        )))
    }
}

fn disable_unused_services(ctx: &Context) -> Result<Outcome, StepFailure> {
    let Some(manager) = service_manager(ctx) else {
        return Ok(Outcome::skipped("no service manager detected"));
    };
    let services = &ctx.config().unused_services;
    if services.is_empty() {
        return Ok(Outcome::skipped("no services listed"));
    }

    let mut disabled = Vec::new();
    for service in services {
        if !service_is_active(ctx, manager, service)? {
            continue;
        }
        let (program, args) = manager.disable_args(service);
        ctx.exec_checked(&CommandSpec::new(program).args(args))?;
        disabled.push(service.as_str());
    }

    if disabled.is_empty() {
        Ok(Outcome::success("none of the listed services were running"))
    } else {
        Ok(Outcome::success(format!("disabled {}", disabled.join(", "))))
    }
}
