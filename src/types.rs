//! Type-safe host and logging types for hostops
//!
//! Stringly-typed script variables (`PKG_MANAGER=apt`, `FIREWALL=ufw`) become
//! enums here, resolved once and matched exhaustively.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Operating system family a procedure targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Linux,
    Windows,
    #[strum(serialize = "macos")]
    MacOs,
    Other,
}

impl OsFamily {
    /// Family of the platform this binary was compiled for
    pub fn current() -> Self {
        Self::from_target_os(std::env::consts::OS)
    }

    /// Map a `std::env::consts::OS` value to a family
    pub fn from_target_os(os: &str) -> Self {
        match os {
            "linux" => Self::Linux,
            "windows" => Self::Windows,
            "macos" => Self::MacOs,
            _ => Self::Other,
        }
    }
}

/// Privilege level a procedure requires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Privilege {
    #[default]
    User,
    /// root on Unix, Administrator on Windows
    Root,
}

/// System package manager, detected in priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    Apt,
    Dnf,
    Yum,
    Zypper,
    Pacman,
    Apk,
}

impl PackageManager {
    /// Detection order: first binary found wins
    pub const DETECTION_ORDER: &'static [Self] = &[
        Self::Apt,
        Self::Dnf,
        Self::Yum,
        Self::Zypper,
        Self::Pacman,
        Self::Apk,
    ];

    /// Binary probed on `PATH` to detect this package manager
    pub const fn binary(self) -> &'static str {
        match self {
            Self::Apt => "apt-get",
            Self::Dnf => "dnf",
            Self::Yum => "yum",
            Self::Zypper => "zypper",
            Self::Pacman => "pacman",
            Self::Apk => "apk",
        }
    }

    /// Arguments to refresh the package index
    pub fn refresh_args(self) -> &'static [&'static str] {
        match self {
            Self::Apt => &["update"],
            Self::Dnf | Self::Yum => &["makecache"],
            Self::Zypper => &["--non-interactive", "refresh"],
            Self::Pacman => &["-Sy"],
            Self::Apk => &["update"],
        }
    }

    /// Arguments to upgrade all installed packages unattended
    pub fn upgrade_args(self) -> &'static [&'static str] {
        match self {
            Self::Apt => &["-y", "upgrade"],
            Self::Dnf | Self::Yum => &["-y", "upgrade"],
            Self::Zypper => &["--non-interactive", "update"],
            Self::Pacman => &["-Su", "--noconfirm"],
            Self::Apk => &["upgrade"],
        }
    }

    /// Arguments to remove orphaned dependencies, if the manager supports it
    pub fn autoremove_args(self) -> Option<&'static [&'static str]> {
        match self {
            Self::Apt => Some(&["-y", "autoremove"]),
            Self::Dnf | Self::Yum => Some(&["-y", "autoremove"]),
            Self::Zypper | Self::Pacman | Self::Apk => None,
        }
    }

    /// Arguments to clean the download cache
    pub fn clean_args(self) -> &'static [&'static str] {
        match self {
            Self::Apt => &["clean"],
            Self::Dnf | Self::Yum => &["clean", "all"],
            Self::Zypper => &["clean", "--all"],
            Self::Pacman => &["-Sc", "--noconfirm"],
            Self::Apk => &["cache", "clean"],
        }
    }
}

/// Firewall control tool, detected in priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FirewallBackend {
    Ufw,
    Firewalld,
    Iptables,
    Netsh,
}

impl FirewallBackend {
    pub const DETECTION_ORDER: &'static [Self] =
        &[Self::Ufw, Self::Firewalld, Self::Iptables, Self::Netsh];

    /// Binary probed on `PATH` (and invoked) for this backend
    pub const fn binary(self) -> &'static str {
        match self {
            Self::Ufw => "ufw",
            Self::Firewalld => "firewall-cmd",
            Self::Iptables => "iptables",
            Self::Netsh => "netsh",
        }
    }
}

/// Service supervisor, detected in priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ServiceManager {
    Systemd,
    #[strum(serialize = "sysv")]
    SysV,
}

impl ServiceManager {
    pub const DETECTION_ORDER: &'static [Self] = &[Self::Systemd, Self::SysV];

    pub const fn binary(self) -> &'static str {
        match self {
            Self::Systemd => "systemctl",
            Self::SysV => "service",
        }
    }

    /// Command line that exits 0 when `service` is running
    pub fn is_active_args(self, service: &str) -> (&'static str, Vec<String>) {
        match self {
            Self::Systemd => (
                "systemctl",
                vec!["is-active".to_string(), "--quiet".to_string(), service.to_string()],
            ),
            Self::SysV => ("service", vec![service.to_string(), "status".to_string()]),
        }
    }

    /// Command line that stops and disables `service`
    pub fn disable_args(self, service: &str) -> (&'static str, Vec<String>) {
        match self {
            Self::Systemd => (
                "systemctl",
                vec!["disable".to_string(), "--now".to_string(), service.to_string()],
            ),
            Self::SysV => ("service", vec![service.to_string(), "stop".to_string()]),
        }
    }
}

/// Severity of a run log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Success,
}

impl LogLevel {
    /// ANSI colour used on the console
    pub const fn color_code(self) -> &'static str {
        match self {
            Self::Success => "\x1b[1;32m",
            Self::Info => "\x1b[1;34m",
            Self::Warning => "\x1b[1;33m",
            Self::Error => "\x1b[1;31m",
        }
    }
}
