//! Pre-flight checks for a procedure
//!
//! Before any step runs, the environment is verified against the
//! procedure's [`Requirements`]:
//! - the host belongs to the expected OS family
//! - the process has the required privilege (EUID 0 for root)
//! - required binaries are present on `PATH`
//! - a package manager / firewall / service manager is available if needed
//!
//! The first failing check is returned as a [`PreconditionError`]. On
//! success the detected tools are returned as [`Capabilities`], so steps
//! never re-detect them.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::PreconditionError;
use crate::types::{FirewallBackend, OsFamily, PackageManager, Privilege, ServiceManager};

/// What a procedure needs from the host
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Requirements {
    pub privilege: Privilege,
    pub binaries: Vec<String>,
    pub os_family: Option<OsFamily>,
    pub package_manager: bool,
    pub firewall: bool,
    pub service_manager: bool,
}

impl Requirements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root(mut self) -> Self {
        self.privilege = Privilege::Root;
        self
    }

    pub fn binary(mut self, name: impl Into<String>) -> Self {
        self.binaries.push(name.into());
        self
    }

    pub fn os(mut self, family: OsFamily) -> Self {
        self.os_family = Some(family);
        self
    }

    pub fn package_manager(mut self) -> Self {
        self.package_manager = true;
        self
    }

    pub fn firewall(mut self) -> Self {
        self.firewall = true;
        self
    }

    pub fn service_manager(mut self) -> Self {
        self.service_manager = true;
        self
    }
}

/// Host tools resolved once during precondition checking
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub os_family: OsFamily,
    /// `ID` from `/etc/os-release`, e.g. `debian`
    pub distro: Option<String>,
    pub package_manager: Option<PackageManager>,
    pub firewall: Option<FirewallBackend>,
    pub service_manager: Option<ServiceManager>,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            os_family: OsFamily::current(),
            distro: None,
            package_manager: None,
            firewall: None,
            service_manager: None,
        }
    }
}

/// Read-only view of the host used by the checker
pub trait SystemProbe {
    fn os_family(&self) -> OsFamily;
    fn is_privileged(&self) -> bool;
    /// Full path of an executable named `name` on `PATH`
    fn find_binary(&self, name: &str) -> Option<PathBuf>;
    fn distro_id(&self) -> Option<String>;
}

/// Probes the machine hostops runs on
#[derive(Debug, Clone, Default)]
pub struct HostProbe;

impl SystemProbe for HostProbe {
    fn os_family(&self) -> OsFamily {
        OsFamily::current()
    }

    fn is_privileged(&self) -> bool {
        nix::unistd::geteuid().is_root()
    }

    fn find_binary(&self, name: &str) -> Option<PathBuf> {
        let path = std::env::var_os("PATH")?;
        find_in_path(name, std::env::split_paths(&path))
    }

    fn distro_id(&self) -> Option<String> {
        let content = std::fs::read_to_string("/etc/os-release").ok()?;
        parse_os_release_id(&content)
    }
}

/// `which`-style lookup: an explicit path is checked directly, a bare name
/// is searched in each directory in order.
pub fn find_in_path<I>(name: &str, dirs: I) -> Option<PathBuf>
where
    I: IntoIterator<Item = PathBuf>,
{
    if name.contains('/') {
        let path = PathBuf::from(name);
        return is_executable(&path).then_some(path);
    }
    dirs.into_iter()
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Extract `ID=` from os-release content, unquoted
pub fn parse_os_release_id(content: &str) -> Option<String> {
    content
        .lines()
        .filter_map(|line| line.trim().strip_prefix("ID="))
        .map(|v| v.trim_matches('"').trim_matches('\'').to_string())
        .find(|v| !v.is_empty())
}

/// Skip root check (for development/testing)
/// Set HOSTOPS_SKIP_ROOT_CHECK=1 to skip
pub fn should_skip_root_check() -> bool {
    std::env::var("HOSTOPS_SKIP_ROOT_CHECK")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Validates [`Requirements`] against a [`SystemProbe`]
pub struct PreconditionChecker<'p> {
    probe: &'p dyn SystemProbe,
    skip_privilege: bool,
}

impl<'p> PreconditionChecker<'p> {
    pub fn new(probe: &'p dyn SystemProbe) -> Self {
        Self {
            probe,
            skip_privilege: false,
        }
    }

    /// Bypass the privilege check (logged as a warning when it matters)
    pub fn skip_privilege_check(mut self, skip: bool) -> Self {
        self.skip_privilege = skip;
        self
    }

    /// Verify the environment and resolve capabilities.
    pub fn check(&self, req: &Requirements) -> Result<Capabilities, PreconditionError> {
        debug!("Running pre-flight checks: {:?}", req);

        let found = self.probe.os_family();
        if let Some(expected) = req.os_family {
            if expected != found {
                return Err(PreconditionError::UnsupportedPlatform { expected, found });
            }
        }

        if req.privilege == Privilege::Root && !self.probe.is_privileged() {
            if self.skip_privilege {
                warn!("Root check skipped (--skip-root-check / HOSTOPS_SKIP_ROOT_CHECK)");
            } else {
                return Err(PreconditionError::InsufficientPrivilege {
                    required: Privilege::Root,
                });
            }
        }

        let missing: Vec<&str> = req
            .binaries
            .iter()
            .map(String::as_str)
            .filter(|b| self.probe.find_binary(b).is_none())
            .collect();
        if let Some(first) = missing.first() {
            warn!("Missing required binaries: {}", missing.join(", "));
            return Err(PreconditionError::MissingDependency((*first).to_string()));
        }

        let capabilities = Capabilities {
            os_family: found,
            distro: self.probe.distro_id(),
            package_manager: self.detect(PackageManager::DETECTION_ORDER, |p| p.binary()),
            firewall: self.detect(FirewallBackend::DETECTION_ORDER, |f| f.binary()),
            service_manager: self.detect(ServiceManager::DETECTION_ORDER, |s| s.binary()),
        };

        if req.package_manager && capabilities.package_manager.is_none() {
            return Err(PreconditionError::MissingDependency(
                "package manager (apt-get, dnf, yum, zypper, pacman or apk)".to_string(),
            ));
        }
        if req.firewall && capabilities.firewall.is_none() {
            return Err(PreconditionError::MissingDependency(
                "firewall tool (ufw, firewall-cmd, iptables or netsh)".to_string(),
            ));
        }
        if req.service_manager && capabilities.service_manager.is_none() {
            return Err(PreconditionError::MissingDependency(
                "service manager (systemctl or service)".to_string(),
            ));
        }

        info!(
            "Pre-flight checks passed: os={} package_manager={:?} firewall={:?} services={:?}",
            capabilities.os_family,
            capabilities.package_manager,
            capabilities.firewall,
            capabilities.service_manager
        );
        Ok(capabilities)
    }

    fn detect<T: Copy>(&self, order: &[T], binary: impl Fn(T) -> &'static str) -> Option<T> {
        order
            .iter()
            .copied()
            .find(|candidate| self.probe.find_binary(binary(*candidate)).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    struct FakeProbe {
        os: OsFamily,
        root: bool,
        binaries: HashSet<&'static str>,
    }

    impl SystemProbe for FakeProbe {
        fn os_family(&self) -> OsFamily {
            self.os
        }
        fn is_privileged(&self) -> bool {
            self.root
        }
        fn find_binary(&self, name: &str) -> Option<PathBuf> {
            self.binaries
                .contains(name)
                .then(|| PathBuf::from("/usr/bin").join(name))
        }
        fn distro_id(&self) -> Option<String> {
            Some("debian".to_string())
        }
    }

    fn probe(root: bool, binaries: &[&'static str]) -> FakeProbe {
        FakeProbe {
            os: OsFamily::Linux,
            root,
            binaries: binaries.iter().copied().collect(),
        }
    }

    #[test]
    fn test_privilege_required() {
        let probe = probe(false, &[]);
        let err = PreconditionChecker::new(&probe)
            .check(&Requirements::new().root())
            .unwrap_err();
        assert_eq!(
            err,
            PreconditionError::InsufficientPrivilege {
                required: Privilege::Root
            }
        );

        assert!(PreconditionChecker::new(&probe)
            .skip_privilege_check(true)
            .check(&Requirements::new().root())
            .is_ok());
    }

    #[test]
    fn test_missing_binary_reports_first() {
        let probe = probe(true, &["tar"]);
        let err = PreconditionChecker::new(&probe)
            .check(&Requirements::new().binary("tar").binary("gzip").binary("sha256sum"))
            .unwrap_err();
        assert_eq!(err, PreconditionError::MissingDependency("gzip".to_string()));
    }

    #[test]
    fn test_platform_checked_first() {
        let probe = probe(false, &[]);
        let err = PreconditionChecker::new(&probe)
            .check(&Requirements::new().root().os(OsFamily::Windows))
            .unwrap_err();
        assert!(matches!(err, PreconditionError::UnsupportedPlatform { .. }));
    }

    #[test]
    fn test_capabilities_follow_detection_order() {
        let probe = probe(true, &["yum", "dnf", "iptables", "ufw", "systemctl"]);
        let caps = PreconditionChecker::new(&probe)
            .check(&Requirements::new().package_manager().firewall().service_manager())
            .unwrap();
        assert_eq!(caps.package_manager, Some(PackageManager::Dnf));
        assert_eq!(caps.firewall, Some(FirewallBackend::Ufw));
        assert_eq!(caps.service_manager, Some(ServiceManager::Systemd));
        assert_eq!(caps.distro.as_deref(), Some("debian"));
    }

    #[test]
    fn test_missing_capability() {
        let probe = probe(true, &["apt-get"]);
        let err = PreconditionChecker::new(&probe)
            .check(&Requirements::new().package_manager().firewall())
            .unwrap_err();
        assert!(matches!(err, PreconditionError::MissingDependency(ref m) if m.starts_with("firewall")));
    }

    #[test]
    fn test_check_is_idempotent() {
        let probe = probe(false, &["apt-get"]);
        let checker = PreconditionChecker::new(&probe);
        let req = Requirements::new().package_manager();
        assert_eq!(checker.check(&req), checker.check(&req));

        let req = Requirements::new().root();
        assert_eq!(checker.check(&req), checker.check(&req));
    }

    #[test]
    fn test_parse_os_release() {
        let content = "NAME=\"Ubuntu\"\nVERSION_ID=\"24.04\"\nID=ubuntu\nID_LIKE=debian\n";
        assert_eq!(parse_os_release_id(content).as_deref(), Some("ubuntu"));
        assert_eq!(parse_os_release_id("ID=\"rocky\"").as_deref(), Some("rocky"));
        assert_eq!(parse_os_release_id("NAME=x"), None);
    }

    #[test]
    fn test_find_in_path() {
        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("mytool");
        std::fs::write(&tool, "#!/bin/sh\n").unwrap();

        // Not executable yet
        assert!(find_in_path("mytool", vec![dir.path().to_path_buf()]).is_none());

        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert_eq!(
            find_in_path("mytool", vec![dir.path().to_path_buf()]),
            Some(tool.clone())
        );
        assert_eq!(find_in_path(tool.to_str().unwrap(), Vec::new()), Some(tool));
    }

    #[test]
    fn test_host_probe_finds_sh() {
        assert!(HostProbe.find_binary("sh").is_some());
        assert!(HostProbe
            .find_binary("this_binary_definitely_does_not_exist_12345")
            .is_none());
    }
}
