//! Operator configuration.
//!
//! Every tunable (backup location, retention, alert thresholds) lives in one
//! [`OpsConfig`]. It is loaded from a JSON file, overridden from `HOSTOPS_*`
//! environment variables, validated, then shared read-only for the run.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Upper bound for `command_timeout_secs` (one week)
pub const MAX_COMMAND_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

/// Resource usage limits checked by the `monitor` procedure (percentages)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu_percent: 80.0,
            memory_percent: 85.0,
            disk_percent: 90.0,
        }
    }
}

/// Credentials and database list for one database engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub user: Option<String>,
    /// Name of the environment variable holding the password, never the
    /// password itself
    pub password_env: Option<String>,
    pub databases: Vec<String>,
}

impl DatabaseConfig {
    pub fn is_configured(&self) -> bool {
        !self.databases.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpsConfig {
    pub backup_dir: PathBuf,
    pub retention_days: u32,
    pub log_dir: PathBuf,
    pub lock_dir: PathBuf,
    /// Paths archived by the `backup` procedure besides database dumps
    pub config_paths: Vec<PathBuf>,
    pub alert_email: Option<String>,
    pub smtp_host: Option<String>,
    pub thresholds: Thresholds,
    pub monitored_services: Vec<String>,
    /// Services the `harden` procedure stops and disables when present
    pub unused_services: Vec<String>,
    pub ssh_port: u16,
    /// Applied to every command that has no explicit timeout; 0 disables
    pub command_timeout_secs: u64,
    pub mysql: DatabaseConfig,
    pub postgres: DatabaseConfig,
}

impl Default for OpsConfig {
    fn default() -> Self {
        Self {
            backup_dir: PathBuf::from("/var/backups/hostops"),
            retention_days: 7,
            log_dir: PathBuf::from("/var/log/hostops"),
            lock_dir: PathBuf::from("/run/lock/hostops"),
            config_paths: vec![PathBuf::from("/etc")],
            alert_email: None,
            smtp_host: None,
            thresholds: Thresholds::default(),
            monitored_services: vec!["ssh".to_string(), "cron".to_string()],
            unused_services: vec![
                "avahi-daemon".to_string(),
                "cups".to_string(),
                "rpcbind".to_string(),
            ],
            ssh_port: 22,
            command_timeout_secs: 3600,
            mysql: DatabaseConfig::default(),
            postgres: DatabaseConfig::default(),
        }
    }
}

impl OpsConfig {
    /// Load configuration from a JSON file; missing fields take defaults
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;

        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize configuration to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Apply `HOSTOPS_*` overrides from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (the environment in
    /// production, a map in tests)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("HOSTOPS_BACKUP_DIR") {
            self.backup_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("HOSTOPS_LOG_DIR") {
            self.log_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("HOSTOPS_LOCK_DIR") {
            self.lock_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("HOSTOPS_RETENTION_DAYS") {
            self.retention_days = v
                .trim()
                .parse()
                .with_context(|| format!("HOSTOPS_RETENTION_DAYS is not a number: {v:?}"))?;
        }
        if let Some(v) = lookup("HOSTOPS_ALERT_EMAIL") {
            self.alert_email = Some(v);
        }
        if let Some(v) = lookup("HOSTOPS_SMTP_HOST") {
            self.smtp_host = Some(v);
        }
        for (key, slot) in [
            ("HOSTOPS_CPU_THRESHOLD", &mut self.thresholds.cpu_percent),
            ("HOSTOPS_MEMORY_THRESHOLD", &mut self.thresholds.memory_percent),
            ("HOSTOPS_DISK_THRESHOLD", &mut self.thresholds.disk_percent),
        ] {
            if let Some(v) = lookup(key) {
                *slot = v
                    .trim()
                    .trim_end_matches('%')
                    .parse()
                    .with_context(|| format!("{key} is not a number: {v:?}"))?;
            }
        }
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.retention_days == 0 {
            anyhow::bail!("retention_days must be at least 1");
        }

        for (name, value) in [
            ("cpu_percent", self.thresholds.cpu_percent),
            ("memory_percent", self.thresholds.memory_percent),
            ("disk_percent", self.thresholds.disk_percent),
        ] {
            if !(value > 0.0 && value <= 100.0) {
                anyhow::bail!("thresholds.{name} must be in (0, 100], got {value}");
            }
        }

        if self.backup_dir.as_os_str().is_empty() || !self.backup_dir.is_absolute() {
            anyhow::bail!("backup_dir must be an absolute path");
        }
        if self.log_dir.as_os_str().is_empty() {
            anyhow::bail!("log_dir must be specified");
        }

        if let Some(email) = &self.alert_email {
            let email = email.trim();
            if !email.contains('@') || email.starts_with('@') || email.ends_with('@') {
                anyhow::bail!("alert_email is not a valid address: {email:?}");
            }
        }

        if self.command_timeout_secs > MAX_COMMAND_TIMEOUT_SECS {
            anyhow::bail!(
                "command_timeout_secs must be at most {MAX_COMMAND_TIMEOUT_SECS}, got {}",
                self.command_timeout_secs
            );
        }

        if self.ssh_port == 0 {
            anyhow::bail!("ssh_port must be between 1 and 65535");
        }

        for service in self.monitored_services.iter().chain(&self.unused_services) {
            if service.trim().is_empty() || service.contains(char::is_whitespace) {
                anyhow::bail!("invalid service name: {service:?}");
            }
        }

        Ok(())
    }

    /// Command timeout as a `Duration`, `None` when disabled
    pub fn command_timeout(&self) -> Option<std::time::Duration> {
        (self.command_timeout_secs > 0)
            .then(|| std::time::Duration::from_secs(self.command_timeout_secs))
    }
}
