//! `backup`: database dumps, configuration archive, checksums, retention.
//!
//! All artefacts of one run land flat in `backup_dir` and share the run's
//! timestamp tag:
//!
//! ```text
//! mysql_shop_20261018_142501.sql.gz
//! postgres_billing_20261018_142501.dump
//! config_20261018_142501.tar.gz
//! checksums_20261018_142501.sha256
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::command_executor::CommandSpec;
use crate::config::DatabaseConfig;
use crate::context::Context;
use crate::error::{ExecutionError, StepFailure};
use crate::procedure::Procedure;
use crate::step::{Outcome, Step};

use super::command;

pub struct Backup;

impl Procedure for Backup {
    fn name(&self) -> &'static str {
        "backup"
    }

    fn description(&self) -> &'static str {
        "Dump databases, archive configuration and prune old backups"
    }

    fn resource(&self) -> Option<&'static str> {
        Some("database-backup")
    }

    fn steps(&self) -> Vec<Step> {
        vec![
            Step::critical("ensure-backup-dir", ensure_backup_dir)
                .describe("Create the backup directory"),
            Step::optional("mysql-dump", mysql_dump).describe("Dump configured MySQL databases"),
            Step::optional("postgres-dump", postgres_dump)
                .describe("Dump configured PostgreSQL databases"),
            Step::optional("archive-config", archive_config)
                .describe("Archive configuration directories"),
            Step::optional("write-checksums", write_checksums)
                .describe("Record SHA-256 checksums of this run's files"),
            Step::optional("prune-old-backups", prune_old_backups)
                .describe("Delete backups older than the retention period"),
        ]
    }
}

fn ensure_backup_dir(ctx: &Context) -> Result<Outcome, StepFailure> {
    let dir = &ctx.config().backup_dir;
    ctx.exec_checked(&command("mkdir", &["-p"]).arg(dir.to_string_lossy()))?;
    if !ctx.is_dry_run() {
        let probe = dir.join(".hostops-write-test");
        fs::write(&probe, b"")?;
        fs::remove_file(&probe)?;
    }
    Ok(Outcome::success(format!("{} is writable", dir.display())))
}

/// One engine's dump command for one database
struct DumpJob {
    engine: &'static str,
    database: String,
    spec: CommandSpec,
    /// Compress the output file with gzip after dumping
    gzip: Option<PathBuf>,
}

fn password_env(db: &DatabaseConfig, var: &str, spec: CommandSpec) -> CommandSpec {
    match db.password_env.as_deref().map(std::env::var) {
        Some(Ok(password)) => spec.env(var, password),
        Some(Err(_)) => {
            warn!(
                "Password variable {:?} is not set; dumping without a password",
                db.password_env
            );
            spec
        }
        None => spec,
    }
}

fn mysql_jobs(ctx: &Context) -> Vec<DumpJob> {
    let db = &ctx.config().mysql;
    let dir = &ctx.config().backup_dir;
    db.databases
        .iter()
        .map(|name| {
            let file = dir.join(format!("mysql_{}_{}.sql", name, ctx.timestamp_tag()));
            let mut spec = CommandSpec::new("mysqldump")
                .args(["--single-transaction", "--routines", "--triggers"]);
            if let Some(user) = &db.user {
                spec = spec.arg(format!("--user={user}"));
            }
            spec = spec
                .arg(format!("--result-file={}", file.display()))
                .arg(name.as_str());
            DumpJob {
                engine: "mysqldump",
                database: name.clone(),
                spec: password_env(db, "MYSQL_PWD", spec),
                gzip: Some(file),
            }
        })
        .collect()
}

fn postgres_jobs(ctx: &Context) -> Vec<DumpJob> {
    let db = &ctx.config().postgres;
    let dir = &ctx.config().backup_dir;
    db.databases
        .iter()
        .map(|name| {
            let file = dir.join(format!("postgres_{}_{}.dump", name, ctx.timestamp_tag()));
            let mut spec = CommandSpec::new("pg_dump").arg("--format=custom");
            if let Some(user) = &db.user {
                spec = spec.arg(format!("--username={user}"));
            }
            spec = spec
                .arg("--no-password")
                .arg(format!("--file={}", file.display()))
                .arg(name.as_str());
            DumpJob {
                engine: "pg_dump",
                database: name.clone(),
                spec: password_env(db, "PGPASSWORD", spec),
                gzip: None,
            }
        })
        .collect()
}

/// Run every job; one database failing does not stop the others
fn run_dumps(ctx: &Context, label: &str, jobs: Vec<DumpJob>) -> Result<Outcome, StepFailure> {
    if jobs.is_empty() {
        return Ok(Outcome::skipped(format!("no {label} databases configured")));
    }

    let total = jobs.len();
    let mut failed = Vec::new();
    for job in jobs {
        match ctx.exec(&job.spec) {
            Err(ExecutionError::NotFound { program }) => {
                return Ok(Outcome::skipped(format!("{program} not installed")));
            }
            Err(e) => {
                warn!("{} dump of {} failed: {}", label, job.database, e);
                failed.push(job.database);
                continue;
            }
            Ok(output) if !output.success() => {
                warn!(
                    "{} exited with {:?} for {}: {}",
                    job.engine,
                    output.exit_code,
                    job.database,
                    output.stderr.trim()
                );
                failed.push(job.database);
                continue;
            }
            Ok(_) => {}
        }

        if let Some(file) = &job.gzip {
            let gzip = CommandSpec::new("gzip").arg("-f").arg(file.to_string_lossy());
            if let Err(e) = ctx.exec_checked(&gzip) {
                warn!("Compressing {} failed: {}", file.display(), e);
                failed.push(job.database);
            }
        }
    }

    if failed.is_empty() {
        Ok(Outcome::success(format!("{total} {label} database(s) dumped")))
    } else {
        Err(StepFailure::invalid(format!(
            "{} of {} {} dump(s) failed: {}",
            failed.len(),
            total,
            label,
            failed.join(", ")
        )))
    }
}

fn mysql_dump(ctx: &Context) -> Result<Outcome, StepFailure> {
    run_dumps(ctx, "MySQL", mysql_jobs(ctx))
}

fn postgres_dump(ctx: &Context) -> Result<Outcome, StepFailure> {
    run_dumps(ctx, "PostgreSQL", postgres_jobs(ctx))
}

fn archive_config(ctx: &Context) -> Result<Outcome, StepFailure> {
    let config = ctx.config();
    if config.config_paths.is_empty() {
        return Ok(Outcome::skipped("no configuration paths configured"));
    }

    let archive = config
        .backup_dir
        .join(format!("config_{}.tar.gz", ctx.timestamp_tag()));
    let spec = CommandSpec::new("tar")
        .arg("-czf")
        .arg(archive.to_string_lossy())
        .args(config.config_paths.iter().map(|p| p.to_string_lossy()));
    let output = ctx.exec(&spec)?;
    // GNU tar exits 1 when files changed while being read; the archive is usable
    if output.exit_code == Some(1) {
        warn!("tar reported changed files: {}", output.stderr.trim());
        return Ok(Outcome::success(format!(
            "{} (some files changed during archiving)",
            archive.display()
        )));
    }
    output.ensure_success("tar")?;
    Ok(Outcome::success(archive.display().to_string()))
}

/// Files in `dir` produced by the run tagged `tag`, sorted by name
pub fn run_artifacts(dir: &Path, tag: &str) -> std::io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.contains(&format!("_{tag}.")) && !name.ends_with(".sha256") {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

fn write_checksums(ctx: &Context) -> Result<Outcome, StepFailure> {
    if ctx.is_dry_run() {
        return Ok(Outcome::skipped("dry run: no backup files written"));
    }

    let dir = &ctx.config().backup_dir;
    let files = run_artifacts(dir, &ctx.timestamp_tag())?;
    if files.is_empty() {
        return Ok(Outcome::skipped("no backup files produced by this run"));
    }

    // Relative names so the file can be verified with `sha256sum -c` in place
    let spec = CommandSpec::new("sha256sum")
        .args(files.iter().map(String::as_str))
        .current_dir(dir)
        .read_only();
    let output = ctx.exec_checked(&spec)?;

    let path = dir.join(format!("checksums_{}.sha256", ctx.timestamp_tag()));
    fs::write(&path, &output.stdout)?;
    Ok(Outcome::success(format!(
        "{} file(s) listed in {}",
        files.len(),
        path.display()
    )))
}

fn prune_old_backups(ctx: &Context) -> Result<Outcome, StepFailure> {
    let config = ctx.config();
    let spec = CommandSpec::new("find")
        .arg(config.backup_dir.to_string_lossy())
        .args(["-maxdepth", "1", "-type", "f", "-mtime"])
        .arg(format!("+{}", config.retention_days))
        .args(["-print", "-delete"]);
    let output = ctx.exec_checked(&spec)?;
    if output.dry_run {
        return Ok(Outcome::success("dry run: nothing deleted"));
    }
    let removed = output.stdout.lines().filter(|l| !l.trim().is_empty()).count();
    Ok(Outcome::success(format!(
        "{} file(s) older than {} days removed",
        removed, config.retention_days
    )))
}
