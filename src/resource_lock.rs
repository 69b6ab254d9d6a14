//! Named-resource mutex between concurrent runs.
//!
//! Two operators running `backup` at the same time would race on the same
//! dump files, so procedures that touch a shared resource hold a lock file
//! `<lock_dir>/<resource>.lock` for the whole run. Exclusion comes from an
//! advisory `flock` on that file, which the kernel drops when the owner exits,
//! so a lock left behind by a crashed run is simply taken over. The file also
//! records the owner PID for operators. Dropping the guard removes the file.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tracing::{debug, warn};

use crate::error::{HostOpsError, PreconditionError, Result};

/// Attempts when the locked file turns out to have been unlinked by its
/// previous holder
const MAX_ATTEMPTS: usize = 3;

pub struct ResourceLock {
    resource: String,
    path: PathBuf,
    file: Flock<File>,
}

impl fmt::Debug for ResourceLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceLock")
            .field("resource", &self.resource)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl ResourceLock {
    /// Take the lock for `resource`, or fail with `ResourceBusy`
    pub fn acquire(lock_dir: &Path, resource: &str) -> Result<Self> {
        if resource.is_empty()
            || !resource
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(HostOpsError::usage(format!(
                "invalid resource name {resource:?}"
            )));
        }

        fs::create_dir_all(lock_dir)?;
        let path = lock_dir.join(format!("{resource}.lock"));
        let pid = std::process::id();

        for _ in 0..MAX_ATTEMPTS {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;
            let file = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(file) => file,
                Err((_, errno)) if errno == Errno::EWOULDBLOCK => {
                    debug!("Lock {:?} held by PID {:?}", path, read_owner(&path));
                    return Err(busy(resource));
                }
                Err((_, errno)) => return Err(std::io::Error::from(errno).into()),
            };

            // The previous holder unlinks the file before unlocking it
            if !is_same_file(&file, &path) {
                debug!("Lock {:?} was released and removed, retrying", path);
                continue;
            }

            if let Some(owner) = read_owner(&path) {
                if owner != pid {
                    warn!("Taking over lock {:?} left by PID {}", path, owner);
                }
            }
            let mut handle: &File = &file;
            handle.set_len(0)?;
            writeln!(handle, "{pid}")?;
            debug!("Acquired lock {:?}", path);
            return Ok(Self {
                resource: resource.to_string(),
                path,
                file,
            });
        }

        Err(busy(resource))
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ResourceLock {
    fn drop(&mut self) {
        // Unlink while still holding the flock; `file` unlocks after this
        if is_same_file(&self.file, &self.path) {
            if let Err(e) = fs::remove_file(&self.path) {
                warn!("Failed to remove lock file {:?}: {}", self.path, e);
            } else {
                debug!("Released lock {:?}", self.path);
            }
        }
    }
}

fn busy(resource: &str) -> HostOpsError {
    PreconditionError::ResourceBusy {
        resource: resource.to_string(),
    }
    .into()
}

fn read_owner(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Whether `path` still names the open `file`
fn is_same_file(file: &File, path: &Path) -> bool {
    match (file.metadata(), fs::metadata(path)) {
        (Ok(open), Ok(named)) => open.dev() == named.dev() && open.ino() == named.ino(),
        _ => false,
    }
}
