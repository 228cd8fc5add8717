//! Records, probes, and releases the daemon's process identity.
//!
//! The identity file is the only rendezvous between the detached daemon and
//! later `status`/`stop`/`reload` invocations. Writes are atomic so a
//! concurrent probe never observes a partially written pid; liveness is
//! decided by delivering the no-op probe signal.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use nix::sys::signal::kill;
use nix::unistd::Pid;
use tempfile::Builder;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::context::IDENTITY_MODE;

const IDENTITY_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::identity");

/// Reports whether the probe signal can be delivered to `pid`.
///
/// Delivery success means a live process. A nonexistent target and refused
/// delivery both read as not running: an identity this process cannot signal
/// is an identity it cannot manage.
pub fn alive(pid: Pid) -> bool {
    kill(pid, None).is_ok()
}

/// Probes the identity recorded at `path`.
///
/// Returns the recorded pid while that process is alive. A missing, empty,
/// or unparseable identity file, and a recorded pid the probe cannot reach,
/// all read as not running.
pub fn probe_recorded(path: &Path) -> Option<Pid> {
    let pid = read_recorded(path)?;
    alive(pid).then_some(pid)
}

/// Persists `pid` at `path` and returns the guard owning the recorded
/// identity.
///
/// The pid is written to a temporary file in the target directory, fsync'd,
/// and renamed into place.
pub fn record(path: &Path, pid: Pid) -> Result<IdentityGuard, IdentityError> {
    persist_atomic(path, pid).map_err(|source| IdentityError::Record {
        path: path.to_path_buf(),
        source,
    })?;
    info!(
        target: IDENTITY_TARGET,
        pid = pid.as_raw(),
        file = %path.display(),
        "identity recorded"
    );
    Ok(IdentityGuard {
        path: path.to_path_buf(),
        released: false,
    })
}

fn read_recorded(path: &Path) -> Option<Pid> {
    let content = fs::read_to_string(path).ok()?;
    let raw = content.trim().parse::<i32>().ok()?;
    (raw > 0).then(|| Pid::from_raw(raw))
}

fn persist_atomic(path: &Path, pid: Pid) -> io::Result<()> {
    let directory = path.parent().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            "identity path did not have a parent directory",
        )
    })?;

    let mut builder = Builder::new();
    builder.prefix(
        path.file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("dockhand"),
    );
    #[cfg(unix)]
    {
        use std::fs::Permissions;
        use std::os::unix::fs::PermissionsExt;
        builder.permissions(Permissions::from_mode(IDENTITY_MODE));
    }

    let mut file = builder.tempfile_in(directory)?;
    writeln!(file, "{pid}")?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|error| error.error)?;
    Ok(())
}

/// Owns a recorded identity file and removes it exactly once.
#[derive(Debug)]
pub struct IdentityGuard {
    path: PathBuf,
    released: bool,
}

impl IdentityGuard {
    /// Removes the identity file.
    ///
    /// Idempotent: repeated calls after a successful release return `Ok`,
    /// and a file already gone counts as released.
    pub fn release(&mut self) -> Result<(), IdentityError> {
        if self.released {
            return Ok(());
        }
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(IdentityError::Release {
                    path: self.path.clone(),
                    source,
                });
            }
        }
        self.released = true;
        debug!(
            target: IDENTITY_TARGET,
            file = %self.path.display(),
            "identity released"
        );
        Ok(())
    }

    /// Path of the recorded identity file.
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }
}

impl Drop for IdentityGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match fs::remove_file(&self.path) {
            Err(error) if error.kind() != io::ErrorKind::NotFound => {
                warn!(
                    target: IDENTITY_TARGET,
                    file = %self.path.display(),
                    error = %error,
                    "failed to remove identity file"
                );
            }
            _ => {}
        }
    }
}

/// Errors raised while recording or releasing a process identity.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// The identity file could not be written.
    #[error("failed to record identity at '{path}': {source}")]
    Record {
        /// Identity file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The identity file could not be removed.
    #[error("failed to release identity at '{path}': {source}")]
    Release {
        /// Identity file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}
