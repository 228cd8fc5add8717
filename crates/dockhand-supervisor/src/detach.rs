//! Implements the daemonisation backend for the dockhand daemon.
//!
//! Detaching returns twice: once in the original parent, which must exit
//! without running any workload, and once in the detached child, which owns
//! the recorded identity from here on. Callers branch on the outcome before
//! doing any side-effecting work.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use daemonize::{Daemonize, Outcome};
use nix::unistd::Pid;
use thiserror::Error;
use tracing::info;

use crate::context::{DaemonContext, LOG_MODE};
use crate::identity::{self, IdentityError, IdentityGuard};

const DETACH_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::detach");

/// Abstraction over daemonisation strategies.
pub trait Detach: Send + Sync {
    /// Detaches the process into the background.
    fn detach(&self, context: &DaemonContext) -> Result<DetachOutcome, DetachError>;
}

/// Which side of the detach this process is.
#[derive(Debug)]
pub enum DetachOutcome {
    /// The original process; the caller must return to the operator
    /// immediately.
    Parent,
    /// The detached daemon, owning its recorded identity.
    Child(IdentityGuard),
}

/// Detach backend driving the system daemoniser.
///
/// The child ends up session-detached with stdio redirected to the
/// configured log sink (the null device when none is configured), the
/// working directory changed, and its identity recorded at the configured
/// path.
#[derive(Debug, Default)]
pub struct SystemDetach;

impl SystemDetach {
    /// Builds a new system detach backend.
    pub fn new() -> Self {
        Self
    }
}

impl Detach for SystemDetach {
    fn detach(&self, context: &DaemonContext) -> Result<DetachOutcome, DetachError> {
        let mut daemon = Daemonize::new().working_directory(context.work_dir());
        if let Some(path) = context.log_path() {
            let sink = open_log_sink(path)?;
            let stdout_sink = sink.try_clone().map_err(|source| DetachError::LogSink {
                path: path.to_path_buf(),
                source,
            })?;
            daemon = daemon.stdout(stdout_sink).stderr(sink);
        }

        info!(
            target: DETACH_TARGET,
            work_dir = %context.work_dir().display(),
            "daemonising into background"
        );
        match daemon.execute() {
            Outcome::Parent(Ok(parent)) => {
                if parent.first_child_exit_code != 0 {
                    return Err(DetachError::Interstage {
                        code: parent.first_child_exit_code,
                    });
                }
                Ok(DetachOutcome::Parent)
            }
            Outcome::Parent(Err(source)) => Err(DetachError::System { source }),
            Outcome::Child(Ok(_)) => {
                let guard = identity::record(context.identity_path(), Pid::this())?;
                info!(
                    target: DETACH_TARGET,
                    "daemon process detached; continuing in child"
                );
                Ok(DetachOutcome::Child(guard))
            }
            Outcome::Child(Err(source)) => Err(DetachError::System { source }),
        }
    }
}

fn open_log_sink(path: &Path) -> Result<File, DetachError> {
    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(LOG_MODE);
    }
    options.open(path).map_err(|source| DetachError::LogSink {
        path: path.to_path_buf(),
        source,
    })
}

/// Errors surfaced by the daemonisation backend.
#[derive(Debug, Error)]
pub enum DetachError {
    /// The log sink could not be opened.
    #[error("failed to open log sink '{path}': {source}")]
    LogSink {
        /// Log sink path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// System-level daemonisation failed.
    #[error("failed to daemonise: {source}")]
    System {
        /// Underlying daemonisation error.
        #[source]
        source: daemonize::Error,
    },
    /// The intermediate fork exited abnormally before the final detach.
    #[error("daemonisation stage exited with code {code}")]
    Interstage {
        /// Exit code reported by the intermediate process.
        code: i32,
    },
    /// The detached child could not record its identity.
    #[error("failed to record daemon identity: {source}")]
    Identity {
        /// Underlying identity error.
        #[source]
        source: IdentityError,
    },
}

impl From<IdentityError> for DetachError {
    fn from(source: IdentityError) -> Self {
        Self::Identity { source }
    }
}
