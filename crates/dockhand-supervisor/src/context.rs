//! Derives the paths and modes governing one daemon invocation.
//!
//! The lifecycle verbs and the detached daemon need to agree on where the
//! identity file lives and where workload output lands, so the context is
//! resolved once from the operator's flags and threaded through both sides.

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[cfg(unix)]
use dirs::runtime_dir;
#[cfg(unix)]
use nix::unistd::geteuid;

/// Mode applied to the identity file.
pub(crate) const IDENTITY_MODE: u32 = 0o644;
/// Mode applied to a log sink created by the daemon.
pub(crate) const LOG_MODE: u32 = 0o640;

const IDENTITY_FILE: &str = "dockhand.pid";

/// Operator-supplied overrides for a daemon invocation.
#[derive(Debug, Default, Clone)]
pub struct ContextOptions {
    /// Identity (pid) file path; derived from the runtime directory when unset.
    pub identity_path: Option<PathBuf>,
    /// Log sink path; the null device when unset.
    pub log_path: Option<PathBuf>,
    /// Working directory for the detached daemon; the invoking directory when
    /// unset.
    pub work_dir: Option<PathBuf>,
    /// Directory holding one file per sandbox environment variable.
    pub env_dir: Option<PathBuf>,
}

/// Resolved configuration shared by the lifecycle verbs and the daemon.
#[derive(Debug, Clone)]
pub struct DaemonContext {
    identity_path: PathBuf,
    log_path: Option<PathBuf>,
    work_dir: PathBuf,
    env_dir: Option<PathBuf>,
}

impl DaemonContext {
    /// Resolves a context from operator overrides, deriving defaults for
    /// whatever was left unset.
    ///
    /// The default identity file lives under a `dockhand` runtime directory,
    /// which is created here so later writes cannot race against a missing
    /// parent. Operator-supplied paths are used verbatim.
    pub fn resolve(options: ContextOptions) -> Result<Self, ContextError> {
        let identity_path = match options.identity_path {
            Some(path) => path,
            None => default_identity_path()?,
        };
        let work_dir = match options.work_dir {
            Some(dir) => dir,
            None => {
                env::current_dir().map_err(|source| ContextError::WorkingDirectory { source })?
            }
        };
        Ok(Self {
            identity_path,
            log_path: options.log_path,
            work_dir,
            env_dir: options.env_dir,
        })
    }

    /// Path of the identity file recording the daemon pid.
    pub fn identity_path(&self) -> &Path {
        self.identity_path.as_path()
    }

    /// Log sink receiving daemon and workload output, when configured.
    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    /// Working directory the daemon detaches into.
    pub fn work_dir(&self) -> &Path {
        self.work_dir.as_path()
    }

    /// Sandbox environment directory, when configured.
    pub fn env_dir(&self) -> Option<&Path> {
        self.env_dir.as_deref()
    }
}

fn default_identity_path() -> Result<PathBuf, ContextError> {
    let dir = default_runtime_directory();
    fs::create_dir_all(&dir).map_err(|source| ContextError::RuntimeDirectory {
        path: dir.clone(),
        source,
    })?;
    Ok(dir.join(IDENTITY_FILE))
}

fn default_runtime_directory() -> PathBuf {
    #[cfg(unix)]
    {
        if let Some(mut dir) = runtime_dir() {
            dir.push("dockhand");
            return dir;
        }
        let mut dir = env::temp_dir();
        dir.push("dockhand");
        dir.push(format!("uid-{}", geteuid()));
        dir
    }

    #[cfg(not(unix))]
    {
        let mut dir = env::temp_dir();
        dir.push("dockhand");
        dir
    }
}

/// Errors raised while resolving the daemon context.
#[derive(Debug, Error)]
pub enum ContextError {
    /// The default runtime directory could not be created.
    #[error("failed to prepare runtime directory '{path}': {source}")]
    RuntimeDirectory {
        /// Directory that could not be created.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The invoking directory could not be determined.
    #[error("failed to resolve working directory: {source}")]
    WorkingDirectory {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}
