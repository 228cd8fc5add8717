//! Launches the supervised workload as a child process.
//!
//! The child environment layers sandbox-provided variables over the
//! inherited environment, and both child stdio streams attach to the
//! supervisor's stderr so workload output lands in the daemon log.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};

use nix::unistd::Pid;
use thiserror::Error;
use tracing::info;

use crate::sandbox::{SandboxEnv, SandboxError};

const LAUNCH_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::launch");

/// Live handle to the supervised child process.
#[derive(Debug)]
pub struct Workload {
    child: Child,
    pid: Pid,
}

impl Workload {
    /// Identity of the child process.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub(crate) fn into_child(self) -> Child {
        self.child
    }
}

/// Starts the workload described by the operator argv.
///
/// The first element is the program, the rest its arguments; an empty argv
/// is a usage error. Sandbox variables override inherited ones for
/// overlapping keys.
pub fn launch(argv: &[OsString], sandbox: &dyn SandboxEnv) -> Result<Workload, LaunchError> {
    let (program, arguments) = argv.split_first().ok_or(LaunchError::MissingWorkload)?;
    let variables = sandbox.variables()?;

    let mut command = Command::new(program);
    command.args(arguments);
    command.envs(variables);
    command.stdout(io::stderr());
    command.stderr(io::stderr());

    let child = command.spawn().map_err(|source| LaunchError::Spawn {
        program: PathBuf::from(program),
        source,
    })?;
    let pid = Pid::from_raw(child.id() as i32);
    info!(
        target: LAUNCH_TARGET,
        program = %Path::new(program).display(),
        pid = pid.as_raw(),
        "workload launched"
    );
    Ok(Workload { child, pid })
}

/// Errors raised while launching the workload.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// No workload command was supplied after the verb.
    #[error("no workload command supplied")]
    MissingWorkload,
    /// The sandbox environment could not be collected.
    #[error("failed to collect sandbox environment: {source}")]
    Sandbox {
        /// Underlying sandbox error.
        #[source]
        source: SandboxError,
    },
    /// The workload could not be started.
    #[error("failed to start workload '{}': {source}", program.display())]
    Spawn {
        /// Program that could not be started.
        program: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}

impl From<SandboxError> for LaunchError {
    fn from(source: SandboxError) -> Self {
        Self::Sandbox { source }
    }
}
