//! Translates child wait results into the supervisor's own verdict.
//!
//! The mapping is total: every reachable wait outcome maps to exactly one
//! verdict. Signal identities are logged, never encoded in the exit code.

use std::io;
use std::process::ExitStatus;

use nix::sys::signal::Signal;
use tracing::{info, warn};

const OUTCOME_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::outcome");

/// Out-of-band status reported for abnormal and forced terminations.
///
/// A Unix parent observes it as 255.
pub const ABNORMAL_EXIT: i32 = -1;

/// Final verdict of one supervision run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    /// The workload exited on its own with this code.
    Workload(i32),
    /// The workload died abnormally: signal death, a stop, or an unreadable
    /// wait outcome.
    Abnormal,
    /// The supervisor force-killed the workload.
    Forced,
}

impl SupervisorExit {
    /// Process exit code encoding this verdict.
    pub fn code(self) -> i32 {
        match self {
            Self::Workload(code) => code,
            Self::Abnormal | Self::Forced => ABNORMAL_EXIT,
        }
    }
}

/// Translates the child wait result into the supervisor's verdict.
pub(crate) fn translate(result: &io::Result<ExitStatus>) -> SupervisorExit {
    match result {
        Ok(status) => translate_status(*status),
        Err(error) => {
            warn!(target: OUTCOME_TARGET, error = %error, "workload wait failed");
            SupervisorExit::Abnormal
        }
    }
}

/// Translates a wait result collected after a forced kill.
///
/// Death from the kill signal itself reports as forced; anything else is the
/// workload's own outcome, translated normally, because the child may have
/// ended in the instant before the kill landed.
pub(crate) fn translate_forced(result: &io::Result<ExitStatus>) -> SupervisorExit {
    match result {
        Ok(status) if died_from_kill(*status) => {
            info!(target: OUTCOME_TARGET, "workload force-killed");
            SupervisorExit::Forced
        }
        Ok(status) => translate_status(*status),
        Err(error) => {
            warn!(
                target: OUTCOME_TARGET,
                error = %error,
                "workload wait failed after forced kill"
            );
            SupervisorExit::Forced
        }
    }
}

fn translate_status(status: ExitStatus) -> SupervisorExit {
    if let Some(code) = status.code() {
        info!(target: OUTCOME_TARGET, code, "workload exited");
        return SupervisorExit::Workload(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            info!(target: OUTCOME_TARGET, signal, "workload died from signal");
            return SupervisorExit::Abnormal;
        }
        if let Some(signal) = status.stopped_signal() {
            info!(target: OUTCOME_TARGET, signal, "workload stopped");
            return SupervisorExit::Abnormal;
        }
    }
    warn!(
        target: OUTCOME_TARGET,
        status = %status,
        "workload ended with unreadable status"
    );
    SupervisorExit::Abnormal
}

#[cfg(unix)]
fn died_from_kill(status: ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal() == Some(Signal::SIGKILL as i32)
}

#[cfg(not(unix))]
fn died_from_kill(_status: ExitStatus) -> bool {
    false
}
