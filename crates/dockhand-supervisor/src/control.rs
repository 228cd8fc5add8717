//! Control intents exchanged between lifecycle commands and a running daemon.
//!
//! Outbound, an intent is delivered to the recorded identity as its signal
//! equivalent. Inbound, a listener thread translates raw signal deliveries
//! into intents on the supervisor's event channel.

use std::fmt;
use std::io;
use std::thread;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use signal_hook::consts::signal::{SIGHUP, SIGTERM};
use signal_hook::iterator::Signals;
use thiserror::Error;
use tracing::{debug, info};

use crate::supervise::ControlHandle;

const CONTROL_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::control");

/// Intents an external controller can deliver to a running daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlIntent {
    /// Graceful-stop request.
    Terminate,
    /// Configuration-refresh request, handled by the reload hook.
    Reload,
    /// Liveness check; causes no state change.
    Probe,
}

impl ControlIntent {
    /// Signal equivalent delivered for this intent. The probe intent maps to
    /// the no-op probe delivery.
    fn as_signal(self) -> Option<Signal> {
        match self {
            Self::Terminate => Some(Signal::SIGTERM),
            Self::Reload => Some(Signal::SIGHUP),
            Self::Probe => None,
        }
    }
}

impl fmt::Display for ControlIntent {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Terminate => formatter.write_str("terminate"),
            Self::Reload => formatter.write_str("reload"),
            Self::Probe => formatter.write_str("probe"),
        }
    }
}

/// Delivers `intent` to the daemon recorded as `pid`.
pub fn deliver(pid: Pid, intent: ControlIntent) -> Result<(), ControlError> {
    kill(pid, intent.as_signal()).map_err(|source| ControlError::Deliver {
        pid,
        intent,
        source,
    })?;
    debug!(
        target: CONTROL_TARGET,
        pid = pid.as_raw(),
        intent = %intent,
        "control intent delivered"
    );
    Ok(())
}

fn intent_for(signal: i32) -> Option<ControlIntent> {
    match signal {
        SIGTERM => Some(ControlIntent::Terminate),
        SIGHUP => Some(ControlIntent::Reload),
        _ => None,
    }
}

/// Spawns the listener translating inbound control signals into intents on
/// the supervisor's event channel.
///
/// The thread runs until the process exits or the supervisor stops accepting
/// events because its loop has produced an exit value.
pub fn listen(handle: ControlHandle) -> Result<(), ControlError> {
    let mut signals =
        Signals::new([SIGTERM, SIGHUP]).map_err(|source| ControlError::Install { source })?;
    thread::spawn(move || {
        for signal in signals.forever() {
            let Some(intent) = intent_for(signal) else {
                continue;
            };
            info!(
                target: CONTROL_TARGET,
                signal,
                intent = %intent,
                "control signal received"
            );
            if handle.send(intent).is_err() {
                break;
            }
        }
    });
    Ok(())
}

/// Errors raised on the control path.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Installing the inbound signal listener failed.
    #[error("failed to install control signal listener: {source}")]
    Install {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Delivering an intent to the recorded identity failed.
    #[error("failed to deliver {intent} intent to pid {pid}: {source}")]
    Deliver {
        /// Target process.
        pid: Pid,
        /// Intent that could not be delivered.
        intent: ControlIntent,
        /// Underlying errno.
        #[source]
        source: Errno,
    },
}
