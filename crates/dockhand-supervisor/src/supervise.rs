//! Coordinates the supervised workload with inbound control intents.
//!
//! One `Supervisor` instance per invocation owns the event channel pair:
//! a wait thread reports the child's exit exactly once, the control listener
//! feeds intents through a [`ControlHandle`], and the coordinating loop
//! selects over the merged stream. The loop produces exactly one verdict;
//! once it has, no further intent is processed.

use std::io;
use std::process::ExitStatus;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::control::ControlIntent;
use crate::launch::Workload;
use crate::outcome::{self, SupervisorExit};

const SUPERVISE_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::supervise");

/// Default grace window between the graceful-stop request and the forced
/// kill.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(30);

/// How long to wait for the wait thread to report after a forced kill.
const KILL_REAP_WINDOW: Duration = Duration::from_secs(5);

enum Event {
    Exited(io::Result<ExitStatus>),
    Control(ControlIntent),
}

/// Sender half handed to control-intent sources.
///
/// Clones share the supervisor's event channel; delivery fails once the
/// supervision loop has produced its verdict.
#[derive(Clone)]
pub struct ControlHandle {
    sender: Sender<Event>,
}

impl ControlHandle {
    /// Queues `intent` for the supervision loop.
    pub fn send(&self, intent: ControlIntent) -> Result<(), SupervisorGone> {
        self.sender
            .send(Event::Control(intent))
            .map_err(|_| SupervisorGone)
    }
}

/// The supervision loop has finished and no longer accepts intents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorGone;

impl std::fmt::Display for SupervisorGone {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str("supervisor no longer accepts control intents")
    }
}

impl std::error::Error for SupervisorGone {}

/// Event loop coordinating one supervised workload.
///
/// The channels are owned fields rather than process-wide state, so
/// supervisors can coexist in tests with intents injected through
/// [`ControlHandle`].
pub struct Supervisor {
    sender: Sender<Event>,
    events: Receiver<Event>,
    grace: Duration,
    reload_hook: Box<dyn FnMut() + Send>,
}

impl Supervisor {
    /// Builds a supervisor with the default grace window and a log-only
    /// reload hook.
    pub fn new() -> Self {
        let (sender, events) = mpsc::channel();
        Self {
            sender,
            events,
            grace: DEFAULT_GRACE,
            reload_hook: Box::new(|| {
                info!(
                    target: SUPERVISE_TARGET,
                    "reload requested; no reload hook installed"
                );
            }),
        }
    }

    /// Overrides the grace window between the graceful-stop request and the
    /// forced kill.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Installs the hook invoked for each reload intent.
    ///
    /// The hook runs on the supervision loop; the workload is never touched
    /// by a reload.
    pub fn with_reload_hook(mut self, hook: impl FnMut() + Send + 'static) -> Self {
        self.reload_hook = Box::new(hook);
        self
    }

    /// Handle for feeding control intents into the loop.
    pub fn control_handle(&self) -> ControlHandle {
        ControlHandle {
            sender: self.sender.clone(),
        }
    }

    /// Runs the loop until the workload is gone, returning the verdict.
    ///
    /// The workload's exit is the normal termination path. A terminate
    /// intent forwards SIGTERM to the child and opens the single-shot grace
    /// window; expiry, or an undeliverable graceful stop, escalates to a
    /// forced kill. Reload intents invoke the hook and the loop continues;
    /// probe intents are accepted and ignored.
    pub fn supervise(mut self, workload: Workload) -> SupervisorExit {
        let pid = workload.pid();
        let wait_events = self.sender.clone();
        let mut child = workload.into_child();
        thread::spawn(move || {
            let result = child.wait();
            let _ = wait_events.send(Event::Exited(result));
        });

        loop {
            match self.events.recv() {
                Ok(Event::Exited(result)) => return outcome::translate(&result),
                Ok(Event::Control(ControlIntent::Terminate)) => return self.escalate(pid),
                Ok(Event::Control(ControlIntent::Reload)) => {
                    info!(target: SUPERVISE_TARGET, "reload intent accepted");
                    (self.reload_hook)();
                }
                Ok(Event::Control(ControlIntent::Probe)) => {}
                // Both producer threads are gone; nothing more can arrive.
                Err(_) => return SupervisorExit::Abnormal,
            }
        }
    }

    /// Forwards the graceful stop and waits out the grace window.
    ///
    /// The window is single-shot: it starts when SIGTERM is forwarded, and
    /// later terminate intents neither restart it nor shorten it.
    fn escalate(&mut self, pid: Pid) -> SupervisorExit {
        if let Err(errno) = kill(pid, Signal::SIGTERM) {
            warn!(
                target: SUPERVISE_TARGET,
                pid = pid.as_raw(),
                errno = %errno,
                "graceful stop undeliverable; force-killing"
            );
            return self.force_kill(pid);
        }
        info!(
            target: SUPERVISE_TARGET,
            pid = pid.as_raw(),
            grace_ms = self.grace.as_millis(),
            "graceful stop forwarded; grace window open"
        );

        let deadline = Instant::now() + self.grace;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return self.force_kill(pid);
            }
            match self.events.recv_timeout(remaining) {
                Ok(Event::Exited(result)) => return outcome::translate(&result),
                Ok(Event::Control(ControlIntent::Reload)) => {
                    info!(target: SUPERVISE_TARGET, "reload intent accepted");
                    (self.reload_hook)();
                }
                Ok(Event::Control(ControlIntent::Terminate | ControlIntent::Probe)) => {
                    debug!(
                        target: SUPERVISE_TARGET,
                        "control intent ignored during open grace window"
                    );
                }
                Err(RecvTimeoutError::Timeout) => return self.force_kill(pid),
                Err(RecvTimeoutError::Disconnected) => return self.force_kill(pid),
            }
        }
    }

    /// Kills the workload outright and collects whatever the wait thread
    /// reports.
    ///
    /// The child may have ended in the instant before the kill landed; the
    /// forced translation keeps a racing clean exit as the workload's own
    /// verdict.
    fn force_kill(&mut self, pid: Pid) -> SupervisorExit {
        warn!(
            target: SUPERVISE_TARGET,
            pid = pid.as_raw(),
            "force-killing workload"
        );
        if let Err(errno) = kill(pid, Signal::SIGKILL) {
            debug!(
                target: SUPERVISE_TARGET,
                pid = pid.as_raw(),
                errno = %errno,
                "kill delivery failed; workload already gone"
            );
        }

        let deadline = Instant::now() + KILL_REAP_WINDOW;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(
                    target: SUPERVISE_TARGET,
                    pid = pid.as_raw(),
                    "workload not reaped after forced kill"
                );
                return SupervisorExit::Forced;
            }
            match self.events.recv_timeout(remaining) {
                Ok(Event::Exited(result)) => return outcome::translate_forced(&result),
                Ok(Event::Control(_)) => {}
                Err(_) => return SupervisorExit::Forced,
            }
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}
