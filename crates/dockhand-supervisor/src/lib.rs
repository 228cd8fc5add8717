//! Process supervision library for the dockhand control agent.
//!
//! The crate turns an ordinary foreground command into a supervised
//! background service: it detaches the daemon, records its process identity,
//! launches the workload with the sandbox environment layered in, and runs
//! the event loop that translates child exits and control signals into one
//! final verdict.
//!
//! The collaborator seams ([`Detach`], [`SandboxEnv`], [`ControlHandle`])
//! are traits and owned channels rather than process-wide state, so the
//! daemon entry point stays testable without forking or real signals.

mod context;
mod control;
mod detach;
mod identity;
mod launch;
mod outcome;
mod sandbox;
mod supervise;

pub use context::{ContextError, ContextOptions, DaemonContext};
pub use control::{ControlError, ControlIntent, deliver, listen};
pub use detach::{Detach, DetachError, DetachOutcome, SystemDetach};
pub use identity::{IdentityError, IdentityGuard, alive, probe_recorded, record};
pub use launch::{LaunchError, Workload, launch};
pub use outcome::{ABNORMAL_EXIT, SupervisorExit};
pub use sandbox::{DirSandboxEnv, NullSandboxEnv, SandboxEnv, SandboxError};
pub use supervise::{ControlHandle, DEFAULT_GRACE, Supervisor, SupervisorGone};
