//! Binary entrypoint for the dockhand control agent.
//!
//! The binary installs telemetry and delegates to [`dockhand::run`], which
//! parses the command line and drives the daemon lifecycle verbs.

use std::io::{self, Write};
use std::process::ExitCode;

fn main() -> ExitCode {
    // The stream handles lock per write: the daemon's signal listener logs
    // through stderr, so a lock held across the supervision loop would park
    // it behind the coordinator.
    let mut stdout = io::stdout();
    let mut stderr = io::stderr();
    if let Err(error) = dockhand::telemetry::initialise() {
        let _ = writeln!(stderr, "{error}");
        return ExitCode::FAILURE;
    }
    dockhand::run(std::env::args_os(), &mut stdout, &mut stderr)
}
