//! Command-line runtime of the dockhand control agent.
//!
//! The runtime owns argument parsing and verb dispatch; it is designed to be
//! exercised both from the binary entrypoint and from tests where the IO
//! streams and the detach backend can be substituted.

use std::ffi::OsString;
use std::io::Write;
use std::process::ExitCode;

use clap::Parser;
use thiserror::Error;

use dockhand_supervisor::{Detach, SystemDetach};

mod cli;
mod dispatch;
pub mod telemetry;

use cli::{Cli, CliCommand};
use dispatch::{DispatchError, DispatchOutput, dispatch};

/// Runs the CLI using the provided arguments and IO handles.
#[must_use]
pub fn run<I, W, E>(args: I, stdout: &mut W, stderr: &mut E) -> ExitCode
where
    I: IntoIterator<Item = OsString>,
    W: Write,
    E: Write,
{
    run_with_detach(args, stdout, stderr, &SystemDetach::new())
}

/// Runs the CLI with a substituted detach backend.
fn run_with_detach<I, W, E>(
    args: I,
    stdout: &mut W,
    stderr: &mut E,
    detach: &dyn Detach,
) -> ExitCode
where
    I: IntoIterator<Item = OsString>,
    W: Write,
    E: Write,
{
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => return render_usage(&error, stdout, stderr),
    };

    let CliCommand::Daemon(daemon) = cli.command;
    let mut output = DispatchOutput::new(&mut *stdout);
    match dispatch(daemon, detach, &mut output) {
        Ok(code) => code,
        Err(error) => {
            let _ = writeln!(stderr, "{}", AppError::from(error));
            ExitCode::FAILURE
        }
    }
}

/// Renders a clap outcome: help and version land on stdout and succeed,
/// genuine usage errors land on stderr and fail.
fn render_usage<W: Write, E: Write>(error: &clap::Error, stdout: &mut W, stderr: &mut E) -> ExitCode {
    if error.use_stderr() {
        let _ = write!(stderr, "{}", error.render());
        ExitCode::FAILURE
    } else {
        let _ = write!(stdout, "{}", error.render());
        ExitCode::SUCCESS
    }
}

#[derive(Debug, Error)]
enum AppError {
    #[error("daemon command failed: {0}")]
    Dispatch(#[from] DispatchError),
}
