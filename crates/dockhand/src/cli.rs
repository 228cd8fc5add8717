//! Command-line surface of the dockhand control agent.

use std::ffi::OsString;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Top-level argument tree.
#[derive(Parser, Debug)]
#[command(name = "dockhand", disable_help_subcommand = true)]
pub(crate) struct Cli {
    /// Structured subcommands (for example `daemon start`).
    #[command(subcommand)]
    pub(crate) command: CliCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum CliCommand {
    /// Supervises a workload as a background daemon.
    Daemon(DaemonArgs),
}

/// Flags and verb of the `daemon` command group.
#[derive(Args, Debug)]
pub(crate) struct DaemonArgs {
    /// Identity (pid) file path; derived from the runtime directory when
    /// unset.
    #[arg(long, value_name = "PATH")]
    pub(crate) pid_file: Option<PathBuf>,
    /// Log file receiving daemon and workload output; the null device when
    /// unset.
    #[arg(long, value_name = "PATH")]
    pub(crate) log_file: Option<PathBuf>,
    /// Working directory for the detached daemon; the invoking directory
    /// when unset.
    #[arg(long, value_name = "DIR")]
    pub(crate) work_dir: Option<PathBuf>,
    /// Directory holding one file per sandbox environment variable.
    #[arg(long, value_name = "DIR")]
    pub(crate) env_dir: Option<PathBuf>,
    /// Seconds between the graceful-stop request and the forced kill.
    #[arg(long, value_name = "SECONDS", default_value_t = 30)]
    pub(crate) grace: u64,
    /// Lifecycle verb to run.
    #[arg(value_enum, value_name = "VERB")]
    pub(crate) verb: DaemonVerb,
    /// Workload command and arguments; required by `start`, accepted (and
    /// ignored) by the other verbs so a start command line can be replayed
    /// with the verb swapped.
    #[arg(
        value_name = "WORKLOAD",
        num_args = 0..,
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub(crate) workload: Vec<OsString>,
}

/// Lifecycle verbs of the daemon command group.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DaemonVerb {
    /// Reports whether the daemon is running.
    Status,
    /// Starts the daemon supervising the workload.
    Start,
    /// Requests a graceful stop and waits (best effort) for it.
    Stop,
    /// Requests a configuration reload.
    Reload,
}

#[cfg(test)]
mod tests {
    use super::*;

    use rstest::rstest;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).expect("arguments should parse")
    }

    #[rstest]
    #[case::status("status", DaemonVerb::Status)]
    #[case::start("start", DaemonVerb::Start)]
    #[case::stop("stop", DaemonVerb::Stop)]
    #[case::reload("reload", DaemonVerb::Reload)]
    fn parses_each_verb(#[case] verb: &str, #[case] expected: DaemonVerb) {
        let CliCommand::Daemon(daemon) = parse(&["dockhand", "daemon", verb]).command;
        assert_eq!(daemon.verb, expected);
        assert!(daemon.workload.is_empty());
    }

    #[test]
    fn captures_workload_including_hyphen_values() {
        let CliCommand::Daemon(daemon) = parse(&[
            "dockhand", "daemon", "start", "my-server", "--port", "8080",
        ])
        .command;
        assert_eq!(daemon.verb, DaemonVerb::Start);
        assert_eq!(
            daemon.workload,
            vec![
                OsString::from("my-server"),
                OsString::from("--port"),
                OsString::from("8080"),
            ]
        );
    }

    #[test]
    fn accepts_flags_before_the_verb() {
        let CliCommand::Daemon(daemon) = parse(&[
            "dockhand",
            "daemon",
            "--pid-file",
            "/run/dockhand.pid",
            "--log-file",
            "/var/log/dockhand.log",
            "--grace",
            "5",
            "start",
            "sleep",
            "30",
        ])
        .command;
        assert_eq!(daemon.pid_file, Some(PathBuf::from("/run/dockhand.pid")));
        assert_eq!(daemon.log_file, Some(PathBuf::from("/var/log/dockhand.log")));
        assert_eq!(daemon.grace, 5);
        assert_eq!(daemon.verb, DaemonVerb::Start);
    }

    #[test]
    fn grace_defaults_to_thirty_seconds() {
        let CliCommand::Daemon(daemon) = parse(&["dockhand", "daemon", "status"]).command;
        assert_eq!(daemon.grace, 30);
    }

    #[test]
    fn rejects_unknown_verbs() {
        let error = Cli::try_parse_from(["dockhand", "daemon", "restart"])
            .expect_err("unknown verb should fail");
        assert!(error.use_stderr());
    }

    #[test]
    fn rejects_a_missing_verb() {
        Cli::try_parse_from(["dockhand", "daemon"]).expect_err("missing verb should fail");
    }
}
