//! Maps lifecycle verbs onto the supervisor library.
//!
//! One invocation resolves the daemon context, probes the recorded identity
//! once, and drives the verb from there: `status` reports liveness, `start`
//! detaches into the supervision loop, `stop` signals and polls with
//! backoff, `reload` signals and returns.

use std::fmt;
use std::io::{self, Write};
use std::path::Path;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use dockhand_supervisor::{
    ContextError, ContextOptions, ControlError, ControlIntent, DaemonContext, Detach, DetachError,
    DetachOutcome, DirSandboxEnv, LaunchError, NullSandboxEnv, SandboxEnv, Supervisor,
    SupervisorExit, deliver, launch, listen, probe_recorded,
};

use crate::cli::{DaemonArgs, DaemonVerb};

const DISPATCH_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::dispatch");

/// First interval of the stop-polling backoff sequence.
const POLL_INITIAL: Duration = Duration::from_millis(100);
/// Total wait budget for the stop-polling loop.
const POLL_CEILING: Duration = Duration::from_secs(10);

/// Output handle abstracting over the operator-facing stdout writer.
///
/// Errors render through the runtime's stderr; verb handlers only ever
/// report progress lines.
pub(crate) struct DispatchOutput<W: Write> {
    stdout: W,
}

impl<W: Write> DispatchOutput<W> {
    pub(crate) fn new(stdout: W) -> Self {
        Self { stdout }
    }

    fn stdout_line(&mut self, args: fmt::Arguments<'_>) -> Result<(), DispatchError> {
        self.stdout.write_fmt(args).map_err(DispatchError::Output)?;
        self.stdout.write_all(b"\n").map_err(DispatchError::Output)?;
        self.stdout.flush().map_err(DispatchError::Output)
    }
}

/// Runs one daemon verb to completion.
pub(crate) fn dispatch<W: Write>(
    args: DaemonArgs,
    detach: &dyn Detach,
    output: &mut DispatchOutput<W>,
) -> Result<ExitCode, DispatchError> {
    let context = DaemonContext::resolve(ContextOptions {
        identity_path: args.pid_file,
        log_path: args.log_file,
        work_dir: args.work_dir,
        env_dir: args.env_dir,
    })?;
    let grace = Duration::from_secs(args.grace);

    match args.verb {
        DaemonVerb::Status => status(&context, output),
        DaemonVerb::Start => start(&context, &args.workload, grace, detach, output),
        DaemonVerb::Stop => stop(&context, output),
        DaemonVerb::Reload => reload(&context, output),
    }
}

fn status<W: Write>(
    context: &DaemonContext,
    output: &mut DispatchOutput<W>,
) -> Result<ExitCode, DispatchError> {
    match probe_recorded(context.identity_path()) {
        Some(pid) => {
            output.stdout_line(format_args!("daemon running (pid {pid})"))?;
            Ok(ExitCode::SUCCESS)
        }
        None => {
            output.stdout_line(format_args!("daemon not running"))?;
            Ok(ExitCode::from(1))
        }
    }
}

fn start<W: Write>(
    context: &DaemonContext,
    workload: &[std::ffi::OsString],
    grace: Duration,
    detach: &dyn Detach,
    output: &mut DispatchOutput<W>,
) -> Result<ExitCode, DispatchError> {
    if let Some(pid) = probe_recorded(context.identity_path()) {
        output.stdout_line(format_args!("daemon already running (pid {pid})"))?;
        return Ok(ExitCode::SUCCESS);
    }
    if workload.is_empty() {
        return Err(DispatchError::MissingWorkload);
    }

    match detach.detach(context)? {
        DetachOutcome::Parent => {
            output.stdout_line(format_args!(
                "daemon started; identity at {}",
                context.identity_path().display()
            ))?;
            Ok(ExitCode::SUCCESS)
        }
        DetachOutcome::Child(mut guard) => {
            // From here on stdout is gone; the log carries the narrative.
            info!(target: DISPATCH_TARGET, "daemon started");
            let sandbox: Box<dyn SandboxEnv> = match context.env_dir() {
                Some(dir) => Box::new(DirSandboxEnv::new(dir)),
                None => Box::new(NullSandboxEnv::new()),
            };
            let child = launch(workload, sandbox.as_ref())?;

            let supervisor = Supervisor::new().with_grace(grace);
            listen(supervisor.control_handle())?;
            let exit = supervisor.supervise(child);

            if let Err(error) = guard.release() {
                warn!(
                    target: DISPATCH_TARGET,
                    error = %error,
                    "identity release failed"
                );
            }
            info!(target: DISPATCH_TARGET, code = exit.code(), "daemon exiting");
            Ok(verdict_exit_code(exit))
        }
    }
}

fn stop<W: Write>(
    context: &DaemonContext,
    output: &mut DispatchOutput<W>,
) -> Result<ExitCode, DispatchError> {
    stop_with_budget(context, output, POLL_INITIAL, POLL_CEILING)
}

fn stop_with_budget<W: Write>(
    context: &DaemonContext,
    output: &mut DispatchOutput<W>,
    initial: Duration,
    ceiling: Duration,
) -> Result<ExitCode, DispatchError> {
    let Some(pid) = probe_recorded(context.identity_path()) else {
        output.stdout_line(format_args!("daemon not running"))?;
        return Ok(ExitCode::SUCCESS);
    };
    if let Err(error) = deliver(pid, ControlIntent::Terminate) {
        debug!(
            target: DISPATCH_TARGET,
            error = %error,
            "terminate delivery failed; treating daemon as stopped"
        );
        output.stdout_line(format_args!("daemon not running"))?;
        return Ok(ExitCode::SUCCESS);
    }

    // Best-effort wait: giving up past the ceiling is silent beyond the
    // debug trace, and the caller is never blocked indefinitely.
    if wait_for_exit(context.identity_path(), initial, ceiling) {
        output.stdout_line(format_args!("daemon stopped (pid {pid})"))?;
    }
    Ok(ExitCode::SUCCESS)
}

fn reload<W: Write>(
    context: &DaemonContext,
    output: &mut DispatchOutput<W>,
) -> Result<ExitCode, DispatchError> {
    let Some(pid) = probe_recorded(context.identity_path()) else {
        output.stdout_line(format_args!("daemon not running"))?;
        return Ok(ExitCode::SUCCESS);
    };
    match deliver(pid, ControlIntent::Reload) {
        Ok(()) => {
            output.stdout_line(format_args!("reload requested (pid {pid})"))?;
        }
        Err(error) => {
            debug!(
                target: DISPATCH_TARGET,
                error = %error,
                "reload delivery failed; treating daemon as stopped"
            );
            output.stdout_line(format_args!("daemon not running"))?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Polls the recorded identity until it disappears or the wait budget is
/// spent.
///
/// Intervals start at `initial` and double per probe; the loop gives up once
/// the accumulated wait reaches `ceiling`. Returns whether the identity is
/// gone.
fn wait_for_exit(path: &Path, initial: Duration, ceiling: Duration) -> bool {
    let mut delay = initial;
    let mut waited = Duration::ZERO;
    while probe_recorded(path).is_some() {
        if waited >= ceiling {
            debug!(
                target: DISPATCH_TARGET,
                waited_ms = waited.as_millis(),
                "daemon still running after backoff ceiling; giving up wait"
            );
            return false;
        }
        let step = delay.min(ceiling - waited);
        thread::sleep(step);
        waited += step;
        delay = delay.saturating_mul(2);
    }
    true
}

/// Encodes the supervisor's verdict as a process exit code.
///
/// The abnormal sentinel (and any other out-of-band value) renders as 255,
/// the value a Unix parent observes for the sentinel.
fn verdict_exit_code(exit: SupervisorExit) -> ExitCode {
    u8::try_from(exit.code()).map_or(ExitCode::from(255), ExitCode::from)
}

/// Errors raised while dispatching a daemon verb.
#[derive(Debug, Error)]
pub(crate) enum DispatchError {
    /// The daemon context could not be resolved.
    #[error(transparent)]
    Context(#[from] ContextError),
    /// `start` was invoked without a workload command.
    #[error("no workload command supplied")]
    MissingWorkload,
    /// Daemonisation failed.
    #[error(transparent)]
    Detach(#[from] DetachError),
    /// The workload could not be launched.
    #[error(transparent)]
    Launch(#[from] LaunchError),
    /// The control-signal listener could not be installed.
    #[error(transparent)]
    Control(#[from] ControlError),
    /// Writing an operator message failed.
    #[error("failed to write output: {0}")]
    Output(#[source] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::ffi::OsString;
    use std::fs;
    use std::path::PathBuf;
    use std::process::Command;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use nix::unistd::Pid;
    use tempfile::{TempDir, tempdir};

    use dockhand_supervisor::record;

    struct Streams {
        stdout: Vec<u8>,
    }

    impl Streams {
        fn new() -> Self {
            Self { stdout: Vec::new() }
        }

        fn output(&mut self) -> DispatchOutput<&mut Vec<u8>> {
            DispatchOutput::new(&mut self.stdout)
        }

        fn stdout_text(&self) -> String {
            String::from_utf8_lossy(&self.stdout).into_owned()
        }
    }

    /// Fake backend for verbs that must never daemonise.
    struct NeverDetach;

    impl Detach for NeverDetach {
        fn detach(&self, _context: &DaemonContext) -> Result<DetachOutcome, DetachError> {
            panic!("detach must not be invoked");
        }
    }

    /// Fake backend reporting the parent side without forking.
    struct ParentDetach {
        calls: AtomicUsize,
    }

    impl ParentDetach {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl Detach for ParentDetach {
        fn detach(&self, _context: &DaemonContext) -> Result<DetachOutcome, DetachError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(DetachOutcome::Parent)
        }
    }

    /// Fake backend reporting the child side in-process: it records the
    /// current pid like the real backend would, without forking.
    struct ChildDetach;

    impl Detach for ChildDetach {
        fn detach(&self, context: &DaemonContext) -> Result<DetachOutcome, DetachError> {
            let guard = record(context.identity_path(), Pid::this())?;
            Ok(DetachOutcome::Child(guard))
        }
    }

    fn args(dir: &TempDir, verb: DaemonVerb, workload: &[&str]) -> DaemonArgs {
        DaemonArgs {
            pid_file: Some(dir.path().join("dockhand.pid")),
            log_file: None,
            work_dir: None,
            env_dir: None,
            grace: 30,
            verb,
            workload: workload.iter().map(OsString::from).collect(),
        }
    }

    fn record_own_pid(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("dockhand.pid");
        fs::write(&path, format!("{}\n", std::process::id())).expect("write identity file");
        path
    }

    fn assert_exit(code: ExitCode, expected: u8) {
        assert_eq!(format!("{code:?}"), format!("{:?}", ExitCode::from(expected)));
    }

    #[test]
    fn status_before_start_reports_not_running_and_exits_one() {
        let dir = tempdir().expect("tempdir");
        let mut streams = Streams::new();
        let code = dispatch(
            args(&dir, DaemonVerb::Status, &[]),
            &NeverDetach,
            &mut streams.output(),
        )
        .expect("status should dispatch");
        assert_exit(code, 1);
        assert!(streams.stdout_text().contains("not running"));
    }

    #[test]
    fn status_reports_a_running_daemon() {
        let dir = tempdir().expect("tempdir");
        record_own_pid(&dir);
        let mut streams = Streams::new();
        let code = dispatch(
            args(&dir, DaemonVerb::Status, &[]),
            &NeverDetach,
            &mut streams.output(),
        )
        .expect("status should dispatch");
        assert_exit(code, 0);
        assert!(streams.stdout_text().contains("running"));
    }

    #[test]
    fn start_while_running_is_a_reported_no_op() {
        let dir = tempdir().expect("tempdir");
        record_own_pid(&dir);
        let mut streams = Streams::new();
        let code = dispatch(
            args(&dir, DaemonVerb::Start, &["sleep", "30"]),
            &NeverDetach,
            &mut streams.output(),
        )
        .expect("start should dispatch");
        assert_exit(code, 0);
        assert!(streams.stdout_text().contains("already running"));
    }

    #[test]
    fn start_without_a_workload_is_a_usage_error() {
        let dir = tempdir().expect("tempdir");
        let mut streams = Streams::new();
        let error = dispatch(
            args(&dir, DaemonVerb::Start, &[]),
            &NeverDetach,
            &mut streams.output(),
        )
        .expect_err("empty workload should fail before detaching");
        assert!(matches!(error, DispatchError::MissingWorkload));
    }

    #[test]
    fn start_parent_branch_reports_and_exits_cleanly() {
        let dir = tempdir().expect("tempdir");
        let detach = ParentDetach::new();
        let mut streams = Streams::new();
        let code = dispatch(
            args(&dir, DaemonVerb::Start, &["sleep", "30"]),
            &detach,
            &mut streams.output(),
        )
        .expect("start should dispatch");
        assert_exit(code, 0);
        assert_eq!(detach.calls.load(Ordering::SeqCst), 1);
        assert!(streams.stdout_text().contains("daemon started"));
    }

    #[test]
    fn start_child_branch_supervises_and_releases_the_identity() {
        let dir = tempdir().expect("tempdir");
        let mut streams = Streams::new();
        let code = dispatch(
            args(&dir, DaemonVerb::Start, &["sh", "-c", "exit 5"]),
            &ChildDetach,
            &mut streams.output(),
        )
        .expect("start should dispatch");
        assert_exit(code, 5);
        assert!(
            !dir.path().join("dockhand.pid").exists(),
            "identity must be released when the workload ends"
        );
    }

    #[test]
    fn launch_failure_in_the_child_leaves_no_identity_behind() {
        let dir = tempdir().expect("tempdir");
        let mut streams = Streams::new();
        let error = dispatch(
            args(
                &dir,
                DaemonVerb::Start,
                &["/nonexistent/dockhand-test-binary"],
            ),
            &ChildDetach,
            &mut streams.output(),
        )
        .expect_err("unstartable workload should fail");
        assert!(matches!(error, DispatchError::Launch { .. }));
        assert!(
            !dir.path().join("dockhand.pid").exists(),
            "identity must not dangle after a launch failure"
        );
    }

    #[test]
    fn stop_while_not_running_reports_and_exits_cleanly() {
        let dir = tempdir().expect("tempdir");
        let mut streams = Streams::new();
        let code = dispatch(
            args(&dir, DaemonVerb::Stop, &[]),
            &NeverDetach,
            &mut streams.output(),
        )
        .expect("stop should dispatch");
        assert_exit(code, 0);
        assert!(streams.stdout_text().contains("not running"));
    }

    #[test]
    fn stop_terminates_a_running_process_and_waits_for_it() {
        let dir = tempdir().expect("tempdir");
        let mut child = Command::new("sleep").arg("30").spawn().expect("spawn child");
        let pid = child.id();
        fs::write(dir.path().join("dockhand.pid"), format!("{pid}\n"))
            .expect("write identity file");
        // Reap the child once the terminate lands so the probe stops seeing
        // a zombie.
        let reaper = thread::spawn(move || child.wait());

        let mut streams = Streams::new();
        let code = dispatch(
            args(&dir, DaemonVerb::Stop, &[]),
            &NeverDetach,
            &mut streams.output(),
        )
        .expect("stop should dispatch");
        assert_exit(code, 0);
        assert!(streams.stdout_text().contains("stopped"));
        reaper
            .join()
            .expect("reaper should join")
            .expect("child should be reaped");
    }

    #[test]
    fn stop_gives_up_silently_once_the_backoff_ceiling_is_spent() {
        let dir = tempdir().expect("tempdir");
        let mut child = Command::new("sh")
            .args(["-c", r#"trap "" TERM; exec sleep 30"#])
            .spawn()
            .expect("spawn child");
        fs::write(dir.path().join("dockhand.pid"), format!("{}\n", child.id()))
            .expect("write identity file");
        let context = DaemonContext::resolve(ContextOptions {
            identity_path: Some(dir.path().join("dockhand.pid")),
            ..ContextOptions::default()
        })
        .expect("context should resolve");

        let mut streams = Streams::new();
        let code = stop_with_budget(
            &context,
            &mut streams.output(),
            Duration::from_millis(10),
            Duration::from_millis(100),
        )
        .expect("stop should dispatch");
        assert_exit(code, 0);
        assert!(
            streams.stdout_text().is_empty(),
            "the abandoned wait must stay silent"
        );

        child.kill().expect("kill child");
        child.wait().expect("reap child");
    }

    #[test]
    fn reload_while_not_running_reports_and_exits_cleanly() {
        let dir = tempdir().expect("tempdir");
        let mut streams = Streams::new();
        let code = dispatch(
            args(&dir, DaemonVerb::Reload, &[]),
            &NeverDetach,
            &mut streams.output(),
        )
        .expect("reload should dispatch");
        assert_exit(code, 0);
        assert!(streams.stdout_text().contains("not running"));
    }

    #[test]
    fn reload_delivers_and_returns_immediately() {
        let dir = tempdir().expect("tempdir");
        let mut child = Command::new("sleep").arg("30").spawn().expect("spawn child");
        let pid = child.id();
        fs::write(dir.path().join("dockhand.pid"), format!("{pid}\n"))
            .expect("write identity file");
        let reaper = thread::spawn(move || child.wait());

        let mut streams = Streams::new();
        let code = dispatch(
            args(&dir, DaemonVerb::Reload, &[]),
            &NeverDetach,
            &mut streams.output(),
        )
        .expect("reload should dispatch");
        assert_exit(code, 0);
        assert!(streams.stdout_text().contains("reload requested"));
        // The default disposition for SIGHUP ends the sleep child.
        reaper
            .join()
            .expect("reaper should join")
            .expect("child should be reaped");
    }

    #[test]
    fn wait_for_exit_returns_once_the_identity_is_gone() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("dockhand.pid");
        assert!(wait_for_exit(
            &path,
            Duration::from_millis(10),
            Duration::from_millis(100)
        ));
    }

    #[test]
    fn wait_for_exit_gives_up_at_the_backoff_ceiling() {
        let dir = tempdir().expect("tempdir");
        let path = record_own_pid(&dir);
        let started = std::time::Instant::now();
        assert!(!wait_for_exit(
            &path,
            Duration::from_millis(10),
            Duration::from_millis(80)
        ));
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "the wait must terminate on its own"
        );
    }

    #[test]
    fn verdict_codes_render_as_process_exit_codes() {
        assert_exit(verdict_exit_code(SupervisorExit::Workload(0)), 0);
        assert_exit(verdict_exit_code(SupervisorExit::Workload(7)), 7);
        assert_exit(verdict_exit_code(SupervisorExit::Abnormal), 255);
        assert_exit(verdict_exit_code(SupervisorExit::Forced), 255);
    }
}
