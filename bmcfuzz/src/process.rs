// SPDX-License-Identifier: Apache-2.0

//! External process control with run-scoped cancellation.
//!
//! Every child becomes the leader of its own process group so that a cancel
//! request can take down the whole subtree (solver wrappers fork their own
//! engines). Unix-only.

use std::io;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::bmcfuzz_error::BmcfuzzError;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Exited(i32),
    Signaled(i32),
    Cancelled,
}

impl ProcessOutcome {
    fn from_status(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => ProcessOutcome::Exited(code),
            (None, Some(sig)) => ProcessOutcome::Signaled(sig),
            (None, None) => ProcessOutcome::Exited(-1),
        }
    }

    /// Exit code, or -1 when the process did not exit normally.
    pub fn code(&self) -> i32 {
        match self {
            ProcessOutcome::Exited(code) => *code,
            ProcessOutcome::Signaled(_) | ProcessOutcome::Cancelled => -1,
        }
    }

    pub fn success(&self) -> bool {
        *self == ProcessOutcome::Exited(0)
    }

    pub fn is_cancelled(&self) -> bool {
        *self == ProcessOutcome::Cancelled
    }
}

/// Human-readable snapshot of a command line for logs.
pub fn command_line(cmd: &Command) -> String {
    let program = cmd.get_program().to_string_lossy().into_owned();
    let args = cmd
        .get_args()
        .map(|s| s.to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    if args.is_empty() {
        program
    } else {
        format!("{} {}", program, args.join(" "))
    }
}

/// `bash -c 'source <env_script> && <line>'`, or just `bash -c '<line>'`
/// without an environment script. Output is discarded; redirect inside
/// `line` to keep it.
pub fn shell_command(env_script: Option<&Path>, line: &str) -> Command {
    let script = match env_script {
        Some(env) => format!("source {} && {}", env.display(), line),
        None => line.to_string(),
    };
    let mut cmd = Command::new("bash");
    cmd.arg("-c").arg(script);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    cmd
}

fn signal_group(pgid: i32, sig: libc::c_int) {
    let rc = unsafe { libc::kill(-pgid, sig) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            log::warn!("process: kill(-{}, {}) failed: {}", pgid, sig, err);
        }
    }
}

/// SIGTERM to the group, up to `TERMINATE_GRACE` to exit, then SIGKILL.
fn terminate_group(child: &mut Child) -> io::Result<ExitStatus> {
    let pgid = child.id() as i32;
    signal_group(pgid, libc::SIGTERM);
    let deadline = Instant::now() + TERMINATE_GRACE;
    while Instant::now() < deadline {
        if let Some(status) = child.try_wait()? {
            // Stragglers that ignored SIGTERM still share the group.
            signal_group(pgid, libc::SIGKILL);
            return Ok(status);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    log::warn!("process: group {} ignored SIGTERM; sending SIGKILL", pgid);
    signal_group(pgid, libc::SIGKILL);
    child.wait()
}

/// Puts the controlling terminal back into a usable state after killing a
/// child that may have changed its modes.
pub fn restore_terminal() {
    if unsafe { libc::isatty(libc::STDIN_FILENO) } != 1 {
        return;
    }
    if let Err(e) = Command::new("stty")
        .arg("sane")
        .stdin(Stdio::inherit())
        .status()
    {
        log::debug!("process: stty sane failed: {}", e);
    }
}

/// Runs `cmd` to completion unless `cancel` becomes true first.
///
/// On cancellation the child's process group is terminated, the child is
/// reaped, the terminal is restored and `ProcessOutcome::Cancelled` is
/// returned. Only spawn and wait failures are errors.
pub fn run_command(cmd: &mut Command, cancel: &AtomicBool) -> Result<ProcessOutcome, BmcfuzzError> {
    let cmdline = command_line(cmd);
    if cancel.load(Ordering::Relaxed) {
        log::debug!("process: not starting \"{}\"; cancelled", cmdline);
        return Ok(ProcessOutcome::Cancelled);
    }
    unsafe {
        cmd.pre_exec(|| {
            if libc::setpgid(0, 0) != 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "Failed to setpgid"));
            }
            Ok(())
        })
    };
    let mut child = cmd
        .spawn()
        .map_err(|e| BmcfuzzError::io(format!("spawning \"{}\"", cmdline), e))?;
    log::trace!("process: spawned pid={} cmdline=\"{}\"", child.id(), cmdline);
    let wait_err = |e| BmcfuzzError::io(format!("waiting for \"{}\"", cmdline), e);
    loop {
        if let Some(status) = child.try_wait().map_err(wait_err)? {
            let outcome = ProcessOutcome::from_status(status);
            log::trace!("process: pid={} finished: {:?}", child.id(), outcome);
            return Ok(outcome);
        }
        if cancel.load(Ordering::Relaxed) {
            log::info!("process: cancelling pid={} \"{}\"", child.id(), cmdline);
            terminate_group(&mut child).map_err(wait_err)?;
            restore_terminal();
            return Ok(ProcessOutcome::Cancelled);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Like `run_command`, with the child's stdout sent to `capture_path` and
/// returned once the child exits.
pub fn run_command_capturing(
    cmd: &mut Command,
    capture_path: &Path,
    cancel: &AtomicBool,
) -> Result<(ProcessOutcome, String), BmcfuzzError> {
    let file = std::fs::File::create(capture_path)
        .map_err(|e| BmcfuzzError::io(format!("creating {}", capture_path.display()), e))?;
    cmd.stdout(Stdio::from(file));
    let outcome = run_command(cmd, cancel)?;
    let text = std::fs::read_to_string(capture_path)
        .map_err(|e| BmcfuzzError::io(format!("reading {}", capture_path.display()), e))?;
    Ok((outcome, text))
}

/// `run_command` over `shell_command`, failing with `Setup` on any
/// unsuccessful exit. Used for collaborator hooks and builds.
pub fn run_checked(
    what: &str,
    env_script: Option<&Path>,
    line: &str,
    cancel: &AtomicBool,
) -> Result<(), BmcfuzzError> {
    log::info!("{}: {}", what, line);
    let outcome = run_command(&mut shell_command(env_script, line), cancel)?;
    match outcome {
        ProcessOutcome::Exited(0) => Ok(()),
        ProcessOutcome::Cancelled => Err(BmcfuzzError::Interrupted),
        other => Err(BmcfuzzError::Setup(format!(
            "{} failed with status {}: {}",
            what,
            other.code(),
            line
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_exit_code_passes_through() {
        let cancel = AtomicBool::new(false);
        let outcome = run_command(&mut shell_command(None, "exit 3"), &cancel).unwrap();
        assert_eq!(outcome, ProcessOutcome::Exited(3));
        assert_eq!(outcome.code(), 3);
        assert!(!outcome.success());
    }

    #[test]
    fn test_signal_maps_to_minus_one() {
        let cancel = AtomicBool::new(false);
        let outcome = run_command(&mut shell_command(None, "kill -9 $$"), &cancel).unwrap();
        assert_eq!(outcome, ProcessOutcome::Signaled(9));
        assert_eq!(outcome.code(), -1);
    }

    #[test]
    fn test_env_script_is_sourced() {
        let dir = tempfile::tempdir().unwrap();
        let env = dir.path().join("env.sh");
        std::fs::write(&env, "export BMCFUZZ_TEST_VALUE=7\n").unwrap();
        let cancel = AtomicBool::new(false);
        let outcome = run_command(
            &mut shell_command(Some(&env), "exit $BMCFUZZ_TEST_VALUE"),
            &cancel,
        )
        .unwrap();
        assert_eq!(outcome.code(), 7);
    }

    #[test]
    fn test_precancelled_does_not_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let cancel = AtomicBool::new(true);
        let line = format!("touch {}", marker.display());
        let outcome = run_command(&mut shell_command(None, &line), &cancel).unwrap();
        assert!(outcome.is_cancelled());
        assert!(!marker.exists());
    }

    #[test]
    fn test_cancel_kills_process_tree() {
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancel);
        let setter = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            flag.store(true, Ordering::Relaxed);
        });
        let start = Instant::now();
        let outcome = run_command(
            &mut shell_command(None, "sleep 30 & sleep 30; wait"),
            &cancel,
        )
        .unwrap();
        setter.join().unwrap();
        assert_eq!(outcome, ProcessOutcome::Cancelled);
        assert_eq!(outcome.code(), -1);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_run_checked_reports_setup_error() {
        let cancel = AtomicBool::new(false);
        run_checked("hook", None, "true", &cancel).unwrap();
        let err = run_checked("hook", None, "exit 4", &cancel).unwrap_err();
        assert!(matches!(err, BmcfuzzError::Setup(_)), "{}", err);
    }

    #[test]
    fn test_run_command_capturing() {
        let dir = tempfile::tempdir().unwrap();
        let capture = dir.path().join("stdout.txt");
        let cancel = AtomicBool::new(false);
        let (outcome, text) =
            run_command_capturing(&mut shell_command(None, "echo 17"), &capture, &cancel).unwrap();
        assert!(outcome.success());
        assert_eq!(text, "17\n");
    }

    #[test]
    fn test_command_line() {
        let mut cmd = Command::new("sby");
        cmd.arg("-f").arg("cover_1.sby");
        assert_eq!(command_line(&cmd), "sby -f cover_1.sby");
    }
}
