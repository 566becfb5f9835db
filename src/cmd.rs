use std::ffi::OsStr;
use std::io::Read;
use std::process::{Child, Command, Output, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

#[cfg(unix)]
use nix::errno::Errno;
#[cfg(unix)]
use nix::sys::signal::{killpg, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

const POLL_INTERVAL_MS: u64 = 100;
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub fn command(program: impl AsRef<OsStr>) -> Command {
    let mut cmd = Command::new(program);
    configure_for_background(&mut cmd);
    cmd
}

#[cfg(windows)]
fn configure_for_background(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;

    // Prevent console windows from stealing focus on Windows while running tools.
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
fn configure_for_background(_cmd: &mut Command) {}

#[derive(Debug)]
pub enum CommandRunError {
    Spawn(std::io::Error),
    Wait(std::io::Error),
    /// Stopped after the cancel flag was raised.
    Canceled,
    TimedOut(u64),
}

impl std::fmt::Display for CommandRunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandRunError::Spawn(e) => write!(f, "could not start: {e}"),
            CommandRunError::Wait(e) => write!(f, "failed while running: {e}"),
            CommandRunError::Canceled => write!(f, "canceled"),
            CommandRunError::TimedOut(secs) => write!(f, "timed out after {secs}s"),
        }
    }
}

/// Limits applied to one subprocess run.
#[derive(Debug, Clone, Copy)]
pub struct RunControl<'a> {
    pub cancel: Option<&'a AtomicBool>,
    pub grace: Duration,
    /// Zero disables the timeout.
    pub timeout_secs: u64,
}

impl<'a> RunControl<'a> {
    pub fn with_timeout(timeout_secs: u64) -> Self {
        Self {
            cancel: None,
            grace: Duration::ZERO,
            timeout_secs,
        }
    }

    pub fn cancelable(mut self, cancel: &'a AtomicBool, grace: Duration) -> Self {
        self.cancel = Some(cancel);
        self.grace = grace;
        self
    }
}

/// Asks the whole process group to stop. Windows has no equivalent; the
/// hard kill after the grace period covers it.
fn terminate_process_tree(child: &Child) {
    #[cfg(unix)]
    signal_group(child.id(), Signal::SIGTERM);
    #[cfg(not(unix))]
    let _ = child;
}

fn kill_child_process_tree(child: &mut Child) {
    #[cfg(windows)]
    {
        let pid = child.id().to_string();
        let _ = command("taskkill").args(["/PID", &pid, "/T", "/F"]).status();
    }
    #[cfg(unix)]
    signal_group(child.id(), Signal::SIGKILL);

    let _ = child.kill();
    let _ = child.wait();
}

// The child leads its own group (see `run_with_control`), so its pid is the group id.
#[cfg(unix)]
fn signal_group(pgid: u32, signal: Signal) {
    if let Err(e) = killpg(Pid::from_raw(pgid as i32), signal) {
        if e != Errno::ESRCH {
            tracing::debug!(pgid, ?signal, error = %e, "failed to signal process group");
        }
    }
}

fn spawn_reader(mut source: impl Read + Send + 'static) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = source.read_to_end(&mut buf);
        let _ = tx.send(buf);
    });
    rx
}

/// Collects both pipes once the child is gone. Descendants still holding
/// the pipes open are killed instead of waited on.
fn collect_pipes(
    child: &mut Child,
    stdout: &mpsc::Receiver<Vec<u8>>,
    stderr: &mpsc::Receiver<Vec<u8>>,
) -> (Vec<u8>, Vec<u8>) {
    let deadline = Instant::now() + PIPE_DRAIN_TIMEOUT;
    let mut take = |rx: &mpsc::Receiver<Vec<u8>>| {
        let left = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(left) {
            Ok(buf) => buf,
            Err(_) => {
                kill_child_process_tree(child);
                rx.recv_timeout(PIPE_DRAIN_TIMEOUT).unwrap_or_default()
            }
        }
    };
    let out = take(stdout);
    let err = take(stderr);
    (out, err)
}

/// Runs `cmd` to completion while honoring the timeout and cancel flag.
///
/// On Unix the child gets its own process group. Raising the cancel flag
/// sends SIGTERM to the group and SIGKILL once the grace period runs out; a
/// timeout kills the group at once. A child that exits successfully inside the
/// grace period returns its output normally, any other exit after
/// cancellation is `Canceled`.
pub fn run_with_control(
    cmd: &mut Command,
    control: RunControl<'_>,
) -> std::result::Result<Output, CommandRunError> {
    use std::io::ErrorKind;

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let mut child = cmd.spawn().map_err(CommandRunError::Spawn)?;

    let stdout = child.stdout.take().ok_or_else(|| {
        CommandRunError::Wait(std::io::Error::new(ErrorKind::Other, "stdout pipe missing"))
    })?;
    let stderr = child.stderr.take().ok_or_else(|| {
        CommandRunError::Wait(std::io::Error::new(ErrorKind::Other, "stderr pipe missing"))
    })?;
    let stdout_rx = spawn_reader(stdout);
    let stderr_rx = spawn_reader(stderr);

    let started = Instant::now();
    let mut cancel_seen_at: Option<Instant> = None;
    let mut abort_reason: Option<CommandRunError> = None;

    loop {
        if abort_reason.is_none() {
            if let Some(flag) = control.cancel {
                if cancel_seen_at.is_none() && flag.load(Ordering::SeqCst) {
                    cancel_seen_at = Some(Instant::now());
                    terminate_process_tree(&child);
                }
            }
            if let Some(seen) = cancel_seen_at {
                if seen.elapsed() >= control.grace {
                    kill_child_process_tree(&mut child);
                    abort_reason = Some(CommandRunError::Canceled);
                }
            }
        }
        if abort_reason.is_none()
            && control.timeout_secs > 0
            && started.elapsed() >= Duration::from_secs(control.timeout_secs)
        {
            kill_child_process_tree(&mut child);
            abort_reason = Some(CommandRunError::TimedOut(control.timeout_secs));
        }

        match child.try_wait() {
            Ok(Some(status)) => {
                let (stdout, stderr) = collect_pipes(&mut child, &stdout_rx, &stderr_rx);
                if let Some(reason) = abort_reason {
                    return Err(reason);
                }
                if cancel_seen_at.is_some() && !status.success() {
                    return Err(CommandRunError::Canceled);
                }
                return Ok(Output {
                    status,
                    stdout,
                    stderr,
                });
            }
            Ok(None) => {
                thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
            }
            Err(err) => {
                kill_child_process_tree(&mut child);
                return Err(CommandRunError::Wait(err));
            }
        }
    }
}
