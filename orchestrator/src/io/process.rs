//! Helpers for running child processes under a dual timeout with bounded output.
//!
//! The child is killed when it exceeds the overall timeout, stays silent longer
//! than the progress timeout, prints something that looks like an interactive
//! prompt, or is cancelled by the caller. On Unix the child leads its own
//! process group and the whole group is killed, so grandchildren holding the
//! output pipes cannot outlive the deadline.

use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Bytes of recent output kept for prompt-pattern matching.
const TAIL_BYTES: usize = 4096;

/// How long reader threads may take to drain pipes after the child is reaped.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Cooperative cancellation flag shared between a caller and running work.
///
/// A handle made with [`child`](Self::child) also reports cancelled once any
/// of its ancestors is.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
    parent: Option<Box<CancelHandle>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle that can be cancelled on its own or through `self`.
    pub fn child(&self) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(Box::new(self.clone())),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self.parent.as_ref().is_some_and(|parent| parent.is_cancelled())
    }
}

/// Why a child was stopped before (or instead of) exiting on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    OverallTimeout,
    ProgressTimeout,
    InteractivePrompt,
    StdinRequired,
    Cancelled,
}

/// Limits and detectors applied while a child runs.
#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub overall_timeout: Duration,
    pub progress_timeout: Duration,
    pub poll_interval: Duration,
    pub output_limit_bytes: usize,
    pub interactive_patterns: Vec<Regex>,
    pub stdin_patterns: Vec<Regex>,
    /// The child is stopped as soon as any of these is cancelled.
    pub cancel: Vec<CancelHandle>,
}

impl WatchOptions {
    pub fn new(overall_timeout: Duration, progress_timeout: Duration) -> Self {
        Self {
            overall_timeout,
            progress_timeout,
            poll_interval: Duration::from_millis(50),
            output_limit_bytes: 100_000,
            interactive_patterns: Vec::new(),
            stdin_patterns: Vec::new(),
            cancel: Vec::new(),
        }
    }
}

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub termination: Option<Termination>,
    pub elapsed: Duration,
}

impl CommandOutput {
    /// stdout followed by stderr (when present), with truncation notices.
    pub fn combined_text(&self) -> String {
        let mut buf = String::from_utf8_lossy(&self.stdout).into_owned();
        if self.stdout_truncated > 0 {
            buf.push_str(&format!("\n[stdout truncated {} bytes]\n", self.stdout_truncated));
        }
        if !self.stderr.is_empty() {
            if !buf.is_empty() && !buf.ends_with('\n') {
                buf.push('\n');
            }
            buf.push_str(&String::from_utf8_lossy(&self.stderr));
        }
        if self.stderr_truncated > 0 {
            buf.push_str(&format!("\n[stderr truncated {} bytes]\n", self.stderr_truncated));
        }
        buf
    }
}

/// Shared between the reader threads and the supervising loop.
struct Watch {
    last_progress: Mutex<Instant>,
    detected: Mutex<Option<Termination>>,
    interactive: Vec<Regex>,
    stdin: Vec<Regex>,
}

impl Watch {
    fn touch(&self) {
        *self
            .last_progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    fn detected(&self) -> Option<Termination> {
        *self.detected.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn scan(&self, tail: &str) {
        let found = if self.stdin.iter().any(|re| re.is_match(tail)) {
            Some(Termination::StdinRequired)
        } else if self.interactive.iter().any(|re| re.is_match(tail)) {
            Some(Termination::InteractivePrompt)
        } else {
            None
        };
        if let Some(found) = found {
            let mut slot = self.detected.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() {
                *slot = Some(found);
            }
        }
    }
}

/// Run a command under [`WatchOptions`], capturing stdout/stderr without
/// risking pipe deadlocks.
///
/// Stdin is written from its own thread and then closed, so a child that never
/// reads it cannot block the caller.
#[instrument(skip_all, fields(overall_secs = options.overall_timeout.as_secs(), progress_secs = options.progress_timeout.as_secs()))]
pub fn run_watched_command(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    options: &WatchOptions,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!("spawning child process");
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdin_handle = match stdin {
        Some(input) => {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            Some(thread::spawn(move || {
                if let Err(e) = child_stdin.write_all(&input) {
                    debug!(err = %e, "child closed stdin early");
                }
            }))
        }
        None => None,
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let watch = Arc::new(Watch {
        last_progress: Mutex::new(Instant::now()),
        detected: Mutex::new(None),
        interactive: options.interactive_patterns.clone(),
        stdin: options.stdin_patterns.clone(),
    });
    let limit = options.output_limit_bytes;
    let stdout_watch = Arc::clone(&watch);
    let stdout_handle = thread::spawn(move || read_stream_watched(stdout, limit, &stdout_watch));
    let stderr_watch = Arc::clone(&watch);
    let stderr_handle = thread::spawn(move || read_stream_watched(stderr, limit, &stderr_watch));

    let mut termination = None;
    let status = loop {
        if let Some(status) = child
            .wait_timeout(options.poll_interval)
            .context("wait for command")?
        {
            break status;
        }

        let cancelled = options.cancel.iter().any(CancelHandle::is_cancelled);
        let reason = if let Some(detected) = watch.detected() {
            Some(detected)
        } else if cancelled {
            Some(Termination::Cancelled)
        } else if started.elapsed() >= options.overall_timeout {
            Some(Termination::OverallTimeout)
        } else if watch.idle_for() >= options.progress_timeout {
            Some(Termination::ProgressTimeout)
        } else {
            None
        };

        if let Some(reason) = reason {
            warn!(?reason, elapsed_ms = started.elapsed().as_millis() as u64, "killing command");
            termination = Some(reason);
            kill_process_group(&mut child).context("kill command")?;
            break child.wait().context("wait command after kill")?;
        }
    };

    let drain_deadline = Instant::now() + DRAIN_GRACE;
    let (stdout, stdout_truncated) =
        join_output(stdout_handle, drain_deadline, options.poll_interval).context("join stdout")?;
    let (stderr, stderr_truncated) =
        join_output(stderr_handle, drain_deadline, options.poll_interval).context("join stderr")?;
    if let Some(handle) = stdin_handle {
        if handle.is_finished() {
            if handle.join().is_err() {
                warn!("stdin writer thread panicked");
            }
        } else {
            debug!("stdin writer still blocked, detaching");
        }
    }

    // A prompt printed just before exit still means the child wanted input.
    if termination.is_none() {
        termination = watch.detected();
    }

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), ?termination, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        termination,
        elapsed: started.elapsed(),
    })
}

#[cfg(unix)]
fn kill_process_group(child: &mut Child) -> std::io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(pid) = i32::try_from(child.id()) else {
        return child.kill();
    };
    match killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => {
            warn!(%errno, "killpg failed, killing child only");
            child.kill()
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child) -> std::io::Result<()> {
    child.kill()
}

/// Join a reader thread, giving up once `deadline` passes.
///
/// A reader still blocked at the deadline is detached and its stream reported
/// as empty; this happens only when something outside the killed process
/// group still holds the pipe.
fn join_output(
    handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>,
    deadline: Instant,
    poll: Duration,
) -> Result<(Vec<u8>, usize)> {
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!("output reader did not reach EOF, detaching");
            return Ok((Vec::new(), 0));
        }
        thread::sleep(poll);
    }
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_watched<R: Read>(mut reader: R, limit: usize, watch: &Watch) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut tail: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        watch.touch();

        tail.extend_from_slice(&chunk[..n]);
        if tail.len() > TAIL_BYTES {
            tail.drain(..tail.len() - TAIL_BYTES);
        }
        watch.scan(&String::from_utf8_lossy(&tail));

        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    fn options(overall_ms: u64, progress_ms: u64) -> WatchOptions {
        WatchOptions {
            poll_interval: Duration::from_millis(10),
            ..WatchOptions::new(
                Duration::from_millis(overall_ms),
                Duration::from_millis(progress_ms),
            )
        }
    }

    #[test]
    fn captures_output_and_stdin() {
        let out = run_watched_command(sh("cat; echo done >&2"), Some(b"hello\n"), &options(5_000, 5_000))
            .expect("run");
        assert!(out.status.success());
        assert_eq!(out.stdout, b"hello\n");
        assert_eq!(out.stderr, b"done\n");
        assert_eq!(out.termination, None);
    }

    #[test]
    fn overall_timeout_kills_child() {
        let out = run_watched_command(
            sh("while true; do echo tick; sleep 0.05; done"),
            None,
            &options(300, 5_000),
        )
        .expect("run");
        assert_eq!(out.termination, Some(Termination::OverallTimeout));
        assert!(!out.status.success());
    }

    #[test]
    fn silent_child_hits_progress_timeout() {
        let out = run_watched_command(sh("exec sleep 5"), None, &options(5_000, 200)).expect("run");
        assert_eq!(out.termination, Some(Termination::ProgressTimeout));
        assert!(out.elapsed < Duration::from_secs(4));
    }

    #[test]
    fn interactive_prompt_is_detected() {
        let mut opts = options(5_000, 5_000);
        opts.interactive_patterns = vec![Regex::new(r"(?i)continue\? \[y/n\]").expect("regex")];
        let out = run_watched_command(sh("printf 'Continue? [y/N] '; exec sleep 5"), None, &opts)
            .expect("run");
        assert_eq!(out.termination, Some(Termination::InteractivePrompt));
    }

    #[test]
    fn stdin_pattern_wins_over_interactive() {
        let mut opts = options(5_000, 5_000);
        opts.interactive_patterns = vec![Regex::new(r"(?i)password").expect("regex")];
        opts.stdin_patterns = vec![Regex::new(r"(?i)password:\s*$").expect("regex")];
        let out = run_watched_command(sh("printf 'Password: '; exec sleep 5"), None, &opts).expect("run");
        assert_eq!(out.termination, Some(Termination::StdinRequired));
    }

    #[test]
    fn cancel_flag_kills_child() {
        let mut opts = options(5_000, 5_000);
        let parent = CancelHandle::new();
        opts.cancel = vec![CancelHandle::new(), parent.child()];
        parent.cancel();
        let out = run_watched_command(sh("exec sleep 5"), None, &opts).expect("run");
        assert_eq!(out.termination, Some(Termination::Cancelled));
    }

    #[test]
    fn timeout_kills_grandchildren_holding_the_pipes() {
        let started = Instant::now();
        let out = run_watched_command(sh("sleep 3; echo x"), None, &options(200, 5_000)).expect("run");
        assert_eq!(out.termination, Some(Termination::OverallTimeout));
        assert!(started.elapsed() < Duration::from_millis(1_500), "took {:?}", started.elapsed());
        assert!(out.stdout.is_empty());
    }

    #[test]
    fn child_handles_follow_their_parent() {
        let root = CancelHandle::new();
        let child = root.child();
        let sibling = root.child();
        child.cancel();
        assert!(!root.is_cancelled());
        assert!(!sibling.is_cancelled());
        root.cancel();
        assert!(sibling.is_cancelled());
    }

    #[test]
    fn output_beyond_limit_is_truncated() {
        let mut opts = options(5_000, 5_000);
        opts.output_limit_bytes = 4;
        let out = run_watched_command(sh("printf 0123456789"), None, &opts).expect("run");
        assert_eq!(out.stdout, b"0123");
        assert_eq!(out.stdout_truncated, 6);
        assert!(out.combined_text().contains("[stdout truncated 6 bytes]"));
    }
}
