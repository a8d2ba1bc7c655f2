//! Child-process plumbing shared by the engine, muxer and embedder runs.
//!
//! Every run streams its output line by line, can be cancelled through a
//! [`CancellationToken`], and is shut down with SIGTERM followed by SIGKILL
//! once the grace period elapses.

use std::collections::VecDeque;
use std::ffi::OsStr;
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[cfg(unix)]
use nix::sys::signal::{killpg, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Lines kept for error classification after the process exits.
const TAIL_LINES: usize = 40;

/// How long to keep reading buffered output after the child has exited.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

impl OutputLine {
    pub fn text(&self) -> &str {
        match self {
            Self::Stdout(s) | Self::Stderr(s) => s,
        }
    }
}

/// Observations delivered while a process runs.
#[derive(Debug)]
pub enum RunEvent<'a> {
    Line(&'a OutputLine),
    /// No output for the given duration.
    Idle(Duration),
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Time between SIGTERM and SIGKILL on cancellation.
    pub grace: Duration,
    /// Report [`RunEvent::Idle`] after this much silence.
    pub idle: Option<Duration>,
    /// Kill the process after this much silence.
    pub hard_timeout: Option<Duration>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(3),
            idle: None,
            hard_timeout: None,
        }
    }
}

#[derive(Debug)]
pub enum RunResult {
    Exited {
        status: ExitStatus,
        /// Last lines of combined output, oldest first.
        tail: Vec<String>,
    },
    Cancelled,
    TimedOut {
        idle: Duration,
    },
}

impl RunResult {
    pub fn success(&self) -> bool {
        matches!(self, Self::Exited { status, .. } if status.success())
    }
}

/// Create a `tokio::process::Command` suited for background tools: no console
/// window on Windows, its own process group on Unix, killed if dropped.
pub fn command(program: impl AsRef<OsStr>) -> Command {
    let mut cmd = Command::new(program);
    cmd.kill_on_drop(true);

    #[cfg(windows)]
    cmd.creation_flags(CREATE_NO_WINDOW);

    #[cfg(unix)]
    cmd.process_group(0);

    cmd
}

/// Spawn `program` and stream its output to `on_event` until it exits, the
/// token is cancelled, or the hard timeout fires.
pub async fn run_streaming<F>(
    program: &Path,
    args: &[String],
    options: &RunOptions,
    cancel: &CancellationToken,
    mut on_event: F,
) -> io::Result<RunResult>
where
    F: FnMut(RunEvent<'_>),
{
    if cancel.is_cancelled() {
        return Ok(RunResult::Cancelled);
    }

    let mut child = command(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    debug!(program = %program.display(), pid = ?child.id(), "spawned process");

    let (tx, mut rx) = mpsc::channel::<OutputLine>(256);
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(forward_lines(stdout, tx.clone(), OutputLine::Stdout)));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(forward_lines(stderr, tx.clone(), OutputLine::Stderr)));
    }
    drop(tx);

    let mut tail = VecDeque::with_capacity(TAIL_LINES);
    let mut last_output = Instant::now();
    let mut next_idle = options.idle.map(|d| last_output + d);
    let mut streams_open = true;

    let result = loop {
        let hard_deadline = options.hard_timeout.map(|d| last_output + d);

        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                terminate(&mut child, options.grace).await?;
                break RunResult::Cancelled;
            }

            line = rx.recv(), if streams_open => match line {
                Some(line) => {
                    last_output = Instant::now();
                    next_idle = options.idle.map(|d| last_output + d);
                    push_tail(&mut tail, line.text());
                    on_event(RunEvent::Line(&line));
                }
                None => streams_open = false,
            },

            status = child.wait() => {
                let status = status?;
                // pick up whatever the readers still hold
                while let Ok(Some(line)) = timeout(DRAIN_TIMEOUT, rx.recv()).await {
                    push_tail(&mut tail, line.text());
                    on_event(RunEvent::Line(&line));
                }
                break RunResult::Exited {
                    status,
                    tail: tail.into_iter().collect(),
                };
            }

            _ = sleep_until(next_idle.unwrap_or_else(far_future)), if next_idle.is_some() => {
                let idle = last_output.elapsed();
                on_event(RunEvent::Idle(idle));
                next_idle = options.idle.map(|d| Instant::now() + d);
            }

            _ = sleep_until(hard_deadline.unwrap_or_else(far_future)),
                if hard_deadline.is_some() =>
            {
                let idle = last_output.elapsed();
                warn!(
                    program = %program.display(),
                    ?idle,
                    "process silent past hard timeout, terminating"
                );
                terminate(&mut child, options.grace).await?;
                break RunResult::TimedOut { idle };
            }
        }
    };

    for reader in readers {
        reader.abort();
    }

    Ok(result)
}

/// Gracefully shut down a child with SIGTERM, escalating to SIGKILL after
/// `grace`. Signals go to the whole process group so helpers spawned by the
/// tool (ffmpeg under yt-dlp) die with it.
pub async fn terminate(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }

    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let group = Pid::from_raw(pid as i32);
            match killpg(group, Signal::SIGTERM) {
                Ok(()) => {
                    if let Ok(result) = timeout(grace, child.wait()).await {
                        return result;
                    }
                    debug!(pid, "grace period elapsed, sending SIGKILL");
                    let _ = killpg(group, Signal::SIGKILL);
                }
                // already gone
                Err(nix::errno::Errno::ESRCH) => return child.wait().await,
                Err(e) => return Err(io::Error::other(e)),
            }
        }
    }

    #[cfg(not(unix))]
    let _ = grace;

    child.start_kill()?;
    child.wait().await
}

async fn forward_lines<R, F>(reader: R, tx: mpsc::Sender<OutputLine>, wrap: F)
where
    R: AsyncRead + Unpin,
    F: Fn(String) -> OutputLine,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                // carriage-return updates count as separate lines
                for segment in text.split('\r') {
                    let segment = segment.trim_end();
                    if segment.is_empty() {
                        continue;
                    }
                    if tx.send(wrap(segment.to_string())).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

fn push_tail(tail: &mut VecDeque<String>, line: &str) {
    if tail.len() == TAIL_LINES {
        tail.pop_front();
    }
    tail.push_back(line.to_string());
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400 * 365)
}
