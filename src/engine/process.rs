//! Shell process execution
//!
//! Runs one command line through the platform shell with its stdout and stderr
//! drained concurrently, so a chatty child can never stall on a full pipe.
//! Each decoded line is forwarded to the event bus as it arrives.
//!
//! On timeout the child is terminated: with `kill_tree` the whole process
//! group (Unix) or process tree (Windows) is killed, otherwise the child gets
//! a graceful termination request followed by a hard kill after a short grace.

use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use encoding_rs::{Encoding, UTF_8};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::events::EventBus;

/// How long output readers may keep draining after the child is gone
const READER_GRACE: Duration = Duration::from_secs(1);
/// How long a terminated child gets before it is killed outright
const TERMINATE_GRACE: Duration = Duration::from_secs(1);

/// Everything needed to launch one attempt
#[derive(Debug, Clone)]
pub struct ProcessSpec<'a> {
    pub command: &'a str,
    pub workdir: &'a Path,
    /// `None` waits forever
    pub timeout: Option<Duration>,
    pub kill_tree: bool,
    pub encoding: &'static Encoding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    Exited(i32),
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub exit: ProcessExit,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ProcessOutput {
    pub fn exit_code(&self) -> Option<i32> {
        match self.exit {
            ProcessExit::Exited(code) => Some(code),
            ProcessExit::TimedOut => None,
        }
    }
}

/// Resolve an output encoding label, falling back to UTF-8
pub fn encoding_for(label: &str) -> &'static Encoding {
    match Encoding::for_label(label.trim().as_bytes()) {
        Some(encoding) => encoding,
        None => {
            warn!(label, "Unknown output encoding, using utf-8");
            UTF_8
        }
    }
}

/// Launch `spec.command` and wait for it, bounded by the timeout.
///
/// `Err` means the process could not be started (or waited on) at all.
pub async fn run_command(spec: &ProcessSpec<'_>, events: &EventBus) -> io::Result<ProcessOutput> {
    info!(command = spec.command, workdir = %spec.workdir.display(), "Executing command");

    let mut cmd = shell_command(spec.command);
    cmd.current_dir(spec.workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    if spec.kill_tree {
        cmd.process_group(0);
    }

    let started = Instant::now();
    let mut child = cmd.spawn()?;

    let stdout_buf = Arc::new(Mutex::new(String::new()));
    let stderr_buf = Arc::new(Mutex::new(String::new()));
    let stdout_task = child.stdout.take().map(|pipe| {
        tokio::spawn(drain(pipe, spec.encoding, "STDOUT", stdout_buf.clone(), events.clone()))
    });
    let stderr_task = child.stderr.take().map(|pipe| {
        tokio::spawn(drain(pipe, spec.encoding, "STDERR", stderr_buf.clone(), events.clone()))
    });

    let waited = match spec.timeout {
        Some(limit) => tokio::time::timeout(limit, child.wait()).await.ok(),
        None => Some(child.wait().await),
    };

    let exit = match waited {
        Some(Ok(status)) => ProcessExit::Exited(exit_code(status)),
        Some(Err(e)) => {
            terminate(&mut child, spec.kill_tree).await;
            join_reader(stdout_task).await;
            join_reader(stderr_task).await;
            return Err(e);
        }
        None => {
            warn!(command = spec.command, timeout = ?spec.timeout, "Command timed out");
            terminate(&mut child, spec.kill_tree).await;
            ProcessExit::TimedOut
        }
    };
    let duration = started.elapsed();

    join_reader(stdout_task).await;
    join_reader(stderr_task).await;

    let stdout = stdout_buf.lock().await.clone();
    let stderr = stderr_buf.lock().await.clone();
    debug!(?exit, duration_ms = duration.as_millis() as u64, "Command finished");

    Ok(ProcessOutput {
        exit,
        stdout,
        stderr,
        duration,
    })
}

#[cfg(windows)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

#[cfg(not(windows))]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| -sig))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

async fn drain<R>(
    stream: R,
    encoding: &'static Encoding,
    label: &'static str,
    sink: Arc<Mutex<String>>,
    events: EventBus,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let (text, _, _) = encoding.decode(&line);
                sink.lock().await.push_str(&text);
                events.log_line(format!("[{}] {}", label, text));
            }
            Err(e) => {
                debug!(stream = label, error = %e, "Output stream closed with error");
                break;
            }
        }
    }
}

/// Wait briefly for a reader; a grandchild holding the pipe open must not hang the run
async fn join_reader(task: Option<JoinHandle<()>>) {
    let Some(mut task) = task else {
        return;
    };
    if tokio::time::timeout(READER_GRACE, &mut task).await.is_err() {
        debug!("Output reader still busy after grace period, aborting");
        task.abort();
    }
}

async fn terminate(child: &mut Child, kill_tree: bool) {
    if kill_tree {
        kill_process_tree(child).await;
    } else {
        request_termination(child);
    }

    if tokio::time::timeout(TERMINATE_GRACE, child.wait()).await.is_err() {
        if let Err(e) = child.kill().await {
            warn!(error = %e, "Failed to kill child process");
        }
    }
}

#[cfg(unix)]
async fn kill_process_tree(child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };
    // The child leads its own process group, so the group id is its pid
    let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
    if rc != 0 {
        warn!(pid, error = %io::Error::last_os_error(), "killpg failed, killing child only");
        let _ = child.start_kill();
    }
}

#[cfg(windows)]
async fn kill_process_tree(child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };
    let status = Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if !matches!(status, Ok(s) if s.success()) {
        warn!(pid, "taskkill failed, killing child only");
        let _ = child.start_kill();
    }
}

#[cfg(not(any(unix, windows)))]
async fn kill_process_tree(child: &mut Child) {
    let _ = child.start_kill();
}

#[cfg(unix)]
fn request_termination(child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn request_termination(child: &mut Child) {
    let _ = child.start_kill();
}
