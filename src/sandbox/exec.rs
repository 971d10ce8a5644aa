//! Command execution with process-group cleanup.
//!
//! The child leads its own process group. On timeout the whole group gets
//! SIGTERM, then SIGKILL after the grace period, so shells that fork helpers
//! cannot leave them running. Members still alive after a normal exit are
//! killed as well.
//!
//! A process that escaped the group (e.g. via `setsid`) can keep the output
//! pipes open. Output collection is therefore bounded too: readers still
//! running after the drain window are aborted and whatever they captured so
//! far is returned, flagged as truncated.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

/// `rc` reported when the command was killed for running past its timeout.
pub const TIMEOUT_RC: i32 = -1;

/// Lower bound on how long output readers may keep draining after the
/// process group is gone.
const MIN_DRAIN: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    pub timeout: Duration,
    pub sudo: bool,
}

impl ExecRequest {
    /// argv as it will be spawned; `sudo -n` is prepended when requested.
    pub fn command_line(&self) -> Vec<String> {
        let already_sudo = self
            .argv
            .first()
            .is_some_and(|a| crate::models::operation::command_name(a) == "sudo");
        if self.sudo && !already_sudo {
            let mut argv = vec!["sudo".to_string(), "-n".to_string()];
            argv.extend(self.argv.iter().cloned());
            argv
        } else {
            self.argv.clone()
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ExecOutcome {
    pub rc: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub timed_out: bool,
    pub truncated: bool,
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("command is empty")]
    EmptyCommand,
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed waiting for command: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, req: ExecRequest) -> Result<ExecOutcome, ExecError>;
}

pub struct ProcessGroupRunner {
    kill_grace: Duration,
    max_output_bytes: usize,
}

impl ProcessGroupRunner {
    pub fn new(kill_grace: Duration, max_output_bytes: usize) -> Self {
        Self {
            kill_grace,
            max_output_bytes,
        }
    }
}

#[async_trait]
impl CommandRunner for ProcessGroupRunner {
    async fn run(&self, req: ExecRequest) -> Result<ExecOutcome, ExecError> {
        let argv = req.command_line();
        let (program, args) = argv.split_first().ok_or(ExecError::EmptyCommand)?;

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&req.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let started = Instant::now();
        let mut child = command.spawn().map_err(|source| ExecError::Spawn {
            program: program.clone(),
            source,
        })?;
        let pid = child.id();

        tracing::debug!(pid = ?pid, program = %program, cwd = %req.cwd.display(), "command started");

        let limit = self.max_output_bytes;
        let stdout = child.stdout.take().map(|s| OutputReader::spawn(s, limit));
        let stderr = child.stderr.take().map(|s| OutputReader::spawn(s, limit));

        let waited = tokio::time::timeout(req.timeout, child.wait()).await;
        let (status, timed_out) = match waited {
            Ok(status) => {
                let status = status?;
                // Anything the command left behind in its group goes too.
                kill_group(pid, &mut child, Signal::Kill);
                (status, false)
            }
            Err(_) => {
                tracing::warn!(
                    pid = ?pid,
                    timeout_ms = req.timeout.as_millis() as u64,
                    "command timed out; terminating process group"
                );
                (self.terminate(pid, &mut child).await?, true)
            }
        };

        let drain = self.kill_grace.max(MIN_DRAIN);
        let ((stdout, out_truncated), (stderr, err_truncated)) =
            tokio::join!(collect(stdout, drain, pid), collect(stderr, drain, pid));

        let rc = if timed_out { TIMEOUT_RC } else { exit_code(status) };
        Ok(ExecOutcome {
            rc,
            stdout,
            stderr,
            duration_ms: started.elapsed().as_millis() as u64,
            timed_out,
            truncated: out_truncated || err_truncated,
        })
    }
}

impl ProcessGroupRunner {
    async fn terminate(&self, pid: Option<u32>, child: &mut Child) -> std::io::Result<ExitStatus> {
        kill_group(pid, child, Signal::Term);
        let waited = tokio::time::timeout(self.kill_grace, child.wait()).await;
        match waited {
            Ok(status) => {
                kill_group(pid, child, Signal::Kill);
                status
            }
            Err(_) => {
                tracing::warn!(pid = ?pid, "process group ignored SIGTERM; sending SIGKILL");
                kill_group(pid, child, Signal::Kill);
                child.wait().await
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>, _child: &mut Child, signal: Signal) {
    let Some(pid) = pid else {
        return;
    };
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: killpg only sends a signal; the group id is the child's pid
    // because it was spawned with process_group(0).
    let rc = unsafe { libc::killpg(pid as libc::pid_t, sig) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            tracing::debug!(pid = pid, error = %err, "killpg failed");
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>, child: &mut Child, _signal: Signal) {
    let _ = child.start_kill();
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(TIMEOUT_RC)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(TIMEOUT_RC)
}

#[derive(Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

/// Background reader for one output pipe. The buffer is shared so a reader
/// that never sees EOF can be abandoned without losing what it already read.
struct OutputReader {
    task: JoinHandle<()>,
    sink: Arc<Mutex<Captured>>,
}

impl OutputReader {
    fn spawn<R>(stream: R, limit: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let sink = Arc::new(Mutex::new(Captured::default()));
        let task = tokio::spawn(read_capped(stream, limit, sink.clone()));
        Self { task, sink }
    }
}

/// Read the whole stream so the child never blocks on a full pipe, keeping
/// at most `limit` bytes.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, limit: usize, sink: Arc<Mutex<Captured>>) {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let mut captured = sink.lock();
                let room = limit.saturating_sub(captured.bytes.len());
                if n > room {
                    captured.truncated = true;
                }
                captured.bytes.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
}

/// Wait up to `drain` for the reader to hit EOF, then render its output.
async fn collect(reader: Option<OutputReader>, drain: Duration, pid: Option<u32>) -> (String, bool) {
    let Some(OutputReader { mut task, sink }) = reader else {
        return (String::new(), false);
    };
    let abandoned = tokio::time::timeout(drain, &mut task).await.is_err();
    if abandoned {
        task.abort();
        tracing::warn!(
            pid = ?pid,
            "output pipe still held open after the process group exited; abandoning reader"
        );
    }

    let Captured { bytes, truncated } = std::mem::take(&mut *sink.lock());
    let mut text = String::from_utf8_lossy(&bytes).into_owned();
    if truncated {
        text.push_str(&format!("\n[... output truncated at {} bytes ...]", bytes.len()));
    } else if abandoned {
        text.push_str("\n[... output incomplete: pipe held open by a detached process ...]");
    }
    (text, truncated || abandoned)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn req(argv: &[&str], timeout: Duration) -> ExecRequest {
        ExecRequest {
            argv: argv.iter().map(|s| s.to_string()).collect(),
            cwd: std::env::temp_dir(),
            timeout,
            sudo: false,
        }
    }

    fn runner() -> ProcessGroupRunner {
        ProcessGroupRunner::new(Duration::from_millis(200), 1024)
    }

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let out = runner()
            .run(req(&["sh", "-c", "echo out; echo err >&2; exit 3"], Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(out.rc, 3);
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
        assert!(!out.timed_out);
    }

    #[tokio::test]
    async fn timeout_yields_sentinel() {
        let started = Instant::now();
        let out = runner()
            .run(req(&["sleep", "10"], Duration::from_millis(300)))
            .await
            .unwrap();
        assert_eq!(out.rc, TIMEOUT_RC);
        assert!(out.timed_out);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn output_is_truncated_with_marker() {
        let out = runner()
            .run(req(&["sh", "-c", "head -c 5000 /dev/zero | tr '\\0' a"], Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(out.truncated);
        assert!(out.stdout.starts_with(&"a".repeat(1024)));
        assert!(out.stdout.contains("output truncated"));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn detached_pipe_holder_does_not_stall_timeout() {
        let started = Instant::now();
        let out = runner()
            .run(req(
                &["sh", "-c", "echo started; setsid sleep 6 & sleep 30"],
                Duration::from_secs(1),
            ))
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(4), "took {:?}", started.elapsed());
        assert!(out.timed_out);
        assert_eq!(out.rc, TIMEOUT_RC);
        assert!(out.truncated);
        assert!(out.stdout.starts_with("started"));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn detached_pipe_holder_does_not_stall_normal_exit() {
        let started = Instant::now();
        let out = runner()
            .run(req(&["sh", "-c", "setsid sleep 6 & echo done"], Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
        assert!(!out.timed_out);
        assert_eq!(out.rc, 0);
        assert!(out.truncated);
        assert!(out.stdout.starts_with("done"));
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let err = runner()
            .run(req(&["/nonexistent/hostgate-test-binary"], Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }

    #[test]
    fn sudo_prefix() {
        let mut r = req(&["ls", "/"], Duration::from_secs(1));
        r.sudo = true;
        assert_eq!(r.command_line(), vec!["sudo", "-n", "ls", "/"]);
        let mut r = req(&["sudo", "ls"], Duration::from_secs(1));
        r.sudo = true;
        assert_eq!(r.command_line(), vec!["sudo", "ls"]);
    }
}
