//! Worker process supervision.
//!
//! A worker is spawned with piped output. Two reader tasks drain stdout and
//! stderr line by line into the tracing log and a bounded [`LogBuffer`] until
//! the stream closes or a stop signal arrives.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::liveness::{Liveness, ProcessProbe};

/// How long a worker gets to exit after SIGTERM.
pub const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait after SIGKILL.
pub const FORCED_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Bound on joining the output readers.
pub const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Lines kept per sandbox.
pub const LOG_MAX_LINES: usize = 1000;

/// Which output stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl fmt::Display for LogStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogStream::Stdout => write!(f, "stdout"),
            LogStream::Stderr => write!(f, "stderr"),
        }
    }
}

/// One captured line of worker output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub stream: LogStream,
    pub line: String,
    pub timestamp: DateTime<Utc>,
}

/// Bounded, shareable buffer of recent worker output.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    lines: Arc<Mutex<VecDeque<LogLine>>>,
    capacity: usize,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::with_capacity(LOG_MAX_LINES)
    }
}

impl LogBuffer {
    /// Creates a buffer that keeps at most `capacity` lines.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(64)))),
            capacity,
        }
    }

    /// Appends a line, evicting the oldest once full.
    pub fn push(&self, stream: LogStream, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if self.capacity == 0 {
            return;
        }
        while lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(LogLine {
            stream,
            line,
            timestamp: Utc::now(),
        });
    }

    /// Returns a copy of the buffered lines, oldest first.
    pub fn snapshot(&self) -> Vec<LogLine> {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.iter().cloned().collect()
    }

    /// Number of buffered lines.
    pub fn len(&self) -> usize {
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Returns true if nothing has been captured.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What to launch and where.
#[derive(Debug, Clone)]
pub struct LaunchSpec<'a> {
    /// argv; the first element is the program.
    pub command: &'a [String],
    /// Working directory for the worker.
    pub working_dir: &'a Path,
    /// Variables added on top of the inherited environment.
    pub env: &'a HashMap<String, String>,
    /// Tag attached to every captured log line.
    pub log_tag: &'a str,
}

/// A running worker process and its output readers.
///
/// Owned by exactly one lifecycle coordinator.
pub struct ProcessHandle {
    child: Child,
    pid: u32,
    stop_tx: watch::Sender<bool>,
    readers: Vec<JoinHandle<()>>,
    exit_status: Option<ExitStatus>,
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("exit_status", &self.exit_status)
            .finish()
    }
}

/// Spawns the worker and attaches its output readers.
pub fn start(spec: LaunchSpec<'_>, logs: &LogBuffer) -> Result<ProcessHandle> {
    let (program, args) = spec
        .command
        .split_first()
        .ok_or_else(|| Error::Launch("worker command is empty".to_string()))?;

    tracing::info!(
        tag = %spec.log_tag,
        program = %program,
        working_dir = ?spec.working_dir,
        "starting worker process"
    );

    let mut child = Command::new(program)
        .args(args)
        .current_dir(spec.working_dir)
        .envs(spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Launch(format!("failed to spawn {}: {}", program, e)))?;

    let pid = child
        .id()
        .ok_or_else(|| Error::Launch(format!("{} exited before it could be tracked", program)))?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut readers = Vec::with_capacity(2);

    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_reader(
            stdout,
            LogStream::Stdout,
            spec.log_tag.to_string(),
            logs.clone(),
            stop_rx.clone(),
        ));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_reader(
            stderr,
            LogStream::Stderr,
            spec.log_tag.to_string(),
            logs.clone(),
            stop_rx,
        ));
    }

    Ok(ProcessHandle {
        child,
        pid,
        stop_tx,
        readers,
        exit_status: None,
    })
}

fn spawn_reader<R>(
    stream: R,
    kind: LogStream,
    tag: String,
    logs: LogBuffer,
    mut stop_rx: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        tracing::debug!(tag = %tag, stream = %kind, "{}", line);
                        logs.push(kind, line);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(tag = %tag, stream = %kind, error = %e, "output stream error");
                        break;
                    }
                },
            }
        }
    })
}

impl ProcessHandle {
    /// OS process id.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Returns the exit status if the process has exited, reaping it.
    pub fn try_exit_status(&mut self) -> Option<ExitStatus> {
        if self.exit_status.is_none() {
            match self.child.try_wait() {
                Ok(status) => self.exit_status = status,
                Err(e) => {
                    tracing::debug!(pid = self.pid, error = %e, "failed to poll worker process");
                }
            }
        }
        self.exit_status
    }

    /// Returns true once the process has exited.
    pub fn has_exited(&mut self) -> bool {
        self.try_exit_status().is_some()
    }

    /// Liveness of the process, reaping it first so a zombie reads as dead.
    pub fn liveness(&mut self, probe: &dyn ProcessProbe) -> Liveness {
        if self.has_exited() {
            return Liveness::Dead;
        }
        probe.liveness(self.pid)
    }

    /// Stops the readers and terminates the process.
    ///
    /// SIGTERM first, SIGKILL after [`GRACEFUL_STOP_TIMEOUT`]. Calling this on
    /// an exited process only joins the readers.
    pub async fn stop(&mut self) {
        let _ = self.stop_tx.send(true);

        if !self.has_exited() {
            self.terminate().await;
        }

        self.join_readers().await;
    }

    async fn terminate(&mut self) {
        let pid = self.pid;
        if let Ok(raw) = i32::try_from(pid) {
            if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
                tracing::debug!(pid, error = %e, "failed to send SIGTERM");
            }
        }

        match tokio::time::timeout(GRACEFUL_STOP_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.exit_status = Some(status);
                tracing::info!(pid, "worker process stopped");
                return;
            }
            Ok(Err(e)) => tracing::warn!(pid, error = %e, "failed to wait for worker process"),
            Err(_) => tracing::warn!(pid, "worker did not exit after SIGTERM, killing"),
        }

        if let Err(e) = self.child.start_kill() {
            tracing::warn!(pid, error = %e, "failed to kill worker process");
        }
        match tokio::time::timeout(FORCED_STOP_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => self.exit_status = Some(status),
            Ok(Err(e)) => tracing::warn!(pid, error = %e, "failed to wait for killed worker"),
            Err(_) => tracing::error!(pid, "worker did not exit even after SIGKILL"),
        }
    }

    async fn join_readers(&mut self) {
        let deadline = tokio::time::Instant::now() + READER_JOIN_TIMEOUT;
        for mut reader in self.readers.drain(..) {
            if tokio::time::timeout_at(deadline, &mut reader).await.is_err() {
                reader.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::liveness::SignalProbe;
    use std::time::Instant;
    use tempfile::TempDir;

    fn cmd(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn launch(command: &[String], dir: &Path, logs: &LogBuffer) -> Result<ProcessHandle> {
        let env = HashMap::from([("GREETING".to_string(), "hello".to_string())]);
        start(
            LaunchSpec {
                command,
                working_dir: dir,
                env: &env,
                log_tag: "test",
            },
            logs,
        )
    }

    async fn wait_for_lines(logs: &LogBuffer, count: usize) {
        for _ in 0..50 {
            if logs.len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[test]
    fn log_buffer_evicts_oldest() {
        let logs = LogBuffer::with_capacity(2);
        logs.push(LogStream::Stdout, "one".to_string());
        logs.push(LogStream::Stdout, "two".to_string());
        logs.push(LogStream::Stderr, "three".to_string());

        let lines = logs.snapshot();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].line, "two");
        assert_eq!(lines[1].line, "three");
        assert_eq!(lines[1].stream, LogStream::Stderr);
    }

    #[tokio::test]
    async fn empty_command_is_launch_error() {
        let dir = TempDir::new().unwrap();
        let err = launch(&[], dir.path(), &LogBuffer::default()).unwrap_err();
        assert!(matches!(err, Error::Launch(_)));
    }

    #[tokio::test]
    async fn missing_program_is_launch_error() {
        let dir = TempDir::new().unwrap();
        let err = launch(
            &cmd(&["definitely-not-a-real-binary-4f1c"]),
            dir.path(),
            &LogBuffer::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Launch(_)));
    }

    #[tokio::test]
    async fn captures_both_streams_with_env_and_cwd() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "present").unwrap();
        let logs = LogBuffer::default();

        let mut handle = launch(
            &cmd(&["sh", "-c", "echo $GREETING; cat marker.txt; echo; echo oops >&2"]),
            dir.path(),
            &logs,
        )
        .expect("failed to start");

        wait_for_lines(&logs, 3).await;
        handle.stop().await;

        let lines = logs.snapshot();
        assert!(lines
            .iter()
            .any(|l| l.stream == LogStream::Stdout && l.line == "hello"));
        assert!(lines
            .iter()
            .any(|l| l.stream == LogStream::Stdout && l.line == "present"));
        assert!(lines
            .iter()
            .any(|l| l.stream == LogStream::Stderr && l.line == "oops"));
    }

    #[tokio::test]
    async fn stop_terminates_running_process() {
        let dir = TempDir::new().unwrap();
        let mut handle =
            launch(&cmd(&["sleep", "30"]), dir.path(), &LogBuffer::default()).unwrap();
        let pid = handle.pid();

        assert_eq!(handle.liveness(&SignalProbe), Liveness::Alive);

        let started = Instant::now();
        handle.stop().await;

        assert!(started.elapsed() < GRACEFUL_STOP_TIMEOUT);
        assert!(handle.has_exited());
        assert_eq!(SignalProbe.liveness(pid), Liveness::Dead);
    }

    #[tokio::test]
    async fn stop_kills_process_ignoring_sigterm() {
        let dir = TempDir::new().unwrap();
        let mut handle = launch(
            &cmd(&["sh", "-c", "trap '' TERM; while true; do sleep 1; done"]),
            dir.path(),
            &LogBuffer::default(),
        )
        .unwrap();

        // Give the shell time to install its trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = Instant::now();
        handle.stop().await;
        let elapsed = started.elapsed();

        assert!(handle.has_exited());
        assert!(elapsed >= GRACEFUL_STOP_TIMEOUT);
        assert!(elapsed < GRACEFUL_STOP_TIMEOUT + FORCED_STOP_TIMEOUT + READER_JOIN_TIMEOUT);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut handle =
            launch(&cmd(&["sleep", "30"]), dir.path(), &LogBuffer::default()).unwrap();

        handle.stop().await;
        handle.stop().await;
        assert!(handle.has_exited());
    }

    #[tokio::test]
    async fn exited_process_reads_as_dead() {
        let dir = TempDir::new().unwrap();
        let mut handle =
            launch(&cmd(&["sh", "-c", "exit 4"]), dir.path(), &LogBuffer::default()).unwrap();

        for _ in 0..50 {
            if handle.has_exited() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(handle.liveness(&SignalProbe), Liveness::Dead);
        assert_eq!(handle.try_exit_status().and_then(|s| s.code()), Some(4));
    }
}
