//! Supervised subprocess execution.
//!
//! [`ProcessRunner::run`] spawns one external tool and streams its merged
//! stdout/stderr into two sinks: a per-stage log file holding everything,
//! and a bounded in-memory tail of the last N lines. Memory use is bounded
//! regardless of how much the tool prints.
//!
//! A watchdog ticks on a fixed short interval while the child runs and
//! checks the job's [`CancellationToken`] and the stage deadline. Either one
//! kills the child's whole process group, so a tool that stays silent for
//! minutes is still stopped promptly.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::CommandLine;

/// Lines longer than this are cut and marked.
const MAX_LINE_BYTES: usize = 8 * 1024;

/// Read buffer size for each output pipe.
const READ_CHUNK_BYTES: usize = 8 * 1024;

/// How long to wait for a killed child to be reaped.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// How long to wait for output pipes to close after the child is gone.
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

const TRUNCATED_MARKER: &str = " [line truncated]";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One external command invocation.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub command: CommandLine,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
    /// Full output log. Created (truncated) on every run.
    pub log_path: PathBuf,
}

/// Result of a command that exited with status zero.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub tail: Vec<String>,
    pub log_path: PathBuf,
    pub duration: Duration,
}

/// Why a supervised command did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out after {}s", elapsed.as_secs())]
    Timeout { elapsed: Duration, tail: Vec<String> },

    #[error("cancelled")]
    Cancelled { tail: Vec<String> },

    #[error("exited with {}", describe_code(*code))]
    ToolFailure { code: Option<i32>, tail: Vec<String> },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProcessError {
    /// Captured output tail, empty when the tool never ran.
    pub fn tail(&self) -> &[String] {
        match self {
            Self::Timeout { tail, .. } | Self::Cancelled { tail } | Self::ToolFailure { tail, .. } => {
                tail.as_slice()
            }
            Self::Spawn { .. } | Self::Io(_) => &[],
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

fn describe_code(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "a signal".to_string(),
    }
}

enum Outcome {
    Exited(ExitStatus),
    Cancelled,
    TimedOut,
}

enum Event {
    Exited(std::io::Result<ExitStatus>),
    Tick,
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Spawns commands under a cancellation and timeout watchdog.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    watchdog_interval: Duration,
    tail_lines: usize,
}

impl ProcessRunner {
    pub fn new(watchdog_interval: Duration, tail_lines: usize) -> Self {
        Self {
            watchdog_interval,
            tail_lines: tail_lines.max(1),
        }
    }

    /// Run `spec` to completion, timeout, or cancellation.
    pub async fn run(
        &self,
        spec: &CommandSpec,
        token: &CancellationToken,
    ) -> Result<ProcessOutput, ProcessError> {
        self.run_observed(spec, token, None).await
    }

    /// Like [`Self::run`], additionally publishing every output line to
    /// `latest_line` as it arrives.
    pub async fn run_observed(
        &self,
        spec: &CommandSpec,
        token: &CancellationToken,
        latest_line: Option<watch::Sender<String>>,
    ) -> Result<ProcessOutput, ProcessError> {
        if token.is_cancelled() {
            return Err(ProcessError::Cancelled { tail: Vec::new() });
        }

        if let Some(parent) = spec.log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let log_file = File::create(&spec.log_path).await?;

        let mut cmd = Command::new(&spec.command.program);
        cmd.args(&spec.command.args)
            .current_dir(&spec.cwd)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group so the watchdog can kill grandchildren too.
        #[cfg(unix)]
        cmd.process_group(0);

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: spec.command.program.clone(),
            source,
        })?;

        tracing::debug!(
            command = %spec.command,
            cwd = %spec.cwd.display(),
            pid = child.id(),
            "Spawned subprocess"
        );

        let (line_tx, line_rx) = mpsc::channel::<String>(256);
        let readers = [
            tokio::spawn(pump_lines(child.stdout.take(), line_tx.clone())),
            tokio::spawn(pump_lines(child.stderr.take(), line_tx)),
        ];
        let reader_aborts: Vec<_> = readers.iter().map(|h| h.abort_handle()).collect();
        let collector = tokio::spawn(collect_lines(
            line_rx,
            log_file,
            self.tail_lines,
            latest_line,
        ));

        let mut watchdog = tokio::time::interval(self.watchdog_interval);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            let event = tokio::select! {
                status = child.wait() => Event::Exited(status),
                _ = watchdog.tick() => Event::Tick,
            };
            match event {
                Event::Exited(status) => match status {
                    Ok(status) => break Ok(Outcome::Exited(status)),
                    Err(e) => break Err(e),
                },
                Event::Tick => {
                    if token.is_cancelled() {
                        terminate(&mut child).await;
                        break Ok(Outcome::Cancelled);
                    }
                    if start.elapsed() >= spec.timeout {
                        terminate(&mut child).await;
                        break Ok(Outcome::TimedOut);
                    }
                }
            }
        };

        // A surviving grandchild can hold the pipes open; don't wait forever.
        let drain = async {
            for reader in readers {
                let _ = reader.await;
            }
        };
        if tokio::time::timeout(PIPE_DRAIN_TIMEOUT, drain).await.is_err() {
            tracing::warn!(command = %spec.command, "Output pipes still open after exit, abandoning");
            for handle in reader_aborts {
                handle.abort();
            }
        }
        let tail = collector.await.unwrap_or_default();
        let elapsed = start.elapsed();

        match outcome? {
            Outcome::Exited(status) if status.success() => Ok(ProcessOutput {
                tail,
                log_path: spec.log_path.clone(),
                duration: elapsed,
            }),
            Outcome::Exited(status) => Err(ProcessError::ToolFailure {
                code: status.code(),
                tail,
            }),
            Outcome::Cancelled => Err(ProcessError::Cancelled { tail }),
            Outcome::TimedOut => Err(ProcessError::Timeout { elapsed, tail }),
        }
    }
}

/// Kill the child and everything in its process group, then reap it.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: killpg has no memory-safety preconditions. The group id is
        // the child's pid because it was spawned with process_group(0).
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGKILL);
        }
    }
    if let Err(e) = child.start_kill() {
        tracing::debug!(error = %e, "start_kill on exited child");
    }
    if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
        tracing::warn!(pid = child.id(), "Child did not exit after SIGKILL");
    }
}

// ---------------------------------------------------------------------------
// Output plumbing
// ---------------------------------------------------------------------------

/// Read one pipe to EOF and forward complete lines.
async fn pump_lines<R: AsyncRead + Unpin>(handle: Option<R>, tx: mpsc::Sender<String>) {
    let Some(mut reader) = handle else {
        return;
    };
    let mut assembler = LineAssembler::new(MAX_LINE_BYTES);
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];
    let mut lines = Vec::new();
    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        assembler.push(&chunk[..n], &mut lines);
        for line in lines.drain(..) {
            if tx.send(line).await.is_err() {
                return;
            }
        }
    }
    if let Some(rest) = assembler.finish() {
        let _ = tx.send(rest).await;
    }
}

/// Append every line to the log file and keep the last `tail_lines`.
async fn collect_lines(
    mut rx: mpsc::Receiver<String>,
    log_file: File,
    tail_lines: usize,
    latest_line: Option<watch::Sender<String>>,
) -> Vec<String> {
    let mut writer = BufWriter::new(log_file);
    let mut tail = LogTail::new(tail_lines);
    let mut log_ok = true;
    while let Some(line) = rx.recv().await {
        if log_ok {
            let written = async {
                writer.write_all(line.as_bytes()).await?;
                writer.write_all(b"\n").await
            };
            if let Err(e) = written.await {
                tracing::warn!(error = %e, "Stage log write failed, continuing without log");
                log_ok = false;
            }
        }
        if let Some(tx) = &latest_line {
            tx.send_replace(line.clone());
        }
        tail.push(line);
    }
    if let Err(e) = writer.flush().await {
        tracing::warn!(error = %e, "Stage log flush failed");
    }
    tail.into_lines()
}

/// Ring buffer of the most recent output lines.
#[derive(Debug)]
pub struct LogTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl LogTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn into_lines(self) -> Vec<String> {
        self.lines.into()
    }
}

/// Splits a byte stream into lines of bounded length.
struct LineAssembler {
    buf: Vec<u8>,
    max_len: usize,
    overflowed: bool,
}

impl LineAssembler {
    fn new(max_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_len,
            overflowed: false,
        }
    }

    fn push(&mut self, mut chunk: &[u8], out: &mut Vec<String>) {
        while !chunk.is_empty() {
            let (segment, complete) = match chunk.iter().position(|&b| b == b'\n') {
                Some(pos) => (&chunk[..pos], Some(pos + 1)),
                None => (chunk, None),
            };
            let room = self.max_len.saturating_sub(self.buf.len());
            if segment.len() > room {
                self.buf.extend_from_slice(&segment[..room]);
                self.overflowed = true;
            } else {
                self.buf.extend_from_slice(segment);
            }
            match complete {
                Some(consumed) => {
                    out.push(self.take_line());
                    chunk = &chunk[consumed..];
                }
                None => break,
            }
        }
    }

    fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() && !self.overflowed {
            None
        } else {
            Some(self.take_line())
        }
    }

    fn take_line(&mut self) -> String {
        if self.buf.last() == Some(&b'\r') {
            self.buf.pop();
        }
        let mut line = String::from_utf8_lossy(&self.buf).into_owned();
        if self.overflowed {
            line.push_str(TRUNCATED_MARKER);
        }
        self.buf.clear();
        self.overflowed = false;
        line
    }
}


#[cfg(all(test, unix))]
mod unix_tests {
    use super::*;
    use assert_matches::assert_matches;

    fn spec(dir: &tempfile::TempDir, script: &str, timeout: Duration) -> CommandSpec {
        CommandSpec {
            command: CommandLine::new("sh", ["-c", script]),
            cwd: dir.path().to_path_buf(),
            env: vec![("BRANDKIT_TEST".into(), "1".into())],
            timeout,
            log_path: dir.path().join("logs").join("stage.log"),
        }
    }

    fn runner() -> ProcessRunner {
        ProcessRunner::new(Duration::from_millis(20), 10)
    }

    #[tokio::test]
    async fn success_keeps_bounded_tail_and_full_log() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spec = spec(&dir, "i=1; while [ $i -le 200 ]; do echo line$i; i=$((i+1)); done", Duration::from_secs(10));
        let output = runner().run(&spec, &CancellationToken::new()).await.expect("success");

        assert_eq!(output.tail.len(), 10);
        assert_eq!(output.tail.last().map(String::as_str), Some("line200"));
        let log = std::fs::read_to_string(&output.log_path).expect("log written");
        assert_eq!(log.lines().count(), 200);
    }

    #[tokio::test]
    async fn env_and_cwd_are_applied() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spec = spec(&dir, "echo $BRANDKIT_TEST; pwd", Duration::from_secs(10));
        let output = runner().run(&spec, &CancellationToken::new()).await.expect("success");
        assert_eq!(output.tail[0], "1");
        let expected = dir.path().canonicalize().expect("canonical");
        let reported = PathBuf::from(&output.tail[1]).canonicalize().expect("canonical");
        assert_eq!(reported, expected);
    }

    #[tokio::test]
    async fn non_zero_exit_is_tool_failure_with_tail() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spec = spec(&dir, "echo boom >&2; exit 3", Duration::from_secs(10));
        let result = runner().run(&spec, &CancellationToken::new()).await;
        assert_matches!(result, Err(ProcessError::ToolFailure { code: Some(3), tail }) if tail == vec!["boom"]);
    }

    #[tokio::test]
    async fn silent_child_times_out() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spec = spec(&dir, "echo starting; sleep 30", Duration::from_millis(300));
        let started = Instant::now();
        let result = runner().run(&spec, &CancellationToken::new()).await;
        assert_matches!(result, Err(ProcessError::Timeout { tail, .. }) if tail == vec!["starting"]);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn cancel_kills_silent_process_group() {
        let dir = tempfile::tempdir().expect("tempdir");
        // The backgrounded sleep inherits the pipes; only a group kill frees them.
        let spec = spec(&dir, "sleep 30 & sleep 30; wait", Duration::from_secs(60));
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let result = runner().run(&spec, &token).await;
        assert_matches!(result, Err(ProcessError::Cancelled { .. }));
        assert!(started.elapsed() < Duration::from_secs(5), "took {:?}", started.elapsed());
    }

    #[tokio::test]
    async fn cancelled_token_never_spawns() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spec = spec(&dir, "touch spawned", Duration::from_secs(10));
        let token = CancellationToken::new();
        token.cancel();
        let result = runner().run(&spec, &token).await;
        assert_matches!(result, Err(ProcessError::Cancelled { tail }) if tail.is_empty());
        assert!(!dir.path().join("spawned").exists());
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut spec = spec(&dir, "", Duration::from_secs(1));
        spec.command = CommandLine::new("/nonexistent/brandkit-tool", Vec::<String>::new());
        let result = runner().run(&spec, &CancellationToken::new()).await;
        assert_matches!(result, Err(ProcessError::Spawn { program, .. }) if program == "/nonexistent/brandkit-tool");
    }

    #[tokio::test]
    async fn observer_sees_latest_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spec = spec(&dir, "echo first; echo second", Duration::from_secs(10));
        let (tx, rx) = watch::channel(String::new());
        runner()
            .run_observed(&spec, &CancellationToken::new(), Some(tx))
            .await
            .expect("success");
        assert_eq!(*rx.borrow(), "second");
    }
}
