//! Backend process invocation.
//!
//! Launches the runner, streams both pipes concurrently into on-disk logs,
//! bounded ring buffers, and the event parser, and polices the process with
//! a total timeout and a no-output watchdog. Kill escalation is soft
//! (SIGTERM on Unix), a grace wait, then hard kill.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{RunnerError, RunnerResult};
use crate::cancel::CancellationToken;
use crate::events::{AttemptEvents, EventParser, RunnerEvent, StreamName};

/// Poll interval for the supervision loop.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Ring buffer head/tail bounds. Verbose backends emit hundreds of
/// thousands of lines; only the opening and the most recent lines matter
/// for diagnostics.
const RING_HEAD_LINES: usize = 100;
const RING_TAIL_LINES: usize = 200;

/// One backend invocation to supervise.
#[derive(Debug, Clone)]
pub struct InvocationSpec {
    /// Full argv, already resolved (interpreter, wrappers, arguments).
    pub argv: Vec<String>,
    /// Working directory (the backend root).
    pub cwd: PathBuf,
    /// Directory prepended to the interpreter's module search path
    /// (`PYTHONPATH`) so the bundled runner script is importable.
    pub source_root: Option<PathBuf>,
    /// Total wall-clock budget.
    pub timeout: Duration,
    /// Kill if neither stream produces output for this long.
    pub watchdog: Duration,
    /// Soft-kill grace before the hard kill.
    pub grace: Duration,
}

/// Why an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Process exited on its own.
    Exited,
    /// Total timeout exceeded.
    TimedOut,
    /// No-output watchdog fired.
    Stalled,
    /// Cancellation token was set.
    Cancelled,
}

/// Result of one supervised invocation.
#[derive(Debug)]
pub struct InvocationResult {
    pub status_code: Option<i32>,
    pub end_reason: EndReason,
    pub events: AttemptEvents,
    pub stdout_excerpt: Vec<String>,
    pub stderr_excerpt: Vec<String>,
    pub duration: Duration,
}

impl InvocationResult {
    /// Whether the backend finished successfully.
    pub fn success(&self) -> bool {
        self.end_reason == EndReason::Exited && self.status_code == Some(0)
    }
}

/// Head+tail ring buffer over log lines.
struct RingBuffer {
    head: Vec<String>,
    tail: VecDeque<String>,
    dropped: u64,
}

impl RingBuffer {
    fn new() -> Self {
        Self {
            head: Vec::new(),
            tail: VecDeque::new(),
            dropped: 0,
        }
    }

    fn push(&mut self, line: &str) {
        if self.head.len() < RING_HEAD_LINES {
            self.head.push(line.to_string());
            return;
        }
        if self.tail.len() == RING_TAIL_LINES {
            self.tail.pop_front();
            self.dropped += 1;
        }
        self.tail.push_back(line.to_string());
    }

    fn excerpt(self) -> Vec<String> {
        let mut lines = self.head;
        if self.dropped > 0 {
            lines.push(format!("... {} lines omitted ...", self.dropped));
        }
        lines.extend(self.tail);
        lines
    }
}

struct StreamState {
    events: Vec<RunnerEvent>,
    last_output: Instant,
}

/// Run one invocation to completion (or kill), streaming as we go.
pub fn invoke(
    spec: &InvocationSpec,
    parser: &EventParser,
    cancel: &CancellationToken,
    stdout_log: &Path,
    stderr_log: &Path,
) -> RunnerResult<InvocationResult> {
    let start = Instant::now();
    debug!(argv = ?spec.argv, cwd = %spec.cwd.display(), "launching backend");

    let mut command = Command::new(&spec.argv[0]);
    command
        .args(&spec.argv[1..])
        .current_dir(&spec.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(source_root) = &spec.source_root {
        command.env("PYTHONPATH", prepend_search_path(source_root));
    }

    let mut child = command.spawn().map_err(|source| RunnerError::Launch {
        program: spec.argv[0].clone(),
        source,
    })?;

    let shared = Arc::new(Mutex::new(StreamState {
        events: Vec::new(),
        last_output: Instant::now(),
    }));

    let stdout_pipe = child.stdout.take().expect("stdout piped");
    let stderr_pipe = child.stderr.take().expect("stderr piped");

    let stdout_handle = spawn_reader(
        stdout_pipe,
        StreamName::Stdout,
        stdout_log.to_path_buf(),
        parser.clone(),
        Arc::clone(&shared),
    )?;
    let stderr_handle = spawn_reader(
        stderr_pipe,
        StreamName::Stderr,
        stderr_log.to_path_buf(),
        parser.clone(),
        Arc::clone(&shared),
    )?;

    // Supervision loop: exit, cancellation, timeout, stall - in that order.
    let mut end_reason = EndReason::Exited;
    let status = loop {
        if let Some(status) = child.try_wait().map_err(|source| RunnerError::Io {
            path: PathBuf::from(&spec.argv[0]),
            source,
        })? {
            break Some(status);
        }

        if cancel.is_cancelled() {
            end_reason = EndReason::Cancelled;
            kill_with_grace(&mut child, spec.grace);
            break None;
        }
        if start.elapsed() > spec.timeout {
            warn!(argv = ?spec.argv, "backend exceeded total timeout");
            end_reason = EndReason::TimedOut;
            kill_with_grace(&mut child, spec.grace);
            break None;
        }
        let stalled = shared.lock().last_output.elapsed() > spec.watchdog;
        if stalled {
            warn!(argv = ?spec.argv, "backend produced no output within watchdog");
            end_reason = EndReason::Stalled;
            kill_with_grace(&mut child, spec.grace);
            break None;
        }

        std::thread::sleep(POLL_INTERVAL);
    };

    let status = match status {
        Some(status) => Some(status),
        None => child
            .wait()
            .map_err(|source| RunnerError::Io {
                path: PathBuf::from(&spec.argv[0]),
                source,
            })
            .ok(),
    };

    let stdout_excerpt = stdout_handle
        .join()
        .unwrap_or_else(|_| Vec::new());
    let stderr_excerpt = stderr_handle
        .join()
        .unwrap_or_else(|_| Vec::new());

    let events = {
        let mut state = shared.lock();
        AttemptEvents {
            events: std::mem::take(&mut state.events),
        }
    };

    Ok(InvocationResult {
        status_code: status.and_then(|s| s.code()),
        end_reason,
        events,
        stdout_excerpt,
        stderr_excerpt,
        duration: start.elapsed(),
    })
}

/// `<source_root><sep><existing PYTHONPATH>`.
fn prepend_search_path(source_root: &Path) -> String {
    let sep = if cfg!(windows) { ';' } else { ':' };
    match std::env::var("PYTHONPATH") {
        Ok(existing) if !existing.is_empty() => {
            format!("{}{}{}", source_root.display(), sep, existing)
        }
        _ => source_root.display().to_string(),
    }
}

fn spawn_reader<R>(
    pipe: R,
    stream: StreamName,
    log_path: PathBuf,
    parser: EventParser,
    shared: Arc<Mutex<StreamState>>,
) -> RunnerResult<std::thread::JoinHandle<Vec<String>>>
where
    R: std::io::Read + Send + 'static,
{
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|source| RunnerError::Io {
            path: log_path.clone(),
            source,
        })?;

    Ok(std::thread::spawn(move || {
        let mut writer = std::io::BufWriter::new(log_file);
        let mut ring = RingBuffer::new();
        let mut line_no = 0u64;

        for line in BufReader::new(pipe).lines() {
            let Ok(line) = line else { break };
            line_no += 1;
            let _ = writeln!(writer, "{line}");
            ring.push(&line);

            let ts = chrono::Utc::now().to_rfc3339();
            let event = parser.parse_line(ts, stream, line_no, &line);
            let mut state = shared.lock();
            state.last_output = Instant::now();
            state.events.push(event);
        }
        let _ = writer.flush();
        ring.excerpt()
    }))
}

/// Soft kill, bounded wait, hard kill.
fn kill_with_grace(child: &mut Child, grace: Duration) {
    soft_kill(child);
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) => std::thread::sleep(POLL_INTERVAL),
            Err(_) => break,
        }
    }
    let _ = child.kill();
}

#[cfg(unix)]
fn soft_kill(child: &Child) {
    unsafe {
        libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn soft_kill(child: &Child) {
    // No soft-kill signal on this platform; the grace loop falls through to
    // the hard kill.
    let _ = child;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn spec(argv: &[&str], temp: &TempDir) -> InvocationSpec {
        InvocationSpec {
            argv: argv.iter().map(|s| s.to_string()).collect(),
            cwd: temp.path().to_path_buf(),
            source_root: None,
            timeout: Duration::from_secs(10),
            watchdog: Duration::from_secs(10),
            grace: Duration::from_millis(200),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_successful_invocation_collects_events() {
        let temp = TempDir::new().unwrap();
        let spec = spec(
            &["sh", "-c", "echo 'Step 1 : vector data'; echo 'Time for this tile: 1s'"],
            &temp,
        );
        let result = invoke(
            &spec,
            &EventParser::new(),
            &CancellationToken::new(),
            &temp.path().join("out.log"),
            &temp.path().join("err.log"),
        )
        .unwrap();

        assert!(result.success());
        assert!(result.events.saw_success());
        assert_eq!(result.events.events.len(), 2);

        let logged = std::fs::read_to_string(temp.path().join("out.log")).unwrap();
        assert!(logged.contains("Step 1"));
    }

    #[cfg(unix)]
    #[test]
    fn test_nonzero_exit_is_not_success() {
        let temp = TempDir::new().unwrap();
        let spec = spec(&["sh", "-c", "echo oops >&2; exit 3"], &temp);
        let result = invoke(
            &spec,
            &EventParser::new(),
            &CancellationToken::new(),
            &temp.path().join("out.log"),
            &temp.path().join("err.log"),
        )
        .unwrap();

        assert!(!result.success());
        assert_eq!(result.status_code, Some(3));
        assert_eq!(result.end_reason, EndReason::Exited);
        let err = std::fs::read_to_string(temp.path().join("err.log")).unwrap();
        assert!(err.contains("oops"));
    }

    #[cfg(unix)]
    #[test]
    fn test_watchdog_kills_silent_process() {
        let temp = TempDir::new().unwrap();
        let mut spec = spec(&["sleep", "30"], &temp);
        spec.watchdog = Duration::from_millis(300);
        let result = invoke(
            &spec,
            &EventParser::new(),
            &CancellationToken::new(),
            &temp.path().join("out.log"),
            &temp.path().join("err.log"),
        )
        .unwrap();

        assert!(!result.success());
        assert_eq!(result.end_reason, EndReason::Stalled);
    }

    #[cfg(unix)]
    #[test]
    fn test_cancellation_kills_process() {
        let temp = TempDir::new().unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let result = invoke(
            &spec(&["sleep", "30"], &temp),
            &EventParser::new(),
            &token,
            &temp.path().join("out.log"),
            &temp.path().join("err.log"),
        )
        .unwrap();
        assert_eq!(result.end_reason, EndReason::Cancelled);
    }

    #[test]
    fn test_ring_buffer_keeps_head_and_tail() {
        let mut ring = RingBuffer::new();
        for i in 0..500 {
            ring.push(&format!("line {i}"));
        }
        let excerpt = ring.excerpt();
        assert_eq!(excerpt.first().unwrap(), "line 0");
        assert_eq!(excerpt.last().unwrap(), "line 499");
        assert!(excerpt.iter().any(|l| l.contains("lines omitted")));
        assert!(excerpt.len() <= RING_HEAD_LINES + RING_TAIL_LINES + 1);
    }
}
