use std::{
    io::Read,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::{
        Arc, mpsc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::{Duration, Instant},
};

use chrono::Utc;
use tracing::{debug, warn};

use crate::error::{KilnError, KilnResult};

/// Job-level cancellation signal, checked between phases, between frames and
/// inside the supervisor's poll loop. Cloning shares the flag.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> KilnResult<()> {
        if self.is_cancelled() {
            return Err(KilnError::Cancelled);
        }
        Ok(())
    }
}

/// Structured command descriptor: executable plus argument list.
///
/// Job parameters cross the process boundary via files named in `args`,
/// never via interpolated script text.
#[derive(Clone, Debug)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// One-line rendering for logs.
    pub fn display_line(&self) -> String {
        let mut line = self.program.display().to_string();
        for a in &self.args {
            line.push(' ');
            line.push_str(a);
        }
        line
    }
}

/// Outcome of one supervised execution, after all restart attempts.
#[derive(Clone, Debug)]
pub struct SupervisedResult {
    pub success: bool,
    /// Exit code of the last attempt, if the process ran to completion.
    pub exit_code: Option<i32>,
    /// True when the last attempt was killed on timeout.
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    /// Full re-launches consumed beyond the first attempt.
    pub cold_restarts: u32,
}

impl SupervisedResult {
    /// Translate a failed result into a process error with phase context.
    pub fn into_error(self, context: &str) -> KilnError {
        if self.timed_out {
            KilnError::process(format!(
                "{context}: timed out after {} cold restarts",
                self.cold_restarts
            ))
        } else {
            let tail = last_lines(&self.stderr, 5);
            KilnError::process(format!(
                "{context}: exit code {:?} after {} cold restarts: {}",
                self.exit_code, self.cold_restarts, tail
            ))
        }
    }
}

fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join(" | ").trim().to_string()
}

#[derive(serde::Serialize)]
struct AttemptLogEntry<'a> {
    timestamp: String,
    command: String,
    attempt: u32,
    exit_code: Option<i32>,
    timed_out: bool,
    duration_ms: u64,
    stderr_tail: &'a str,
}

/// Launches an external renderer subprocess with a timeout and a bounded
/// cold-restart budget.
///
/// A timed-out or crashed process is fully re-launched (never resumed) up to
/// `max_cold_restarts` additional times. Executable-not-found fails
/// immediately: retrying cannot help.
pub struct ProcessSupervisor {
    /// Job-scoped JSONL attempt log. Writes are best-effort.
    attempt_log: Option<PathBuf>,
    poll_interval: Duration,
    /// Bounded wait for the reap after a kill.
    kill_grace: Duration,
    cancel: CancelFlag,
    /// Shared tally of cold restarts across every execution this supervisor
    /// runs; the pipeline reads it for job metrics.
    restart_counter: Arc<AtomicU32>,
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self {
            attempt_log: None,
            poll_interval: Duration::from_millis(50),
            kill_grace: Duration::from_secs(2),
            cancel: CancelFlag::new(),
            restart_counter: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn with_attempt_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.attempt_log = Some(path.into());
        self
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_restart_counter(mut self, counter: Arc<AtomicU32>) -> Self {
        self.restart_counter = counter;
        self
    }

    pub fn cold_restarts_total(&self) -> u32 {
        self.restart_counter.load(Ordering::SeqCst)
    }

    /// Run `spec` to completion, restarting from scratch on timeout or
    /// nonzero exit, up to `max_cold_restarts + 1` total attempts.
    ///
    /// Returns `Ok` with `success == false` once the budget is exhausted so
    /// the caller can decide how the failure propagates; only
    /// executable-not-found, spawn failures and cancellation are `Err`.
    pub fn execute(
        &self,
        spec: &CommandSpec,
        timeout: Duration,
        max_cold_restarts: u32,
    ) -> KilnResult<SupervisedResult> {
        let total_attempts = max_cold_restarts + 1;
        let mut last: Option<SupervisedResult> = None;

        for attempt in 0..total_attempts {
            self.cancel.check()?;
            if attempt > 0 {
                self.restart_counter.fetch_add(1, Ordering::SeqCst);
                debug!(
                    command = %spec.display_line(),
                    attempt,
                    "cold restart"
                );
            }

            let mut result = self.run_once(spec, timeout)?;
            result.cold_restarts = attempt;
            self.log_attempt(spec, attempt, &result);

            if result.success {
                return Ok(result);
            }
            last = Some(result);
        }

        // Budget exhausted; `last` is always set because total_attempts >= 1.
        let mut result = last.ok_or_else(|| {
            KilnError::process("supervisor executed zero attempts (bug)")
        })?;
        result.cold_restarts = total_attempts - 1;
        Ok(result)
    }

    fn run_once(&self, spec: &CommandSpec, timeout: Duration) -> KilnResult<SupervisedResult> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &spec.current_dir {
            cmd.current_dir(dir);
        }

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                KilnError::MissingExecutable(spec.program.display().to_string())
            } else {
                KilnError::process(format!(
                    "failed to spawn '{}': {e}",
                    spec.program.display()
                ))
            }
        })?;

        // Pipes must be drained while we wait, or a chatty renderer deadlocks
        // on a full pipe buffer.
        let stdout = drain_pipe(child.stdout.take());
        let stderr = drain_pipe(child.stderr.take());

        let deadline = started + timeout;
        let status = loop {
            if let Some(status) = child.try_wait().map_err(|e| {
                KilnError::process(format!("failed to poll subprocess: {e}"))
            })? {
                break Some(status);
            }
            if self.cancel.is_cancelled() {
                self.kill_and_reap(&mut child);
                join_pipe(stdout, self.kill_grace);
                join_pipe(stderr, self.kill_grace);
                return Err(KilnError::Cancelled);
            }
            if Instant::now() >= deadline {
                break None;
            }
            std::thread::sleep(self.poll_interval);
        };

        let (timed_out, exit_code) = match status {
            Some(status) => (false, status.code()),
            None => {
                self.kill_and_reap(&mut child);
                (true, None)
            }
        };

        Ok(SupervisedResult {
            success: exit_code == Some(0),
            exit_code,
            timed_out,
            stdout: join_pipe(stdout, self.kill_grace),
            stderr: join_pipe(stderr, self.kill_grace),
            duration: started.elapsed(),
            cold_restarts: 0,
        })
    }

    fn kill_and_reap(&self, child: &mut Child) {
        if let Err(e) = child.kill() {
            warn!(error = %e, "failed to kill timed-out subprocess");
        }
        let grace_deadline = Instant::now() + self.kill_grace;
        loop {
            match child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) if Instant::now() < grace_deadline => {
                    std::thread::sleep(self.poll_interval)
                }
                Ok(None) => {
                    // Grace spent; block on the reap so no zombie is left.
                    let _ = child.wait();
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "failed to reap killed subprocess");
                    return;
                }
            }
        }
    }

    fn log_attempt(&self, spec: &CommandSpec, attempt: u32, result: &SupervisedResult) {
        let Some(path) = &self.attempt_log else {
            return;
        };
        let entry = AttemptLogEntry {
            timestamp: Utc::now().to_rfc3339(),
            command: spec.display_line(),
            attempt,
            exit_code: result.exit_code,
            timed_out: result.timed_out,
            duration_ms: result.duration.as_millis() as u64,
            stderr_tail: &last_lines(&result.stderr, 3),
        };
        if let Err(e) = append_jsonl(path, &entry) {
            // Logging must never abort the supervised execution itself.
            warn!(path = %path.display(), error = %e, "attempt log write failed");
        }
    }
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

fn append_jsonl<T: serde::Serialize>(path: &Path, entry: &T) -> std::io::Result<()> {
    use std::io::Write as _;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut line = serde_json::to_vec(entry).map_err(std::io::Error::other)?;
    line.push(b'\n');
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(&line)
}

fn drain_pipe<R: Read + Send + 'static>(pipe: Option<R>) -> Option<mpsc::Receiver<Vec<u8>>> {
    let mut pipe = pipe?;
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let mut chunk = [0u8; 8192];
        loop {
            match pipe.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(chunk[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
    Some(rx)
}

/// Collect drained output, waiting at most `wait` for stragglers.
///
/// A killed child's descendants can hold the pipe's write end open long after
/// the reap; past the bound the reader thread is abandoned instead of
/// stalling the supervisor until the pipe finally closes.
fn join_pipe(rx: Option<mpsc::Receiver<Vec<u8>>>, wait: Duration) -> String {
    let mut buf = Vec::new();
    if let Some(rx) = rx {
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(chunk) => buf.extend_from_slice(&chunk),
                Err(_) => break,
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").args(["-c", script])
    }

    #[test]
    #[cfg(unix)]
    fn zero_exit_succeeds_on_first_attempt() {
        let sup = ProcessSupervisor::new();
        let result = sup
            .execute(&sh("echo hello"), Duration::from_secs(5), 2)
            .unwrap();
        assert!(result.success);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.cold_restarts, 0);
        assert!(result.stdout.contains("hello"));
    }

    #[test]
    #[cfg(unix)]
    fn nonzero_exit_consumes_the_full_budget() {
        let sup = ProcessSupervisor::new();
        let result = sup
            .execute(&sh("echo oops >&2; exit 3"), Duration::from_secs(5), 1)
            .unwrap();
        assert!(!result.success);
        assert!(!result.timed_out);
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.cold_restarts, 1);
        assert!(result.stderr.contains("oops"));
    }

    #[test]
    #[cfg(unix)]
    fn timeout_kills_and_reports_timed_out() {
        let sup = ProcessSupervisor::new();
        let started = Instant::now();
        let result = sup
            .execute(&sh("sleep 30"), Duration::from_millis(200), 0)
            .unwrap();
        assert!(!result.success);
        assert!(result.timed_out);
        assert_eq!(result.cold_restarts, 0);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    #[cfg(unix)]
    fn background_children_do_not_stall_the_drain() {
        // The backgrounded sleep inherits stdout/stderr and keeps them open
        // long after the shell exits; captured output up to the drain bound
        // is still delivered.
        let sup = ProcessSupervisor::new();
        let started = Instant::now();
        let result = sup
            .execute(&sh("sleep 30 & echo done"), Duration::from_secs(30), 0)
            .unwrap();
        assert!(result.success);
        assert!(result.stdout.contains("done"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn missing_executable_fails_immediately() {
        let sup = ProcessSupervisor::new();
        let spec = CommandSpec::new("definitely-not-a-real-renderer-binary");
        match sup.execute(&spec, Duration::from_secs(1), 3) {
            Err(KilnError::MissingExecutable(name)) => {
                assert!(name.contains("definitely-not-a-real-renderer-binary"));
            }
            other => panic!("expected MissingExecutable, got {other:?}"),
        }
    }

    #[test]
    #[cfg(unix)]
    fn attempt_log_collects_one_line_per_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("logs").join("supervisor.jsonl");
        let sup = ProcessSupervisor::new().with_attempt_log(&log);
        let _ = sup
            .execute(&sh("exit 1"), Duration::from_secs(5), 2)
            .unwrap();
        let text = std::fs::read_to_string(&log).unwrap();
        assert_eq!(text.lines().count(), 3);
        for line in text.lines() {
            let v: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(v["exit_code"], 1);
        }
    }

    #[test]
    #[cfg(unix)]
    fn cancel_flag_aborts_a_running_process() {
        let cancel = CancelFlag::new();
        let sup = ProcessSupervisor::new().with_cancel_flag(cancel.clone());
        let handle = std::thread::spawn(move || {
            sup.execute(&sh("sleep 30"), Duration::from_secs(60), 0)
        });
        std::thread::sleep(Duration::from_millis(200));
        cancel.cancel();
        match handle.join().unwrap() {
            Err(KilnError::Cancelled) => {}
            other => panic!("expected Cancelled, got {other:?}"),
        }
    }
}
