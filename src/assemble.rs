use std::{
    io::{BufRead as _, BufReader},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::mpsc,
    time::{Duration, Instant},
};

use tracing::{debug, warn};

use crate::{
    atomic,
    error::{KilnError, KilnResult},
    supervisor::CancelFlag,
};

/// MP4 brand marker; bytes 4..8 of a well-formed container.
const MP4_FTYP: &[u8; 4] = b"ftyp";

pub fn is_ffmpeg_on_path() -> bool {
    tool_on_path(Path::new("ffmpeg"))
}

fn tool_on_path(program: &Path) -> bool {
    Command::new(program)
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Incremental parser for ffmpeg's stderr progress stream: one
/// `Duration: HH:MM:SS.cc` announcement, then repeated `time=HH:MM:SS.cc`
/// updates. `feed` returns a completion fraction when a line advances it.
#[derive(Debug, Default)]
pub struct FfmpegProgressParser {
    total_secs: Option<f64>,
}

impl FfmpegProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the total when the caller already knows it (an image sequence's
    /// duration is frames/fps); the parsed announcement overrides it.
    pub fn with_total_secs(total_secs: f64) -> Self {
        Self {
            total_secs: (total_secs > 0.0).then_some(total_secs),
        }
    }

    pub fn feed(&mut self, line: &str) -> Option<f64> {
        if let Some(rest) = line.trim_start().strip_prefix("Duration:") {
            let stamp = rest.trim_start().split([',', ' ']).next()?;
            if let Some(secs) = parse_timestamp(stamp) {
                if secs > 0.0 {
                    self.total_secs = Some(secs);
                }
            }
            return None;
        }

        let idx = line.find("time=")?;
        let stamp = line[idx + 5..].split_whitespace().next()?;
        let current = parse_timestamp(stamp)?;
        let total = self.total_secs?;
        Some((current / total).clamp(0.0, 1.0))
    }
}

/// Parse `HH:MM:SS.cc` (fractional seconds optional) into seconds.
fn parse_timestamp(stamp: &str) -> Option<f64> {
    let mut parts = stamp.split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Validate the container signature: nonzero file whose bytes 4..8 read
/// `ftyp`. A zero ffmpeg exit with a corrupt header is not success.
pub fn validate_container(path: &Path) -> KilnResult<()> {
    let meta = std::fs::metadata(path).map_err(|e| {
        KilnError::assembly(format!("output video '{}' missing: {e}", path.display()))
    })?;
    if meta.len() == 0 {
        return Err(KilnError::assembly(format!(
            "output video '{}' is empty",
            path.display()
        )));
    }

    let bytes = std::fs::read(path).map_err(|e| {
        KilnError::assembly(format!("read output video '{}': {e}", path.display()))
    })?;
    if bytes.len() < 8 || &bytes[4..8] != MP4_FTYP {
        return Err(KilnError::assembly(format!(
            "output video '{}' does not carry an mp4 container signature",
            path.display()
        )));
    }
    Ok(())
}

#[derive(Clone, Debug)]
pub struct AssembleConfig {
    /// Muxing executable, resolved through `PATH` when bare.
    pub program: PathBuf,
    pub timeout: Duration,
    pub max_retries: u32,
}

impl Default for AssembleConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ffmpeg"),
            timeout: Duration::from_secs(600),
            max_retries: 2,
        }
    }
}

/// Muxes the completed frame sequence into an MP4 by invoking the system
/// `ffmpeg`, with progress parsed from its own stderr stream.
pub struct VideoAssembler {
    config: AssembleConfig,
    cancel: CancelFlag,
}

impl VideoAssembler {
    pub fn new(config: AssembleConfig) -> Self {
        Self {
            config,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    fn command(&self, frame_pattern: &Path, out_path: &Path, fps: u32) -> Command {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(["-y", "-hide_banner", "-stats"])
            .args(["-framerate", &fps.to_string()])
            .arg("-i")
            .arg(frame_pattern)
            .args([
                "-an",
                "-c:v",
                "libx264",
                "-pix_fmt",
                "yuv420p",
                "-movflags",
                "+faststart",
            ])
            .arg(out_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        cmd
    }

    /// Assemble `frame_pattern` (an `image2` pattern such as
    /// `frames/frame_%04d.png`) into `out_path`. `expected_secs` seeds the
    /// progress total until ffmpeg announces its own.
    pub fn assemble(
        &self,
        frame_pattern: &Path,
        out_path: &Path,
        fps: u32,
        expected_secs: f64,
        progress: &dyn Fn(f64, &str),
    ) -> KilnResult<()> {
        if fps == 0 {
            return Err(KilnError::validation("assembly fps must be > 0"));
        }
        if !tool_on_path(&self.config.program) {
            return Err(KilnError::MissingExecutable(
                self.config.program.display().to_string(),
            ));
        }
        atomic::ensure_parent_dir(out_path)?;

        let mut last_error = String::new();
        for attempt in 0..=self.config.max_retries {
            self.cancel.check()?;
            if attempt > 0 {
                warn!(attempt, error = %last_error, "retrying video assembly");
                let _ = std::fs::remove_file(out_path);
            }

            // A zero exit with a corrupt container counts as a failed
            // attempt, same as a nonzero exit.
            match self
                .run_once(frame_pattern, out_path, fps, expected_secs, progress)
                .and_then(|()| validate_container(out_path))
            {
                Ok(()) => {
                    progress(1.0, "video assembled");
                    return Ok(());
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => last_error = err.to_string(),
            }
        }

        Err(KilnError::assembly(format!(
            "video assembly failed after {} attempts: {last_error}",
            self.config.max_retries + 1
        )))
    }

    fn run_once(
        &self,
        frame_pattern: &Path,
        out_path: &Path,
        fps: u32,
        expected_secs: f64,
        progress: &dyn Fn(f64, &str),
    ) -> KilnResult<()> {
        let mut cmd = self.command(frame_pattern, out_path, fps);
        debug!(pattern = %frame_pattern.display(), out = %out_path.display(), "assembling video");

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|e| {
            KilnError::assembly(format!("failed to spawn ffmpeg: {e}"))
        })?;

        // Stderr is parsed line-by-line on its own thread; fractions arrive
        // over a channel so the callback runs on this thread.
        let (tx, rx) = mpsc::channel::<f64>();
        let stderr = child.stderr.take();
        let reader = std::thread::spawn(move || {
            let mut tail: Vec<String> = Vec::new();
            let Some(stderr) = stderr else {
                return tail;
            };
            let mut parser = FfmpegProgressParser::with_total_secs(expected_secs);
            for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                if let Some(fraction) = parser.feed(&line) {
                    let _ = tx.send(fraction);
                }
                tail.push(line);
                if tail.len() > 20 {
                    tail.remove(0);
                }
            }
            tail
        });

        let deadline = started + self.config.timeout;
        let status = loop {
            for fraction in rx.try_iter() {
                progress(fraction, "encoding video");
            }
            if let Some(status) = child.try_wait().map_err(|e| {
                KilnError::assembly(format!("failed to poll ffmpeg: {e}"))
            })? {
                break Some(status);
            }
            if self.cancel.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                let _ = reader.join();
                return Err(KilnError::Cancelled);
            }
            if Instant::now() >= deadline {
                // Kill before joining the reader: stderr only reaches EOF
                // once the process is gone.
                let _ = child.kill();
                let _ = child.wait();
                break None;
            }
            std::thread::sleep(Duration::from_millis(50));
        };

        let stderr_tail = reader.join().unwrap_or_default();

        match status {
            Some(status) if status.success() => Ok(()),
            Some(status) => Err(KilnError::assembly(format!(
                "ffmpeg exited with status {status}: {}",
                stderr_tail.join(" | ")
            ))),
            None => Err(KilnError::assembly(format!(
                "ffmpeg timed out after {:?}",
                self.config.timeout
            ))),
        }
    }
}
