use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use tracing::{debug, warn};

use crate::{
    atomic,
    error::{KilnError, KilnResult},
    engine::RenderEngine,
    hash,
    paths::JobPaths,
    scene::SceneDescription,
    supervisor::ProcessSupervisor,
};

/// Outcome of one frame's work.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Output and marker already valid; the render call was never made.
    SkippedComplete,
    /// Rendered on this run; `retries` is how many attempts beyond the first
    /// were consumed.
    Rendered { retries: u32 },
}

impl FrameOutcome {
    pub fn retries(self) -> u32 {
        match self {
            Self::SkippedComplete => 0,
            Self::Rendered { retries } => retries,
        }
    }
}

/// Per-frame unit of work: render, verify, atomically place, mark complete.
///
/// A frame moves through render → verify → rename → marker; failure at any
/// step deletes the partial remnants and retries with a short backoff, up to
/// `max_retries` additional attempts. A frame whose output and `.ok` marker
/// already exist is skipped without invoking the renderer at all, which is
/// what makes a partially-completed job resumable.
pub struct FrameRenderer<'a> {
    engine: &'a dyn RenderEngine,
    supervisor: &'a ProcessSupervisor,
    paths: &'a JobPaths,
    max_retries: u32,
    retry_backoff: Duration,
}

impl<'a> FrameRenderer<'a> {
    pub fn new(
        engine: &'a dyn RenderEngine,
        supervisor: &'a ProcessSupervisor,
        paths: &'a JobPaths,
        max_retries: u32,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            engine,
            supervisor,
            paths,
            max_retries,
            retry_backoff,
        }
    }

    pub fn render_frame(
        &self,
        scene: &SceneDescription,
        frame: u32,
        out_path: &Path,
    ) -> KilnResult<FrameOutcome> {
        if atomic::is_output_complete(out_path) {
            debug!(frame, "frame already complete, skipping");
            return Ok(FrameOutcome::SkippedComplete);
        }

        let tmp = tmp_render_path(out_path);
        let mut last_error = String::new();

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                warn!(frame, attempt, error = %last_error, "retrying frame");
                std::thread::sleep(self.retry_backoff);
            }

            match self.attempt(scene, frame, &tmp, out_path) {
                Ok(()) => {
                    return Ok(FrameOutcome::Rendered { retries: attempt });
                }
                Err(err) => {
                    // Fatal errors (missing executable, cancellation) are not
                    // something another attempt can fix.
                    if err.is_fatal() {
                        self.remove_remnants(&tmp, out_path);
                        return Err(err);
                    }
                    last_error = err.to_string();
                    self.remove_remnants(&tmp, out_path);
                }
            }
        }

        Err(KilnError::Frame {
            frame,
            attempts: self.max_retries + 1,
            message: last_error,
        })
    }

    fn attempt(
        &self,
        scene: &SceneDescription,
        frame: u32,
        tmp: &Path,
        out_path: &Path,
    ) -> KilnResult<()> {
        self.engine
            .render_frame(self.paths, scene, frame, tmp, self.supervisor)?;

        verify_frame_output(tmp)?;

        // Same-directory rename keeps placement atomic; the marker is only
        // written once the final path is in place.
        std::fs::rename(tmp, out_path).map_err(|e| {
            KilnError::process(format!(
                "place frame output '{}': {e}",
                out_path.display()
            ))
        })?;
        let digest = hash::sha256_file(out_path)?;
        atomic::write_completion_marker(out_path, Some(digest))?;
        Ok(())
    }

    fn remove_remnants(&self, tmp: &Path, out_path: &Path) {
        let _ = std::fs::remove_file(tmp);
        let _ = std::fs::remove_file(out_path);
        let _ = std::fs::remove_file(atomic::marker_path(out_path));
    }
}

fn tmp_render_path(out_path: &Path) -> PathBuf {
    let mut os = out_path.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}

/// A rendered frame must be nonempty and carry a recognizable image header;
/// a crash mid-write leaves neither.
fn verify_frame_output(path: &Path) -> KilnResult<()> {
    let meta = std::fs::metadata(path).map_err(|e| {
        KilnError::process(format!("rendered frame '{}' missing: {e}", path.display()))
    })?;
    if meta.len() == 0 {
        return Err(KilnError::process(format!(
            "rendered frame '{}' is empty",
            path.display()
        )));
    }

    let bytes = std::fs::read(path).map_err(|e| {
        KilnError::process(format!("read rendered frame '{}': {e}", path.display()))
    })?;
    let head = &bytes[..bytes.len().min(64)];
    match image::guess_format(head) {
        Ok(image::ImageFormat::Png) => Ok(()),
        Ok(other) => Err(KilnError::process(format!(
            "rendered frame '{}' has unexpected format {other:?}",
            path.display()
        ))),
        Err(_) => Err(KilnError::process(format!(
            "rendered frame '{}' has no valid image header",
            path.display()
        ))),
    }
}
