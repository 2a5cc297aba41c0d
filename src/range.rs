use tracing::{info, warn};

use crate::{
    atomic,
    error::{KilnError, KilnResult},
    frame::{FrameOutcome, FrameRenderer},
    paths::JobPaths,
    scene::SceneDescription,
    supervisor::CancelFlag,
};

/// Aggregated outcome of one frame-range pass.
#[derive(Clone, Debug, Default)]
pub struct RangeResult {
    pub frames_rendered: u32,
    pub frames_skipped: u32,
    pub frames_failed: u32,
    /// Total retries consumed across all frames.
    pub frame_retries: u32,
    pub errors: Vec<String>,
}

impl RangeResult {
    pub fn all_complete(&self) -> bool {
        self.frames_failed == 0
    }
}

/// Drives the frame renderer across a contiguous inclusive range in strictly
/// ascending order.
///
/// Fail-complete, not fail-fast: a failed frame is recorded and the loop
/// continues, so one run surfaces every broken frame; any failure still
/// marks the whole range as failed afterwards. Frame N+1 never starts before
/// frame N's outcome is known.
pub struct FrameRangeOrchestrator<'a> {
    renderer: &'a FrameRenderer<'a>,
    paths: &'a JobPaths,
    cancel: CancelFlag,
}

impl<'a> FrameRangeOrchestrator<'a> {
    pub fn new(renderer: &'a FrameRenderer<'a>, paths: &'a JobPaths, cancel: CancelFlag) -> Self {
        Self {
            renderer,
            paths,
            cancel,
        }
    }

    /// Render `[start_frame, end_frame]`, reporting fractional progress in
    /// `0..=1` after every frame.
    pub fn render_range(
        &self,
        scene: &SceneDescription,
        start_frame: u32,
        end_frame: u32,
        progress: &dyn Fn(f64, &str),
    ) -> KilnResult<RangeResult> {
        if end_frame < start_frame {
            return Err(KilnError::validation(format!(
                "invalid frame range [{start_frame}, {end_frame}]"
            )));
        }
        let total = end_frame - start_frame + 1;
        let mut result = RangeResult::default();

        for frame in start_frame..=end_frame {
            self.cancel.check()?;

            let out_path = self.paths.frame_image(frame);
            match self.renderer.render_frame(scene, frame, &out_path) {
                Ok(FrameOutcome::SkippedComplete) => {
                    result.frames_skipped += 1;
                    result.frames_rendered += 1;
                }
                Ok(FrameOutcome::Rendered { retries }) => {
                    result.frame_retries += retries;
                    result.frames_rendered += 1;
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(frame, error = %err, "frame failed permanently");
                    result.frames_failed += 1;
                    result.errors.push(err.to_string());
                }
            }

            let done = frame - start_frame + 1;
            progress(
                f64::from(done) / f64::from(total),
                &format!("frame {done}/{total}"),
            );
        }

        self.audit_completeness(start_frame, end_frame, &result);
        info!(
            rendered = result.frames_rendered,
            skipped = result.frames_skipped,
            failed = result.frames_failed,
            retries = result.frame_retries,
            "frame range finished"
        );
        Ok(result)
    }

    /// Re-check every frame's marker after the loop. The per-frame loop is
    /// the authoritative failure signal; a mismatch here is logged as a
    /// warning only.
    fn audit_completeness(&self, start_frame: u32, end_frame: u32, result: &RangeResult) {
        let missing: Vec<u32> = (start_frame..=end_frame)
            .filter(|&f| !atomic::is_output_complete(&self.paths.frame_image(f)))
            .collect();
        let expected_missing = result.frames_failed as usize;
        if missing.len() != expected_missing {
            warn!(
                ?missing,
                expected_missing,
                "completeness audit mismatch after frame loop"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Mutex, time::Duration};

    use super::*;
    use crate::{
        frame::tests::{StubEngine, stub_scene, test_settings},
        frame::FrameRenderer,
        supervisor::ProcessSupervisor,
    };

    fn run_range(
        engine: &StubEngine,
        start: u32,
        end: u32,
        tmp: &tempfile::TempDir,
    ) -> (RangeResult, Vec<f64>) {
        let paths = JobPaths::new(tmp.path(), "job-1");
        paths.create_all().unwrap();
        let supervisor = ProcessSupervisor::new();
        let renderer = FrameRenderer::new(engine, &supervisor, &paths, 1, Duration::ZERO);
        let orchestrator = FrameRangeOrchestrator::new(&renderer, &paths, CancelFlag::new());
        let scene = stub_scene(&test_settings());

        let fractions = Mutex::new(Vec::new());
        let result = orchestrator
            .render_range(&scene, start, end, &|f, _msg| {
                fractions.lock().unwrap().push(f);
            })
            .unwrap();
        (result, fractions.into_inner().unwrap())
    }

    #[test]
    fn full_range_renders_every_frame_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = StubEngine::ok();
        let (result, fractions) = run_range(&engine, 1, 20, &tmp);

        assert!(result.all_complete());
        assert_eq!(result.frames_rendered, 20);
        assert_eq!(result.frames_failed, 0);
        assert_eq!(fractions.len(), 20);
        // Progress never regresses and ends at 1.0.
        assert!(fractions.windows(2).all(|w| w[0] <= w[1]));
        assert!((fractions.last().unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn failed_frame_is_recorded_but_the_loop_continues() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = StubEngine::failing_frames(vec![10]);
        let (result, _) = run_range(&engine, 1, 20, &tmp);

        assert!(!result.all_complete());
        assert_eq!(result.frames_failed, 1);
        assert_eq!(result.frames_rendered, 19);
        assert!(result.errors[0].contains("frame 10"));

        // Frames after the failure were still attempted.
        let paths = JobPaths::new(tmp.path(), "job-1");
        assert!(atomic::is_output_complete(&paths.frame_image(9)));
        assert!(atomic::is_output_complete(&paths.frame_image(11)));
        assert!(!paths.frame_image(10).exists());
    }

    #[test]
    fn completed_frames_are_skipped_on_reentry() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = StubEngine::ok();
        let (first, _) = run_range(&engine, 1, 5, &tmp);
        assert_eq!(first.frames_skipped, 0);
        let calls_after_first = engine.call_count();

        let (second, _) = run_range(&engine, 1, 5, &tmp);
        assert_eq!(second.frames_skipped, 5);
        assert_eq!(engine.call_count(), calls_after_first);
    }

    #[test]
    fn inverted_range_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = JobPaths::new(tmp.path(), "job-1");
        paths.create_all().unwrap();
        let engine = StubEngine::ok();
        let supervisor = ProcessSupervisor::new();
        let renderer = FrameRenderer::new(&engine, &supervisor, &paths, 1, Duration::ZERO);
        let orchestrator = FrameRangeOrchestrator::new(&renderer, &paths, CancelFlag::new());
        let scene = stub_scene(&test_settings());

        let err = orchestrator
            .render_range(&scene, 5, 1, &|_, _| {})
            .unwrap_err();
        assert!(matches!(err, crate::error::KilnError::Validation(_)));
        assert_eq!(engine.call_count(), 0);
    }

    #[test]
    fn cancellation_stops_the_range() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = JobPaths::new(tmp.path(), "job-1");
        paths.create_all().unwrap();
        let engine = StubEngine::ok();
        let supervisor = ProcessSupervisor::new();
        let renderer = FrameRenderer::new(&engine, &supervisor, &paths, 0, Duration::ZERO);
        let cancel = CancelFlag::new();
        cancel.cancel();
        let orchestrator = FrameRangeOrchestrator::new(&renderer, &paths, cancel);
        let scene = stub_scene(&test_settings());

        let err = orchestrator
            .render_range(&scene, 1, 5, &|_, _| {})
            .unwrap_err();
        assert!(matches!(err, crate::error::KilnError::Cancelled));
        assert_eq!(engine.call_count(), 0);
    }
}
