use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
    time::{Duration, Instant},
};

use chrono::Utc;
use tracing::{info, warn};

use crate::{
    assemble::{AssembleConfig, VideoAssembler},
    atomic,
    camera::place_camera,
    cleanup::CleanupSweeper,
    engine::EngineRegistry,
    error::{KilnError, KilnResult},
    frame::FrameRenderer,
    manifest::Manifest,
    paths::JobPaths,
    range::FrameRangeOrchestrator,
    scene::{SceneCamera, SceneDescription, SceneValidator, violations_message},
    settings::{RenderSettings, Resolution},
    supervisor::{CancelFlag, ProcessSupervisor},
};

/// Hard floor on free disk space before a job starts expensive work.
pub const DEFAULT_MIN_FREE_BYTES: u64 = 500 * 1024 * 1024;

/// Pipeline phases in execution order. Each owns a disjoint slice of the
/// 0..=100 progress range, so a job's reported percentage never regresses
/// across a phase boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    SceneCreation,
    ManifestValidation,
    GuardrailCheck,
    CameraPlacement,
    FrameRendering,
    VideoAssembly,
    Cleanup,
    Done,
}

impl Phase {
    pub fn name(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::SceneCreation => "scene_creation",
            Self::ManifestValidation => "manifest_validation",
            Self::GuardrailCheck => "guardrail_check",
            Self::CameraPlacement => "camera_placement",
            Self::FrameRendering => "frame_rendering",
            Self::VideoAssembly => "video_assembly",
            Self::Cleanup => "cleanup",
            Self::Done => "done",
        }
    }

    /// `(start, end)` percent budget of this phase.
    pub fn budget(self) -> (f64, f64) {
        match self {
            Self::Init => (0.0, 0.0),
            Self::SceneCreation => (0.0, 10.0),
            Self::ManifestValidation => (10.0, 12.0),
            Self::GuardrailCheck => (12.0, 14.0),
            Self::CameraPlacement => (14.0, 15.0),
            Self::FrameRendering => (15.0, 85.0),
            Self::VideoAssembly => (85.0, 98.0),
            Self::Cleanup => (98.0, 100.0),
            Self::Done => (100.0, 100.0),
        }
    }
}

/// Everything a finished or failed job reports beyond the verdict itself:
/// enough for an operator to tell a transient tool crash from a scene
/// authoring bug without opening the logs.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct RenderMetadata {
    pub frames_rendered: u32,
    pub frames_skipped: u32,
    pub frame_retries: u32,
    pub cold_restarts: u32,
    pub bytes_freed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_phase: Option<String>,
    pub phase_timings_secs: BTreeMap<String, f64>,
}

/// Terminal pipeline output. Constructed exactly once per run, on either the
/// success or the failure path, and never mutated afterwards.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct RenderResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_path: Option<PathBuf>,
    pub duration_secs: f64,
    pub resolution: Resolution,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub metadata: RenderMetadata,
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub data_root: PathBuf,
    pub frame_max_retries: u32,
    pub frame_retry_backoff: Duration,
    pub min_free_bytes: u64,
    /// Retention window for frame artifacts; the terminal sweep only removes
    /// files strictly older than this.
    pub cleanup_max_age: Duration,
    pub assemble: AssembleConfig,
    /// Minimum interval between on-disk status snapshots.
    pub status_debounce: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("data/jobs"),
            frame_max_retries: 3,
            frame_retry_backoff: Duration::from_millis(500),
            min_free_bytes: DEFAULT_MIN_FREE_BYTES,
            cleanup_max_age: Duration::from_secs(24 * 3600),
            assemble: AssembleConfig::default(),
            status_debounce: Duration::from_millis(500),
        }
    }
}

#[derive(serde::Serialize)]
struct StatusSnapshot<'a> {
    job_id: &'a str,
    phase: &'a str,
    percent: f64,
    message: &'a str,
    updated_at: String,
}

/// Monotone progress plus debounced `status.json` snapshots.
///
/// The callback may fire many times per second during frame rendering; the
/// on-disk snapshot is debounced here so a fast render does not hammer the
/// filesystem. Phase transitions always flush.
struct ProgressReporter<'a> {
    callback: &'a dyn Fn(f64, &str),
    status_file: PathBuf,
    job_id: String,
    debounce: Duration,
    state: Mutex<ReporterState>,
}

struct ReporterState {
    last_percent: f64,
    phase: Phase,
    last_status_write: Option<Instant>,
}

impl<'a> ProgressReporter<'a> {
    fn new(callback: &'a dyn Fn(f64, &str), paths: &JobPaths, debounce: Duration) -> Self {
        Self {
            callback,
            status_file: paths.status_file(),
            job_id: paths.job_id().to_string(),
            debounce,
            state: Mutex::new(ReporterState {
                last_percent: 0.0,
                phase: Phase::Init,
                last_status_write: None,
            }),
        }
    }

    fn enter_phase(&self, phase: Phase, message: &str) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.phase = phase;
        }
        self.report(phase.budget().0, message, true);
    }

    /// Report `fraction` in `0..=1` of the current phase's budget.
    fn phase_fraction(&self, fraction: f64, message: &str) {
        let phase = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.phase
        };
        let (start, end) = phase.budget();
        self.report(
            start + fraction.clamp(0.0, 1.0) * (end - start),
            message,
            false,
        );
    }

    fn report(&self, percent: f64, message: &str, force_status: bool) {
        let (percent, phase, write_status) = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            // Progress never regresses within one job.
            let percent = percent.clamp(state.last_percent, 100.0);
            state.last_percent = percent;
            let due = match state.last_status_write {
                None => true,
                Some(at) => at.elapsed() >= self.debounce,
            };
            let write_status = force_status || due;
            if write_status {
                state.last_status_write = Some(Instant::now());
            }
            (percent, state.phase, write_status)
        };

        (self.callback)(percent, message);

        if write_status {
            let snapshot = StatusSnapshot {
                job_id: &self.job_id,
                phase: phase.name(),
                percent,
                message,
                updated_at: Utc::now().to_rfc3339(),
            };
            // Best-effort: a status write failure never aborts the job.
            if let Err(e) = atomic::write_json_atomic(&self.status_file, &snapshot) {
                warn!(error = %e, "status snapshot write failed");
            }
        }
    }
}

struct PhaseTimer<'a> {
    timings: &'a Mutex<BTreeMap<String, f64>>,
}

impl PhaseTimer<'_> {
    fn run<T>(
        &self,
        phase: Phase,
        f: impl FnOnce() -> KilnResult<T>,
    ) -> Result<T, (Phase, KilnError)> {
        let started = Instant::now();
        let result = f();
        let mut timings = self.timings.lock().unwrap_or_else(|e| e.into_inner());
        timings.insert(phase.name().to_string(), started.elapsed().as_secs_f64());
        result.map_err(|e| (phase, e))
    }
}

/// Sequences one job through scene creation, manifest validation, guardrail
/// checks, camera placement, frame rendering, video assembly and cleanup,
/// producing a single terminal [`RenderResult`].
///
/// One instance may run many jobs; all job state lives in the per-job working
/// directory, never in the pipeline itself.
pub struct ProductionRenderPipeline {
    config: PipelineConfig,
    registry: EngineRegistry,
    cancel: CancelFlag,
}

impl ProductionRenderPipeline {
    pub fn new(config: PipelineConfig, registry: EngineRegistry) -> Self {
        Self {
            config,
            registry,
            cancel: CancelFlag::new(),
        }
    }

    /// Flag shared with every supervised subprocess this pipeline launches.
    /// Cancelling terminates the active subprocess and fails the job at the
    /// next checkpoint; completed frames stay intact for a later resume.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Run one job to a terminal result. Never panics and never returns
    /// `Err`: every failure is folded into `RenderResult { success: false }`.
    pub fn run(
        &self,
        job_id: &str,
        prompt: &str,
        settings: &RenderSettings,
        progress: &dyn Fn(f64, &str),
    ) -> RenderResult {
        let paths = JobPaths::new(&self.config.data_root, job_id);
        let reporter = ProgressReporter::new(progress, &paths, self.config.status_debounce);
        let timings = Mutex::new(BTreeMap::new());
        let restart_counter = Arc::new(AtomicU32::new(0));
        let mut metadata = RenderMetadata::default();

        let outcome = self.execute(
            job_id,
            prompt,
            settings,
            &paths,
            &reporter,
            &PhaseTimer { timings: &timings },
            Arc::clone(&restart_counter),
            &mut metadata,
        );

        metadata.cold_restarts = restart_counter.load(Ordering::SeqCst);
        metadata.phase_timings_secs = timings.into_inner().unwrap_or_else(|e| e.into_inner());

        let result = match outcome {
            Ok(video_path) => {
                reporter.enter_phase(Phase::Done, "render complete");
                info!(job_id, "job finished");
                RenderResult {
                    success: true,
                    video_path: Some(video_path),
                    duration_secs: f64::from(settings.frame_count()) / f64::from(settings.fps),
                    resolution: settings.resolution,
                    error_message: None,
                    metadata,
                }
            }
            Err((phase, err)) => {
                warn!(job_id, phase = phase.name(), error = %err, "job failed");
                metadata.failed_phase = Some(phase.name().to_string());
                // Best-effort sweep so a failed job does not strand stale
                // artifacts; fresh frames survive the retention window and
                // seed a future resume.
                if let Ok(stats) =
                    CleanupSweeper::sweep(&paths.frames_dir(), self.config.cleanup_max_age)
                {
                    metadata.bytes_freed += stats.bytes_freed;
                }
                RenderResult {
                    success: false,
                    video_path: None,
                    duration_secs: 0.0,
                    resolution: settings.resolution,
                    error_message: Some(format!("{}: {err}", phase.name())),
                    metadata,
                }
            }
        };

        self.persist_terminal_artifacts(&paths, &result);
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn execute(
        &self,
        job_id: &str,
        prompt: &str,
        settings: &RenderSettings,
        paths: &JobPaths,
        reporter: &ProgressReporter<'_>,
        timer: &PhaseTimer<'_>,
        restart_counter: Arc<AtomicU32>,
        metadata: &mut RenderMetadata,
    ) -> Result<PathBuf, (Phase, KilnError)> {
        reporter.enter_phase(Phase::Init, "starting");
        let (engine, tool_version) = timer.run(Phase::Init, || {
            settings.validate()?;
            self.cancel.check()?;
            paths.create_all()?;
            self.check_free_space(paths)?;
            let engine = self.registry.get(&settings.engine)?;
            let tool_version = engine.tool_version()?;
            Ok((engine, tool_version))
        })?;

        let supervisor = ProcessSupervisor::new()
            .with_attempt_log(paths.supervisor_log())
            .with_cancel_flag(self.cancel.clone())
            .with_restart_counter(restart_counter);

        reporter.enter_phase(Phase::SceneCreation, "creating scene");
        timer.run(Phase::SceneCreation, || {
            self.cancel.check()?;
            if self.can_resume(paths, settings, &tool_version) {
                info!(job_id, "reusing existing scene and manifest");
                return Ok(());
            }
            let mut manifest = Manifest::create(job_id, settings.clone(), &tool_version)?;
            engine.create_scene(paths, prompt, settings, &supervisor)?;
            manifest.record_scene_file(&paths.scene_file())?;
            // Rendering must not start unless the manifest is durably on
            // disk.
            manifest.save_atomic(&paths.manifest_file())?;
            Ok(())
        })?;

        reporter.enter_phase(Phase::ManifestValidation, "validating manifest");
        let manifest = timer.run(Phase::ManifestValidation, || {
            self.cancel.check()?;
            // Read back from disk, never re-derived: later phases must see
            // exactly what scene creation persisted.
            let manifest = Manifest::load(&paths.manifest_file())?;
            if !manifest.validate_against(settings, &tool_version) {
                return Err(KilnError::manifest(
                    "validation hash mismatch between scene creation and render settings",
                ));
            }
            manifest.verify_scene_file(&paths.scene_file())?;
            Ok(manifest)
        })?;

        reporter.enter_phase(Phase::GuardrailCheck, "running guardrail checks");
        let mut scene = timer.run(Phase::GuardrailCheck, || {
            self.cancel.check()?;
            let scene = SceneDescription::load(&paths.scene_description_file())?;
            SceneValidator::validate(&scene, &manifest)
                .map_err(|v| KilnError::validation(violations_message(&v)))?;
            Ok(scene)
        })?;

        reporter.enter_phase(Phase::CameraPlacement, "placing camera");
        timer.run(Phase::CameraPlacement, || {
            self.cancel.check()?;
            if !scene.has_parameterized_camera() {
                let transform = place_camera(&scene);
                scene.camera = Some(SceneCamera {
                    name: "AutoCamera".to_string(),
                    params: Some(transform.to_params()),
                });
                scene.save_atomic(&paths.scene_description_file())?;
            }
            if !scene.has_parameterized_camera() {
                return Err(KilnError::validation(
                    "no parameterized camera after camera placement",
                ));
            }
            Ok(())
        })?;

        reporter.enter_phase(Phase::FrameRendering, "rendering frames");
        let [start_frame, end_frame] = manifest.expected_outputs.frame_range;
        timer.run(Phase::FrameRendering, || {
            let renderer = FrameRenderer::new(
                engine.as_ref(),
                &supervisor,
                paths,
                self.config.frame_max_retries,
                self.config.frame_retry_backoff,
            );
            let orchestrator = FrameRangeOrchestrator::new(&renderer, paths, self.cancel.clone());
            let range = orchestrator.render_range(&scene, start_frame, end_frame, &|f, msg| {
                reporter.phase_fraction(f, msg)
            })?;

            metadata.frames_rendered = range.frames_rendered;
            metadata.frames_skipped = range.frames_skipped;
            metadata.frame_retries = range.frame_retries;

            if !range.all_complete() {
                return Err(KilnError::process(format!(
                    "{} frame(s) failed permanently: {}",
                    range.frames_failed,
                    range.errors.join("; ")
                )));
            }
            Ok(())
        })?;

        reporter.enter_phase(Phase::VideoAssembly, "assembling video");
        let video_path = timer.run(Phase::VideoAssembly, || {
            self.cancel.check()?;
            let assembler = VideoAssembler::new(self.config.assemble.clone())
                .with_cancel_flag(self.cancel.clone());
            let expected_secs =
                f64::from(manifest.expected_outputs.frame_count()) / f64::from(settings.fps);
            let out = paths.video_file();
            assembler.assemble(
                &paths.frame_pattern(),
                &out,
                settings.fps,
                expected_secs,
                &|f, msg| reporter.phase_fraction(f, msg),
            )?;
            Ok(out)
        })?;

        reporter.enter_phase(Phase::Cleanup, "sweeping frame artifacts");
        timer.run(Phase::Cleanup, || {
            // Cleanup is best-effort and never fails the job.
            match CleanupSweeper::sweep(&paths.frames_dir(), self.config.cleanup_max_age) {
                Ok(stats) => metadata.bytes_freed += stats.bytes_freed,
                Err(e) => warn!(error = %e, "cleanup sweep failed"),
            }
            Ok(())
        })?;

        Ok(video_path)
    }

    /// A job can reuse its on-disk scene when the persisted manifest still
    /// matches the incoming settings and the scene file has not drifted.
    /// Completed frames are then skipped by the frame renderer, which is the
    /// whole resume path.
    fn can_resume(&self, paths: &JobPaths, settings: &RenderSettings, tool_version: &str) -> bool {
        let Ok(manifest) = Manifest::load(&paths.manifest_file()) else {
            return false;
        };
        manifest.validate_against(settings, tool_version)
            && manifest.verify_scene_file(&paths.scene_file()).is_ok()
            && paths.scene_description_file().is_file()
    }

    fn check_free_space(&self, paths: &JobPaths) -> KilnResult<()> {
        let free = fs2::available_space(paths.root())
            .map_err(|e| KilnError::validation(format!("failed to probe free disk space: {e}")))?;
        if free < self.config.min_free_bytes {
            return Err(KilnError::validation(format!(
                "insufficient disk space: {free} bytes free, {} required",
                self.config.min_free_bytes
            )));
        }
        Ok(())
    }

    fn persist_terminal_artifacts(&self, paths: &JobPaths, result: &RenderResult) {
        // Both artifacts are best-effort; the returned result is
        // authoritative.
        if let Err(e) = atomic::write_json_atomic(&paths.metrics_file(), &result.metadata) {
            warn!(error = %e, "metrics write failed");
        }
        if let Err(e) = atomic::write_json_atomic(&paths.result_file(), result) {
            warn!(error = %e, "result write failed");
        }
    }
}

/// Entry point for the API/task-queue layer.
///
/// Runs the whole pipeline synchronously on the calling thread; callers on an
/// async runtime hand this to their blocking-task executor. A `None` job id
/// gets a generated one.
pub fn render_video_production(
    job_id: Option<String>,
    prompt: &str,
    settings: RenderSettings,
    registry: EngineRegistry,
    config: PipelineConfig,
    progress: &dyn Fn(f64, &str),
) -> RenderResult {
    let job_id = job_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let pipeline = ProductionRenderPipeline::new(config, registry);
    pipeline.run(&job_id, prompt, &settings, progress)
}
