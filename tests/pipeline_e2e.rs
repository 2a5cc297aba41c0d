use std::{
    collections::BTreeMap,
    path::Path,
    process::Command,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use kiln::{
    EngineRegistry, JobPaths, KilnError, KilnResult, PipelineConfig, ProcessSupervisor,
    ProductionRenderPipeline, RenderEngine, RenderSettings, Resolution,
    engine::SceneArtifacts,
    scene::{CameraParams, ObjectKind, SceneCamera, SceneDescription, SceneObject},
};

fn ffmpeg_available() -> bool {
    Command::new("ffmpeg")
        .arg("-version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[derive(Clone, Copy)]
enum CameraMode {
    Parameterized,
    Stub,
    Absent,
}

/// In-process engine that writes real PNG frames, so the whole pipeline runs
/// without an external renderer.
struct TestEngine {
    failing_frames: Vec<u32>,
    camera: CameraMode,
    scene_calls: AtomicU32,
    frame_calls: AtomicU32,
}

impl TestEngine {
    fn ok() -> Self {
        Self {
            failing_frames: Vec::new(),
            camera: CameraMode::Parameterized,
            scene_calls: AtomicU32::new(0),
            frame_calls: AtomicU32::new(0),
        }
    }

    fn failing_frames(frames: Vec<u32>) -> Self {
        Self {
            failing_frames: frames,
            ..Self::ok()
        }
    }

    fn with_camera(camera: CameraMode) -> Self {
        Self {
            camera,
            ..Self::ok()
        }
    }

    fn description(&self, settings: &RenderSettings) -> SceneDescription {
        let camera = match self.camera {
            CameraMode::Absent => None,
            CameraMode::Stub => Some(SceneCamera {
                name: "Camera".to_string(),
                params: None,
            }),
            CameraMode::Parameterized => Some(SceneCamera {
                name: "Camera".to_string(),
                params: Some(CameraParams {
                    location: [0.0, -10.0, 5.0],
                    rotation_euler: [1.1, 0.0, 0.0],
                    focal_length_mm: 50.0,
                    sensor_width_mm: 36.0,
                }),
            }),
        };
        SceneDescription {
            frame_start: 1,
            frame_end: settings.frame_count(),
            resolution: settings.resolution,
            camera,
            objects: vec![SceneObject {
                name: "Cube".to_string(),
                kind: ObjectKind::Mesh,
                visible: true,
                bounds_min: [-1.0, -1.0, -1.0],
                bounds_max: [1.0, 1.0, 1.0],
                matrix_world: [
                    [1.0, 0.0, 0.0, 0.0],
                    [0.0, 1.0, 0.0, 0.0],
                    [0.0, 0.0, 1.0, 0.0],
                    [0.0, 0.0, 0.0, 1.0],
                ],
            }],
            materials: vec![],
        }
    }
}

impl RenderEngine for TestEngine {
    fn name(&self) -> &str {
        "stub"
    }

    fn tool_version(&self) -> KilnResult<String> {
        Ok("stub-1.0".to_string())
    }

    fn create_scene(
        &self,
        paths: &JobPaths,
        _prompt: &str,
        settings: &RenderSettings,
        _supervisor: &ProcessSupervisor,
    ) -> KilnResult<SceneArtifacts> {
        self.scene_calls.fetch_add(1, Ordering::SeqCst);
        std::fs::write(paths.scene_file(), b"synthetic scene bytes")
            .map_err(|e| KilnError::process(e.to_string()))?;
        let description = self.description(settings);
        description.save_atomic(&paths.scene_description_file())?;
        Ok(SceneArtifacts {
            scene_file: paths.scene_file(),
            description,
        })
    }

    fn render_frame(
        &self,
        _paths: &JobPaths,
        _scene: &SceneDescription,
        frame: u32,
        out_path: &Path,
        _supervisor: &ProcessSupervisor,
    ) -> KilnResult<()> {
        self.frame_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_frames.contains(&frame) {
            return Err(KilnError::process(format!("synthetic crash at frame {frame}")));
        }
        let shade = (frame % 255) as u8;
        image::RgbaImage::from_pixel(64, 64, image::Rgba([shade, shade, 40, 255]))
            .save_with_format(out_path, image::ImageFormat::Png)
            .map_err(|e| KilnError::process(e.to_string()))?;
        Ok(())
    }
}

fn test_settings() -> RenderSettings {
    RenderSettings {
        resolution: Resolution {
            width: 64,
            height: 64,
        },
        fps: 10,
        duration_secs: 2.0,
        engine: "stub".to_string(),
        extra: BTreeMap::new(),
    }
}

fn test_config(data_root: &Path) -> PipelineConfig {
    PipelineConfig {
        data_root: data_root.to_path_buf(),
        frame_max_retries: 1,
        frame_retry_backoff: Duration::ZERO,
        min_free_bytes: 0,
        status_debounce: Duration::ZERO,
        ..PipelineConfig::default()
    }
}

fn pipeline_with(engine: Arc<TestEngine>, data_root: &Path) -> ProductionRenderPipeline {
    let mut registry = EngineRegistry::new();
    registry.register(engine);
    ProductionRenderPipeline::new(test_config(data_root), registry)
}

#[test]
fn full_pipeline_renders_and_assembles() {
    if !ffmpeg_available() {
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    let engine = Arc::new(TestEngine::ok());
    let pipeline = pipeline_with(Arc::clone(&engine), tmp.path());

    let result = pipeline.run("job-e2e", "spinning cube", &test_settings(), &|_, _| {});
    assert!(result.success, "pipeline failed: {:?}", result.error_message);
    assert_eq!(result.metadata.frames_rendered, 20);
    assert_eq!(result.metadata.failed_phase, None);
    assert_eq!(engine.frame_calls.load(Ordering::SeqCst), 20);

    let paths = JobPaths::new(tmp.path(), "job-e2e");
    let video = result.video_path.unwrap();
    assert_eq!(video, paths.video_file());
    let bytes = std::fs::read(&video).unwrap();
    assert!(bytes.len() > 8);
    assert_eq!(&bytes[4..8], b"ftyp");

    // Fresh frames survive the terminal sweep, marker and all.
    for frame in 1..=20 {
        assert!(paths.frame_image(frame).exists());
        let marker = paths.frame_image(frame).with_extension("png.ok");
        assert!(marker.exists(), "missing marker for frame {frame}");
    }

    // Terminal artifacts are on disk and agree with the returned result.
    let persisted: serde_json::Value =
        serde_json::from_slice(&std::fs::read(paths.result_file()).unwrap()).unwrap();
    assert_eq!(persisted["success"], true);
    assert!(paths.metrics_file().is_file());
    assert!(paths.status_file().is_file());
}

#[test]
fn resume_reuses_scene_and_skips_completed_frames() {
    if !ffmpeg_available() {
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    let engine = Arc::new(TestEngine::ok());

    let first = pipeline_with(Arc::clone(&engine), tmp.path()).run(
        "job-resume",
        "spinning cube",
        &test_settings(),
        &|_, _| {},
    );
    assert!(first.success);
    assert_eq!(first.metadata.frames_skipped, 0);
    let frame_calls_after_first = engine.frame_calls.load(Ordering::SeqCst);

    let second = pipeline_with(Arc::clone(&engine), tmp.path()).run(
        "job-resume",
        "spinning cube",
        &test_settings(),
        &|_, _| {},
    );
    assert!(second.success);
    assert_eq!(second.metadata.frames_skipped, 20);
    // Scene creation ran once; no frame was re-rendered.
    assert_eq!(engine.scene_calls.load(Ordering::SeqCst), 1);
    assert_eq!(engine.frame_calls.load(Ordering::SeqCst), frame_calls_after_first);
}

#[test]
fn failed_frame_fails_the_job_but_keeps_completed_frames() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = Arc::new(TestEngine::failing_frames(vec![10]));
    let pipeline = pipeline_with(engine, tmp.path());

    let result = pipeline.run("job-fail", "spinning cube", &test_settings(), &|_, _| {});
    assert!(!result.success);
    assert_eq!(
        result.metadata.failed_phase.as_deref(),
        Some("frame_rendering")
    );
    let message = result.error_message.unwrap();
    assert!(message.contains("frame 10"), "message was: {message}");

    // Neighbours of the failed frame completed and stay on disk.
    let paths = JobPaths::new(tmp.path(), "job-fail");
    assert!(paths.frame_image(9).exists());
    assert!(paths.frame_image(11).exists());
    assert!(!paths.frame_image(10).exists());

    // The failure verdict is persisted too.
    let persisted: serde_json::Value =
        serde_json::from_slice(&std::fs::read(paths.result_file()).unwrap()).unwrap();
    assert_eq!(persisted["success"], false);
    assert_eq!(persisted["metadata"]["failed_phase"], "frame_rendering");
}

#[test]
fn stub_camera_is_rejected_by_the_guardrail_phase() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = Arc::new(TestEngine::with_camera(CameraMode::Stub));
    let pipeline = pipeline_with(engine, tmp.path());

    let result = pipeline.run("job-stub-cam", "cube", &test_settings(), &|_, _| {});
    assert!(!result.success);
    assert_eq!(
        result.metadata.failed_phase.as_deref(),
        Some("guardrail_check")
    );
    assert!(
        result
            .error_message
            .unwrap()
            .contains("no camera parameters")
    );
}

#[test]
fn absent_camera_is_authored_before_rendering() {
    let tmp = tempfile::tempdir().unwrap();
    // Every frame fails so the run stops right after camera placement; the
    // authored camera must already be persisted by then.
    let engine = Arc::new(TestEngine {
        failing_frames: (1..=20).collect(),
        camera: CameraMode::Absent,
        scene_calls: AtomicU32::new(0),
        frame_calls: AtomicU32::new(0),
    });
    let pipeline = pipeline_with(engine, tmp.path());

    let result = pipeline.run("job-no-cam", "cube", &test_settings(), &|_, _| {});
    assert!(!result.success);
    assert_eq!(
        result.metadata.failed_phase.as_deref(),
        Some("frame_rendering")
    );

    let paths = JobPaths::new(tmp.path(), "job-no-cam");
    let scene = SceneDescription::load(&paths.scene_description_file()).unwrap();
    assert!(scene.has_parameterized_camera());
    assert_eq!(scene.camera.unwrap().name, "AutoCamera");
}

#[test]
fn unknown_engine_fails_during_init() {
    let tmp = tempfile::tempdir().unwrap();
    let pipeline = ProductionRenderPipeline::new(test_config(tmp.path()), EngineRegistry::new());

    let mut settings = test_settings();
    settings.engine = "remotion".to_string();
    let result = pipeline.run("job-unknown", "cube", &settings, &|_, _| {});
    assert!(!result.success);
    assert_eq!(result.metadata.failed_phase.as_deref(), Some("init"));
    assert!(result.error_message.unwrap().contains("unknown render engine"));
}

#[test]
fn progress_is_monotone_across_the_whole_run() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = Arc::new(TestEngine::failing_frames(vec![7]));
    let pipeline = pipeline_with(engine, tmp.path());

    let seen = std::sync::Mutex::new(Vec::new());
    let _ = pipeline.run("job-progress", "cube", &test_settings(), &|p, _| {
        seen.lock().unwrap().push(p);
    });
    let seen = seen.into_inner().unwrap();
    assert!(!seen.is_empty());
    assert!(seen.windows(2).all(|w| w[0] <= w[1]));
}
