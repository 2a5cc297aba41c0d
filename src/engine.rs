use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context as _;
use tracing::debug;

use crate::{
    atomic,
    error::{KilnError, KilnResult},
    paths::JobPaths,
    scene::SceneDescription,
    settings::RenderSettings,
    supervisor::{CommandSpec, ProcessSupervisor},
};

/// What scene creation leaves behind: the scene file plus its description.
#[derive(Clone, Debug)]
pub struct SceneArtifacts {
    pub scene_file: PathBuf,
    pub description: SceneDescription,
}

/// The seam between the pipeline and a concrete external renderer.
///
/// Implementations shell out through the supplied [`ProcessSupervisor`]; the
/// stub engines used in tests implement the trait directly, which is how the
/// frame renderer's retry behavior is observed without a real renderer.
pub trait RenderEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Version string recorded in the manifest as `tool_version`.
    fn tool_version(&self) -> KilnResult<String>;

    /// Produce the scene file and its description from the prompt-derived
    /// parameters. Parameters cross the process boundary via a JSON file,
    /// never via interpolated script text.
    fn create_scene(
        &self,
        paths: &JobPaths,
        prompt: &str,
        settings: &RenderSettings,
        supervisor: &ProcessSupervisor,
    ) -> KilnResult<SceneArtifacts>;

    /// Render one frame of the scene to exactly `out_path`.
    fn render_frame(
        &self,
        paths: &JobPaths,
        scene: &SceneDescription,
        frame: u32,
        out_path: &Path,
        supervisor: &ProcessSupervisor,
    ) -> KilnResult<()>;
}

/// Explicit engine registry, passed into the pipeline by value.
///
/// Job state lives in the per-job working directory, not in here; the
/// registry only maps engine names to implementations.
#[derive(Clone, Default)]
pub struct EngineRegistry {
    engines: BTreeMap<String, Arc<dyn RenderEngine>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, engine: Arc<dyn RenderEngine>) {
        self.engines.insert(engine.name().to_string(), engine);
    }

    pub fn get(&self, name: &str) -> KilnResult<Arc<dyn RenderEngine>> {
        self.engines.get(name).cloned().ok_or_else(|| {
            KilnError::validation(format!(
                "unknown render engine '{name}' (registered: {})",
                self.names().join(", ")
            ))
        })
    }

    pub fn names(&self) -> Vec<&str> {
        self.engines.keys().map(String::as_str).collect()
    }
}

/// Serialized job parameters handed to the scene-builder subprocess.
#[derive(serde::Serialize)]
struct SceneParams<'a> {
    prompt: &'a str,
    settings: &'a RenderSettings,
}

#[derive(Clone, Debug)]
pub struct BlenderConfig {
    pub executable: PathBuf,
    /// Python driver that builds the scene from the params file.
    pub scene_builder_script: PathBuf,
    /// Optional python driver applied before each frame render (camera
    /// overrides from the scene description).
    pub frame_driver_script: Option<PathBuf>,
    pub scene_timeout: Duration,
    pub frame_timeout: Duration,
    pub max_cold_restarts: u32,
}

impl Default for BlenderConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("blender"),
            scene_builder_script: PathBuf::from("scripts/build_scene.py"),
            frame_driver_script: None,
            scene_timeout: Duration::from_secs(120),
            frame_timeout: Duration::from_secs(300),
            max_cold_restarts: 2,
        }
    }
}

/// Blender invoked headless through structured command descriptors.
pub struct BlenderEngine {
    config: BlenderConfig,
}

impl BlenderEngine {
    pub fn new(config: BlenderConfig) -> Self {
        Self { config }
    }

    fn scene_command(&self, paths: &JobPaths) -> CommandSpec {
        CommandSpec::new(&self.config.executable)
            .args(["--background", "--factory-startup"])
            .arg("--python")
            .arg(self.config.scene_builder_script.display().to_string())
            .arg("--")
            .arg("--params")
            .arg(paths.scene_params_file().display().to_string())
            .arg("--scene-out")
            .arg(paths.scene_file().display().to_string())
            .arg("--describe-out")
            .arg(paths.scene_description_file().display().to_string())
    }

    fn frame_command(&self, paths: &JobPaths, frame: u32, raw_pattern: &Path) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.config.executable)
            .arg("--background")
            .arg(paths.scene_file().display().to_string());
        if let Some(driver) = &self.config.frame_driver_script {
            spec = spec
                .arg("--python")
                .arg(driver.display().to_string())
                .arg("--")
                .arg("--scene-json")
                .arg(paths.scene_description_file().display().to_string())
                .arg("--");
        }
        spec.arg("--render-output")
            .arg(raw_pattern.display().to_string())
            .args(["--render-format", "PNG"])
            .arg("--render-frame")
            .arg(frame.to_string())
    }

    /// Path Blender writes for `raw_####` at `frame`.
    fn raw_frame_path(frames_dir: &Path, frame: u32) -> PathBuf {
        frames_dir.join(format!("raw_{frame:04}.png"))
    }
}

impl RenderEngine for BlenderEngine {
    fn name(&self) -> &str {
        "blender"
    }

    fn tool_version(&self) -> KilnResult<String> {
        let output = std::process::Command::new(&self.config.executable)
            .arg("--version")
            .output()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    KilnError::MissingExecutable(self.config.executable.display().to_string())
                } else {
                    KilnError::process(format!("failed to probe blender version: {e}"))
                }
            })?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let first = stdout.lines().next().unwrap_or("").trim();
        if first.is_empty() {
            return Err(KilnError::process("blender --version produced no output"));
        }
        Ok(first.to_string())
    }

    fn create_scene(
        &self,
        paths: &JobPaths,
        prompt: &str,
        settings: &RenderSettings,
        supervisor: &ProcessSupervisor,
    ) -> KilnResult<SceneArtifacts> {
        let params = SceneParams { prompt, settings };
        atomic::write_json_atomic(&paths.scene_params_file(), &params)?;

        let spec = self.scene_command(paths);
        debug!(command = %spec.display_line(), "scene creation");
        let result = supervisor.execute(
            &spec,
            self.config.scene_timeout,
            self.config.max_cold_restarts,
        )?;
        if !result.success {
            return Err(result.into_error("scene creation"));
        }

        let scene_file = paths.scene_file();
        let meta = std::fs::metadata(&scene_file)
            .with_context(|| format!("stat scene file '{}'", scene_file.display()))?;
        if meta.len() == 0 {
            return Err(KilnError::process("scene creation produced an empty scene file"));
        }
        let description = SceneDescription::load(&paths.scene_description_file())?;

        Ok(SceneArtifacts {
            scene_file,
            description,
        })
    }

    fn render_frame(
        &self,
        paths: &JobPaths,
        _scene: &SceneDescription,
        frame: u32,
        out_path: &Path,
        supervisor: &ProcessSupervisor,
    ) -> KilnResult<()> {
        let frames_dir = out_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| paths.frames_dir());
        let raw_pattern = frames_dir.join("raw_####");

        let spec = self.frame_command(paths, frame, &raw_pattern);
        let result = supervisor.execute(
            &spec,
            self.config.frame_timeout,
            self.config.max_cold_restarts,
        )?;
        if !result.success {
            return Err(result.into_error(&format!("render frame {frame}")));
        }

        // Blender expands `####` itself; move its output onto the exact path
        // the frame renderer asked for.
        let produced = Self::raw_frame_path(&frames_dir, frame);
        std::fs::rename(&produced, out_path).with_context(|| {
            format!(
                "move rendered frame '{}' -> '{}'",
                produced.display(),
                out_path.display()
            )
        })?;
        Ok(())
    }
}
