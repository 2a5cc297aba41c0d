use std::path::{Path, PathBuf};

use anyhow::Context as _;

use crate::{
    error::{KilnError, KilnResult},
    manifest::Manifest,
    settings::Resolution,
};

/// Scene contents as described by the scene-creation subprocess.
///
/// The renderer emits this JSON next to the scene file; it is the structured
/// contract that crosses the process boundary (no scene parsing happens in
/// this process). Guardrail checks and camera placement both run against it.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct SceneDescription {
    /// Inclusive frame range, 1-based.
    pub frame_start: u32,
    pub frame_end: u32,
    pub resolution: Resolution,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera: Option<SceneCamera>,
    pub objects: Vec<SceneObject>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub materials: Vec<Material>,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct SceneCamera {
    pub name: String,
    /// Absent on a bare camera stub. A stub cannot be rendered through.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<CameraParams>,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct CameraParams {
    pub location: [f64; 3],
    pub rotation_euler: [f64; 3],
    pub focal_length_mm: f64,
    pub sensor_width_mm: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Mesh,
    Curve,
    Surface,
    Meta,
    Font,
    Light,
    Empty,
}

impl ObjectKind {
    pub fn is_renderable(self) -> bool {
        matches!(
            self,
            Self::Mesh | Self::Curve | Self::Surface | Self::Meta | Self::Font
        )
    }
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct SceneObject {
    pub name: String,
    pub kind: ObjectKind,
    pub visible: bool,
    /// Local-space bounding box corners (min, max).
    pub bounds_min: [f64; 3],
    pub bounds_max: [f64; 3],
    /// Row-major local-to-world transform.
    pub matrix_world: [[f64; 4]; 4],
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct Material {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub texture_path: Option<PathBuf>,
}

impl SceneDescription {
    pub fn load(path: &Path) -> KilnResult<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("read scene description '{}'", path.display()))?;
        serde_json::from_slice(&bytes).map_err(|e| {
            KilnError::serde(format!("parse scene description '{}': {e}", path.display()))
        })
    }

    pub fn save_atomic(&self, path: &Path) -> KilnResult<()> {
        crate::atomic::write_json_atomic(path, self)
    }

    pub fn has_parameterized_camera(&self) -> bool {
        self.camera.as_ref().is_some_and(|c| c.params.is_some())
    }

    pub fn visible_renderable_objects(&self) -> impl Iterator<Item = &SceneObject> {
        self.objects
            .iter()
            .filter(|o| o.visible && o.kind.is_renderable())
    }
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("camera '{0}' exists but carries no camera parameters")]
    StubCamera(String),

    #[error("frame range [{start}, {end}] is empty (end must be > start)")]
    EmptyFrameRange { start: u32, end: u32 },

    #[error("scene resolution {scene} does not match manifest resolution {expected}")]
    ResolutionMismatch {
        scene: Resolution,
        expected: Resolution,
    },

    #[error("scene contains no visible renderable objects")]
    NoRenderableObjects,

    #[error("material '{material}' references missing texture '{}'", path.display())]
    MissingTexture { material: String, path: PathBuf },
}

/// Pre-flight guardrail battery.
///
/// Runs every check and returns the complete violation list so operators fix
/// all import problems in one pass, not one per run. Any non-empty list is
/// fatal for the job.
///
/// A wholly absent camera is not a violation here: camera placement is the
/// phase that follows the guardrail check and authors one deterministically.
/// A camera that exists but is a bare stub is flagged.
pub struct SceneValidator;

impl SceneValidator {
    pub fn validate(
        scene: &SceneDescription,
        manifest: &Manifest,
    ) -> Result<(), Vec<ValidationError>> {
        let mut violations = Vec::new();

        if let Some(camera) = &scene.camera
            && camera.params.is_none()
        {
            violations.push(ValidationError::StubCamera(camera.name.clone()));
        }

        if scene.frame_end <= scene.frame_start {
            violations.push(ValidationError::EmptyFrameRange {
                start: scene.frame_start,
                end: scene.frame_end,
            });
        }

        let expected = manifest.expected_outputs.resolution;
        if scene.resolution != expected {
            violations.push(ValidationError::ResolutionMismatch {
                scene: scene.resolution,
                expected,
            });
        }

        if scene.visible_renderable_objects().next().is_none() {
            violations.push(ValidationError::NoRenderableObjects);
        }

        for material in &scene.materials {
            if let Some(path) = &material.texture_path
                && !path.exists()
            {
                violations.push(ValidationError::MissingTexture {
                    material: material.name.clone(),
                    path: path.clone(),
                });
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }
}

/// Join a violation list into the single fatal error message a failed
/// guardrail phase reports.
pub fn violations_message(violations: &[ValidationError]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
