use std::path::{Path, PathBuf};

use anyhow::Context as _;

use crate::error::KilnResult;

/// Per-job directory layout. One directory per `job_id`, exclusively owned
/// by that job's pipeline instance for its lifetime.
///
/// ```text
/// <data_root>/<job_id>/
///   manifest.json
///   blend/<job_id>.blend          scene file
///   blend/<job_id>.scene.json     scene description (cross-process contract)
///   blend/<job_id>.params.json    scene-creation parameters
///   frames/frame_%04d.png         per-frame output (+ .ok sidecars)
///   output/<job_id>.mp4
///   logs/supervisor.jsonl
///   status.json  metrics.json  result.json
/// ```
#[derive(Clone, Debug)]
pub struct JobPaths {
    root: PathBuf,
    job_id: String,
}

impl JobPaths {
    pub fn new(data_root: impl Into<PathBuf>, job_id: impl Into<String>) -> Self {
        let job_id = job_id.into();
        Self {
            root: data_root.into().join(&job_id),
            job_id,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn create_all(&self) -> KilnResult<()> {
        for dir in [
            self.root.clone(),
            self.blend_dir(),
            self.frames_dir(),
            self.output_dir(),
            self.logs_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("create job directory '{}'", dir.display()))?;
        }
        Ok(())
    }

    pub fn manifest_file(&self) -> PathBuf {
        self.root.join("manifest.json")
    }

    pub fn blend_dir(&self) -> PathBuf {
        self.root.join("blend")
    }

    pub fn scene_file(&self) -> PathBuf {
        self.blend_dir().join(format!("{}.blend", self.job_id))
    }

    pub fn scene_description_file(&self) -> PathBuf {
        self.blend_dir().join(format!("{}.scene.json", self.job_id))
    }

    pub fn scene_params_file(&self) -> PathBuf {
        self.blend_dir().join(format!("{}.params.json", self.job_id))
    }

    pub fn frames_dir(&self) -> PathBuf {
        self.root.join("frames")
    }

    pub fn frame_image(&self, frame: u32) -> PathBuf {
        self.frames_dir().join(format!("frame_{frame:04}.png"))
    }

    /// ffmpeg image2 input pattern over the frames directory.
    pub fn frame_pattern(&self) -> PathBuf {
        self.frames_dir().join("frame_%04d.png")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join("output")
    }

    pub fn video_file(&self) -> PathBuf {
        self.output_dir().join(format!("{}.mp4", self.job_id))
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn supervisor_log(&self) -> PathBuf {
        self.logs_dir().join("supervisor.jsonl")
    }

    pub fn status_file(&self) -> PathBuf {
        self.root.join("status.json")
    }

    pub fn metrics_file(&self) -> PathBuf {
        self.root.join("metrics.json")
    }

    pub fn result_file(&self) -> PathBuf {
        self.root.join("result.json")
    }
}
