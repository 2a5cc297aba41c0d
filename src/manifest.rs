use std::path::Path;

use anyhow::Context as _;
use chrono::Utc;
use tracing::warn;

use crate::{
    atomic,
    error::{KilnError, KilnResult},
    hash,
    settings::{ExpectedOutputs, RenderSettings},
};

/// Immutable, content-hashed description of a render job's inputs.
///
/// Created once per job before scene creation, persisted to disk, and read
/// back (never re-derived) by every later phase. The only mutation ever
/// applied is the one-time `scene_file_hash` fill-in after the scene file has
/// been produced.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct Manifest {
    pub job_id: String,
    /// RFC 3339 creation time. Part of the hashed inputs.
    pub timestamp: String,
    pub tool_version: String,
    pub settings: RenderSettings,
    pub expected_outputs: ExpectedOutputs,
    /// SHA-256 over the canonical serialization of
    /// (settings, timestamp, tool_version, expected_outputs).
    pub validation_hash: String,
    /// SHA-256 of the produced scene file, filled in after scene creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene_file_hash: Option<String>,
}

/// The exact byte sequence the validation hash is computed over. Field order
/// is fixed by this struct; map keys inside `settings.extra` are sorted by
/// its `BTreeMap`, so semantically equal settings always hash identically.
#[derive(serde::Serialize)]
struct HashInputs<'a> {
    settings: &'a RenderSettings,
    timestamp: &'a str,
    tool_version: &'a str,
    expected_outputs: &'a ExpectedOutputs,
}

fn compute_validation_hash(
    settings: &RenderSettings,
    timestamp: &str,
    tool_version: &str,
    expected_outputs: &ExpectedOutputs,
) -> KilnResult<String> {
    let inputs = HashInputs {
        settings,
        timestamp,
        tool_version,
        expected_outputs,
    };
    let canonical = serde_json::to_vec(&inputs)
        .map_err(|e| KilnError::serde(format!("canonicalize manifest inputs: {e}")))?;
    Ok(hash::sha256_hex(&canonical))
}

impl Manifest {
    pub fn create(
        job_id: impl Into<String>,
        settings: RenderSettings,
        tool_version: impl Into<String>,
    ) -> KilnResult<Self> {
        settings.validate()?;
        let tool_version = tool_version.into();
        let timestamp = Utc::now().to_rfc3339();
        let expected_outputs = ExpectedOutputs::derive(&settings);
        let validation_hash =
            compute_validation_hash(&settings, &timestamp, &tool_version, &expected_outputs)?;
        Ok(Self {
            job_id: job_id.into(),
            timestamp,
            tool_version,
            settings,
            expected_outputs,
            validation_hash,
            scene_file_hash: None,
        })
    }

    /// Record the hash of the scene file this manifest's job produced.
    /// One-time fill-in; the validation hash is unaffected.
    pub fn record_scene_file(&mut self, scene_file: &Path) -> KilnResult<()> {
        self.scene_file_hash = Some(hash::sha256_file(scene_file)?);
        Ok(())
    }

    /// Recompute the validation hash from `current` inputs and compare it to
    /// the stored one. Any mismatch returns false; the critical fields are
    /// compared individually first so the log carries a usable failure signal
    /// before the opaque hash comparison.
    pub fn validate_against(&self, current: &RenderSettings, current_tool_version: &str) -> bool {
        if current.resolution != self.settings.resolution {
            warn!(
                stored = %self.settings.resolution,
                current = %current.resolution,
                "manifest resolution mismatch"
            );
            return false;
        }
        if current.fps != self.settings.fps {
            warn!(
                stored = self.settings.fps,
                current = current.fps,
                "manifest fps mismatch"
            );
            return false;
        }
        if current.duration_secs != self.settings.duration_secs {
            warn!(
                stored = self.settings.duration_secs,
                current = current.duration_secs,
                "manifest duration mismatch"
            );
            return false;
        }
        if current.engine != self.settings.engine {
            warn!(
                stored = %self.settings.engine,
                current = %current.engine,
                "manifest render engine mismatch"
            );
            return false;
        }

        let recomputed = match compute_validation_hash(
            current,
            &self.timestamp,
            current_tool_version,
            &self.expected_outputs,
        ) {
            Ok(h) => h,
            Err(e) => {
                warn!(error = %e, "failed to recompute manifest hash");
                return false;
            }
        };
        recomputed == self.validation_hash
    }

    /// Verify the scene file on disk still hashes to the recorded
    /// `scene_file_hash`. Detects tampering or non-determinism introduced
    /// between scene creation and rendering. A missing recorded hash fails.
    pub fn verify_scene_file(&self, scene_file: &Path) -> KilnResult<()> {
        let Some(expected) = &self.scene_file_hash else {
            return Err(KilnError::manifest(
                "manifest has no recorded scene file hash",
            ));
        };
        let actual = hash::sha256_file(scene_file)?;
        if &actual != expected {
            return Err(KilnError::manifest(format!(
                "scene file '{}' hash drift: expected {expected}, got {actual}",
                scene_file.display()
            )));
        }
        Ok(())
    }

    /// Persist atomically. Rendering must not start unless this succeeds.
    pub fn save_atomic(&self, path: &Path) -> KilnResult<()> {
        atomic::write_json_atomic(path, self)
    }

    pub fn load(path: &Path) -> KilnResult<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("read manifest '{}'", path.display()))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| KilnError::serde(format!("parse manifest '{}': {e}", path.display())))
    }
}
