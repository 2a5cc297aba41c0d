use std::{
    io::Write as _,
    path::{Path, PathBuf},
};

use anyhow::Context as _;
use chrono::{DateTime, Utc};

use crate::error::{KilnError, KilnResult};

/// Extension appended to a primary output to form its completion-marker path.
pub const OK_MARKER_EXT: &str = "ok";

/// Sidecar written next to a finished output file.
///
/// The marker, not the primary file, is the authoritative signal that a unit
/// of work finished: a crash mid-write can leave the primary file visible and
/// truncated, but the marker is only written after the primary file has been
/// atomically renamed into place.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct CompletionMarker {
    pub completed_at: DateTime<Utc>,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

pub fn marker_path(output: &Path) -> PathBuf {
    let mut os = output.as_os_str().to_os_string();
    os.push(".");
    os.push(OK_MARKER_EXT);
    PathBuf::from(os)
}

pub fn ensure_parent_dir(path: &Path) -> KilnResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory '{}'", parent.display()))?;
    }
    Ok(())
}

/// Write `bytes` to `path` so the file is observed either fully absent (or
/// untouched, if it existed) or fully written.
///
/// The temp file lives in the same directory as `path`, which keeps the final
/// rename on one filesystem. On any failure the temp file is removed before
/// the error propagates.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> KilnResult<()> {
    ensure_parent_dir(path)?;
    let tmp = tmp_path(path);

    let result = write_and_sync(&tmp, bytes).and_then(|()| {
        std::fs::rename(&tmp, path).with_context(|| {
            format!("rename '{}' -> '{}'", tmp.display(), path.display())
        })?;
        Ok(())
    });

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

fn write_and_sync(tmp: &Path, bytes: &[u8]) -> KilnResult<()> {
    let mut file = std::fs::File::create(tmp)
        .with_context(|| format!("create temp file '{}'", tmp.display()))?;
    file.write_all(bytes)
        .with_context(|| format!("write temp file '{}'", tmp.display()))?;
    file.sync_all()
        .with_context(|| format!("sync temp file '{}'", tmp.display()))?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> KilnResult<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| KilnError::serde(format!("serialize '{}': {e}", path.display())))?;
    write_atomic(path, &bytes)
}

/// Write the `.ok` marker for `output`, recording its current size.
pub fn write_completion_marker(output: &Path, sha256: Option<String>) -> KilnResult<()> {
    let meta = std::fs::metadata(output)
        .with_context(|| format!("stat output '{}'", output.display()))?;
    let marker = CompletionMarker {
        completed_at: Utc::now(),
        size_bytes: meta.len(),
        sha256,
    };
    write_json_atomic(&marker_path(output), &marker)
}

pub fn read_completion_marker(output: &Path) -> KilnResult<CompletionMarker> {
    let path = marker_path(output);
    let bytes = std::fs::read(&path)
        .with_context(|| format!("read completion marker '{}'", path.display()))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| KilnError::serde(format!("parse completion marker '{}': {e}", path.display())))
}

/// A frame (or any output) counts as complete only if the primary file exists
/// with nonzero size AND its marker exists and parses. The file alone is not
/// enough.
pub fn is_output_complete(output: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(output) else {
        return false;
    };
    if !meta.is_file() || meta.len() == 0 {
        return false;
    }
    read_completion_marker(output).is_ok()
}
