use std::{
    path::Path,
    time::{Duration, SystemTime},
};

use tracing::{debug, warn};

use crate::error::KilnResult;

/// Bytes and entries removed by one sweep. Monotonically accumulated, never
/// negative.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CleanupStats {
    pub bytes_freed: u64,
    pub files_cleaned: u64,
    pub dirs_removed: u64,
}

impl CleanupStats {
    pub fn merge(&mut self, other: CleanupStats) {
        self.bytes_freed += other.bytes_freed;
        self.files_cleaned += other.files_cleaned;
        self.dirs_removed += other.dirs_removed;
    }
}

/// Removes frame artifacts older than an age threshold.
///
/// Only frame images and `.ok` markers are touched, and only when strictly
/// older than the cutoff: a file whose age equals `max_age` exactly is kept,
/// so redundant sweeps never eat into the retention window. Per-file failures
/// are logged and skipped; the sweep itself is best-effort by design.
pub struct CleanupSweeper;

impl CleanupSweeper {
    pub fn sweep(directory: &Path, max_age: Duration) -> KilnResult<CleanupStats> {
        Self::sweep_at(directory, max_age, SystemTime::now())
    }

    fn sweep_at(directory: &Path, max_age: Duration, now: SystemTime) -> KilnResult<CleanupStats> {
        let mut stats = CleanupStats::default();
        if !directory.is_dir() {
            return Ok(stats);
        }

        let entries = match std::fs::read_dir(directory) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %directory.display(), error = %e, "cleanup sweep could not read directory");
                return Ok(stats);
            }
        };

        let mut remaining = 0u64;
        for entry in entries.flatten() {
            let path = entry.path();
            if !is_sweepable(&path) {
                remaining += 1;
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                remaining += 1;
                continue;
            };
            if !meta.is_file() {
                remaining += 1;
                continue;
            }

            let age = meta
                .modified()
                .ok()
                .and_then(|mtime| now.duration_since(mtime).ok());
            // Delete only when strictly older than the threshold. An
            // unreadable or future mtime counts as "not old enough".
            let expired = age.is_some_and(|age| age > max_age);
            if !expired {
                remaining += 1;
                continue;
            }

            match std::fs::remove_file(&path) {
                Ok(()) => {
                    stats.bytes_freed += meta.len();
                    stats.files_cleaned += 1;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "cleanup failed to remove file");
                    remaining += 1;
                }
            }
        }

        if remaining == 0 && std::fs::remove_dir(directory).is_ok() {
            stats.dirs_removed += 1;
        }

        debug!(
            dir = %directory.display(),
            bytes = stats.bytes_freed,
            files = stats.files_cleaned,
            dirs = stats.dirs_removed,
            "cleanup sweep finished"
        );
        Ok(stats)
    }
}

fn is_sweepable(path: &Path) -> bool {
    match path.extension().and_then(|e| e.to_str()) {
        Some("png") | Some("ok") | Some("tmp") => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mtime(path: &Path) -> SystemTime {
        std::fs::metadata(path).unwrap().modified().unwrap()
    }

    #[test]
    fn files_at_or_inside_the_window_survive() {
        let dir = tempfile::tempdir().unwrap();
        let frames = dir.path().join("frames");
        std::fs::create_dir(&frames).unwrap();
        let frame = frames.join("frame_0001.png");
        std::fs::write(&frame, b"pixels").unwrap();

        let max_age = Duration::from_secs(3600);
        let born = mtime(&frame);

        // Age exactly equal to the cutoff: kept.
        let stats = CleanupSweeper::sweep_at(&frames, max_age, born + max_age).unwrap();
        assert_eq!(stats.files_cleaned, 0);
        assert!(frame.exists());

        // One second younger than the cutoff: kept.
        let stats =
            CleanupSweeper::sweep_at(&frames, max_age, born + max_age - Duration::from_secs(1))
                .unwrap();
        assert_eq!(stats.files_cleaned, 0);
        assert!(frame.exists());

        // One second older than the cutoff: deleted.
        let stats =
            CleanupSweeper::sweep_at(&frames, max_age, born + max_age + Duration::from_secs(1))
                .unwrap();
        assert_eq!(stats.files_cleaned, 1);
        assert_eq!(stats.bytes_freed, 6);
        assert!(!frame.exists());
    }

    #[test]
    fn emptied_directory_is_removed_and_counted() {
        let dir = tempfile::tempdir().unwrap();
        let frames = dir.path().join("frames");
        std::fs::create_dir(&frames).unwrap();
        std::fs::write(frames.join("frame_0001.png"), b"a").unwrap();
        std::fs::write(frames.join("frame_0001.png.ok"), b"{}").unwrap();

        let now = SystemTime::now() + Duration::from_secs(7200);
        let stats = CleanupSweeper::sweep_at(&frames, Duration::from_secs(3600), now).unwrap();
        assert_eq!(stats.files_cleaned, 2);
        assert_eq!(stats.dirs_removed, 1);
        assert!(!frames.exists());
    }

    #[test]
    fn unrelated_files_block_directory_removal_and_survive() {
        let dir = tempfile::tempdir().unwrap();
        let frames = dir.path().join("frames");
        std::fs::create_dir(&frames).unwrap();
        std::fs::write(frames.join("frame_0001.png"), b"a").unwrap();
        std::fs::write(frames.join("notes.txt"), b"keep me").unwrap();

        let now = SystemTime::now() + Duration::from_secs(7200);
        let stats = CleanupSweeper::sweep_at(&frames, Duration::from_secs(3600), now).unwrap();
        assert_eq!(stats.files_cleaned, 1);
        assert_eq!(stats.dirs_removed, 0);
        assert!(frames.join("notes.txt").exists());
    }

    #[test]
    fn missing_directory_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let stats =
            CleanupSweeper::sweep(&dir.path().join("nope"), Duration::from_secs(1)).unwrap();
        assert_eq!(stats, CleanupStats::default());
    }

    #[test]
    fn redundant_sweeps_never_delete_fresh_files() {
        let dir = tempfile::tempdir().unwrap();
        let frames = dir.path().join("frames");
        std::fs::create_dir(&frames).unwrap();
        std::fs::write(frames.join("frame_0001.png"), b"a").unwrap();

        for _ in 0..3 {
            let stats = CleanupSweeper::sweep(&frames, Duration::from_secs(3600)).unwrap();
            assert_eq!(stats.files_cleaned, 0);
        }
        assert!(frames.join("frame_0001.png").exists());
    }
}
