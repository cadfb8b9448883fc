// This file is part of Sightline, a multi-camera person-flow analytics engine.
// Copyright (C) 2025 The Sightline Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The on-disk snapshot store.
//!
//! Layout: `<root>/<camera_id>/snapshot_YYYYMMDD_HHMMSS_ffffff.jpg`. Tracking
//! workers create files; this module owns retention. The sweeper enforces a
//! per-directory FIFO cap, so a noisy camera cannot evict a quiet one's
//! stills. A snapshot may outlive the deletion of the event row referencing
//! it; the sweeper is authoritative for disk state.

use base::{bail, shutdown, Error, ErrorKind, ResultExt as _};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};

pub struct SnapshotDir {
    root: PathBuf,
}

/// Returns whether `name` is safe to join under the store: a bare filename,
/// no separators, no `..`, no absolute paths.
pub fn is_safe_component(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}

impl SnapshotDir {
    /// Opens the store rooted at `root`, creating the directory if missing.
    pub fn open(root: &Path) -> Result<Arc<Self>, Error> {
        fs::create_dir_all(root).err_kind(ErrorKind::Unavailable)?;
        Ok(Arc::new(SnapshotDir {
            root: root.to_owned(),
        }))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Writes one JPEG under `<root>/<camera_id>/<filename>`, creating the
    /// camera directory on first use. Returns the full path written.
    pub fn write(&self, camera_id: &str, filename: &str, jpeg: &[u8]) -> Result<PathBuf, Error> {
        if !is_safe_component(camera_id) || !is_safe_component(filename) {
            bail!(InvalidArgument, "unsafe snapshot path component");
        }
        let dir = self.root.join(camera_id);
        fs::create_dir_all(&dir).err_kind(ErrorKind::Unavailable)?;
        let path = dir.join(filename);
        fs::write(&path, jpeg).err_kind(ErrorKind::Unavailable)?;
        Ok(path)
    }

    /// Resolves a snapshot for serving. Rejects path traversal; the caller
    /// maps `PermissionDenied` to HTTP 403.
    pub fn resolve(&self, camera_id: &str, filename: &str) -> Result<PathBuf, Error> {
        if !is_safe_component(camera_id) || !is_safe_component(filename) {
            bail!(PermissionDenied, "snapshot path escapes the store");
        }
        Ok(self.root.join(camera_id).join(filename))
    }

    /// Lists up to `limit` snapshot filenames for one camera, newest first
    /// by mtime. A camera with no directory yet has no snapshots.
    pub fn list_recent(&self, camera_id: &str, limit: usize) -> Result<Vec<String>, Error> {
        if !is_safe_component(camera_id) {
            bail!(InvalidArgument, "unsafe camera id");
        }
        let mut files = match jpgs_by_mtime(&self.root.join(camera_id)) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::wrap(ErrorKind::Unavailable, e)),
        };
        files.reverse();
        files.truncate(limit);
        Ok(files
            .into_iter()
            .filter_map(|(_, p)| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect())
    }

    /// One retention pass: for each camera subdirectory independently,
    /// deletes the oldest `.jpg` files (by mtime) until at most `max_files`
    /// remain. Individual deletion errors are logged and skipped.
    pub fn sweep(&self, max_files: usize) {
        let entries = match fs::read_dir(&self.root) {
            Ok(e) => e,
            Err(e) => {
                warn!(root = %self.root.display(), %e, "unable to scan snapshot root");
                return;
            }
        };
        for entry in entries {
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            if path.is_dir() {
                self.sweep_camera_dir(&path, max_files);
            }
        }
    }

    fn sweep_camera_dir(&self, dir: &Path, max_files: usize) {
        let files = match jpgs_by_mtime(dir) {
            Ok(f) => f,
            Err(e) => {
                warn!(dir = %dir.display(), %e, "unable to list snapshot dir");
                return;
            }
        };
        if files.len() <= max_files {
            return;
        }
        let num_to_delete = files.len() - max_files;
        let mut deleted = 0;
        for (_, path) in &files[..num_to_delete] {
            match fs::remove_file(path) {
                Ok(()) => {
                    debug!(path = %path.display(), "deleted snapshot");
                    deleted += 1;
                }
                Err(e) => error!(path = %path.display(), %e, "failed to delete snapshot"),
            }
        }
        info!(
            dir = %dir.display(),
            deleted,
            remaining = files.len() - deleted,
            "retention sweep complete"
        );
    }
}

/// The `.jpg` files directly under `dir`, sorted ascending by mtime.
fn jpgs_by_mtime(dir: &Path) -> Result<Vec<(SystemTime, PathBuf)>, std::io::Error> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("jpg") {
            continue;
        }
        let mtime = entry.metadata()?.modified()?;
        files.push((mtime, path));
    }
    files.sort();
    Ok(files)
}

/// Starts the retention sweeper daemon thread. It runs one sweep per
/// `interval` until shutdown.
pub fn start_sweeper(
    dir: Arc<SnapshotDir>,
    max_files: usize,
    interval: Duration,
    shutdown_rx: shutdown::Receiver,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("snapshot-sweeper".to_owned())
        .spawn(move || {
            info!(
                root = %dir.root().display(),
                max_files,
                interval_secs = interval.as_secs(),
                "snapshot sweeper running"
            );
            while shutdown_rx.wait_for(interval).is_ok() {
                dir.sweep(max_files);
            }
            info!("snapshot sweeper exiting");
        })
        .expect("can't create thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(dir: &SnapshotDir, camera: &str, name: &str, age_rank: u64) {
        let path = dir.write(camera, name, b"\xff\xd8\xff\xd9").unwrap();
        // Space mtimes a few seconds apart so the sort order is unambiguous
        // regardless of filesystem timestamp granularity.
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000 + age_rank * 10);
        let ft = fs::File::options().append(true).open(&path).unwrap();
        ft.set_modified(t).unwrap();
    }

    #[test]
    fn fifo_retention() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = SnapshotDir::open(tmp.path()).unwrap();
        for i in 0..8 {
            touch(&dir, "cam", &format!("snapshot_{i}.jpg"), i);
        }
        dir.sweep(5);
        let mut left = dir.list_recent("cam", 100).unwrap();
        left.sort();
        assert_eq!(
            left,
            vec![
                "snapshot_3.jpg",
                "snapshot_4.jpg",
                "snapshot_5.jpg",
                "snapshot_6.jpg",
                "snapshot_7.jpg"
            ]
        );
    }

    #[test]
    fn caps_are_per_camera() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = SnapshotDir::open(tmp.path()).unwrap();
        for i in 0..6 {
            touch(&dir, "noisy", &format!("snapshot_{i}.jpg"), i);
        }
        touch(&dir, "quiet", "snapshot_only.jpg", 0);
        dir.sweep(3);
        assert_eq!(dir.list_recent("noisy", 100).unwrap().len(), 3);
        // The noisy camera's churn must not evict the quiet one's still.
        assert_eq!(dir.list_recent("quiet", 100).unwrap().len(), 1);
    }

    #[test]
    fn non_jpg_files_are_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = SnapshotDir::open(tmp.path()).unwrap();
        touch(&dir, "cam", "snapshot_a.jpg", 0);
        fs::write(tmp.path().join("cam/notes.txt"), b"keep me").unwrap();
        dir.sweep(0);
        assert!(tmp.path().join("cam/notes.txt").exists());
        assert!(dir.list_recent("cam", 100).unwrap().is_empty());
    }

    #[test]
    fn list_recent_is_newest_first() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = SnapshotDir::open(tmp.path()).unwrap();
        touch(&dir, "cam", "snapshot_old.jpg", 0);
        touch(&dir, "cam", "snapshot_new.jpg", 1);
        assert_eq!(
            dir.list_recent("cam", 1).unwrap(),
            vec!["snapshot_new.jpg"]
        );
        assert!(dir.list_recent("absent", 10).unwrap().is_empty());
    }

    #[test]
    fn rejects_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = SnapshotDir::open(tmp.path()).unwrap();
        for (cam, file) in [
            ("..", "x.jpg"),
            ("cam", "../x.jpg"),
            ("cam", "/etc/passwd"),
            ("cam", ""),
            ("a/b", "x.jpg"),
        ] {
            assert_eq!(
                dir.resolve(cam, file).unwrap_err().kind(),
                ErrorKind::PermissionDenied,
                "{cam}/{file}"
            );
        }
        dir.resolve("cam", "snapshot_1.jpg").unwrap();
    }
}
