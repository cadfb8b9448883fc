// This file is part of Sightline, a multi-camera person-flow analytics engine.
// Copyright (C) 2025 The Sightline Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Runtime configuration file (`/etc/sightline.toml`).

use serde::Deserialize;
use std::path::PathBuf;

/// Top-level configuration file object. Every key has a default, so an
/// empty file is valid; unknown keys are rejected.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ConfigFile {
    pub camera: CameraSection,
    pub detection: DetectionSection,
    pub database: DatabaseSection,
    pub snapshots: SnapshotsSection,
    pub api: ApiSection,
    pub logging: LoggingSection,
}

/// Defaults for new sources and the bootstrap camera.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CameraSection {
    /// Source descriptor of the camera registered as `main` when the
    /// database holds none: a device index, device path, file, or URL.
    pub device_id: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for CameraSection {
    fn default() -> Self {
        CameraSection {
            device_id: "0".to_owned(),
            width: 640,
            height: 480,
            fps: 30,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DetectionSection {
    pub model_path: PathBuf,
    pub confidence_threshold: f32,
    pub idle_fps: f64,
    pub active_fps: f64,
    pub person_class_id: i64,
    /// Dot-product threshold for entry/exit classification.
    pub direction_threshold: f64,
}

impl Default for DetectionSection {
    fn default() -> Self {
        DetectionSection {
            model_path: "yolov8n.onnx".into(),
            confidence_threshold: 0.25,
            idle_fps: 1.0,
            active_fps: 5.0,
            person_class_id: 0,
            direction_threshold: 0.2,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DatabaseSection {
    /// The SQLite database file. Its parent directory is flock'd.
    pub path: PathBuf,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        DatabaseSection {
            path: "/var/lib/sightline/db/sightline.db".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SnapshotsSection {
    pub root: PathBuf,
    /// Per-camera-directory FIFO cap.
    pub max_files: usize,
    /// Seconds between retention sweeps.
    pub cleanup_interval: u64,
}

impl Default for SnapshotsSection {
    fn default() -> Self {
        SnapshotsSection {
            root: "/var/lib/sightline/snapshots".into(),
            max_files: 1000,
            cleanup_interval: 3600,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ApiSection {
    pub host: String,
    pub port: u16,
    /// Defaults the log filter to `debug` (when neither `SIGHTLINE_LOG`
    /// nor `logging.level` says otherwise).
    pub debug: bool,
    /// Fabricate deterministic chart values for cameras with no events.
    /// A UI concession; never included in totals.
    pub demo_fill: bool,
}

impl Default for ApiSection {
    fn default() -> Self {
        ApiSection {
            host: "0.0.0.0".to_owned(),
            port: 8080,
            debug: false,
            demo_fill: false,
        }
    }
}

/// The rotating file sink itself is an external collaborator; these keys
/// are recognized here so one config file serves both it and this process.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LoggingSection {
    /// Fallback filter directive when `SIGHTLINE_LOG` is unset.
    pub level: Option<String>,
    pub file: Option<PathBuf>,
    pub max_size_mb: Option<u64>,
    pub backup_count: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_all_defaults() {
        let c: ConfigFile = toml::from_str("").unwrap();
        assert_eq!(c.camera.device_id, "0");
        assert_eq!(c.detection.active_fps, 5.0);
        assert_eq!(c.snapshots.max_files, 1000);
        assert_eq!(c.api.port, 8080);
        assert!(!c.api.demo_fill);
    }

    #[test]
    fn partial_sections_fill_in() {
        let c: ConfigFile = toml::from_str(
            r#"
            [detection]
            idle_fps = 0.5

            [api]
            port = 9000
            demo_fill = true
            "#,
        )
        .unwrap();
        assert_eq!(c.detection.idle_fps, 0.5);
        assert_eq!(c.detection.active_fps, 5.0);
        assert_eq!(c.api.port, 9000);
        assert!(c.api.demo_fill);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        toml::from_str::<ConfigFile>("[api]\nbogus = 1\n").unwrap_err();
        toml::from_str::<ConfigFile>("[bogus]\n").unwrap_err();
    }
}
