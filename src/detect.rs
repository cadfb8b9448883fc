// This file is part of Sightline, a multi-camera person-flow analytics engine.
// Copyright (C) 2025 The Sightline Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The shared inference capability.
//!
//! Tracking workers see only the [`Detector`] trait: frame in, a list of
//! (class, confidence, bbox, track id) out. The ONNX-Runtime YOLO backend
//! is compiled in with `--features analytics`; otherwise a stub is wired in
//! which warns once and reports nothing, so the rest of the system (capture,
//! HTTP, retention) still runs.

use crate::stream::Frame;
use base::Error;
use std::path::PathBuf;
use std::sync::Arc;

#[cfg(feature = "analytics")]
mod yolo;

/// One detection in the coordinates of the frame handed to the detector.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub class_id: i64,
    pub confidence: f32,
    /// `(x1, y1, x2, y2)`.
    pub bbox: (f32, f32, f32, f32),
    /// Tracker-assigned id, stable across frames while the object stays in
    /// view. Detections without one are ignored by the pipeline.
    pub track_id: Option<i64>,
}

impl Detection {
    pub fn centroid(&self) -> (f64, f64) {
        let (x1, y1, x2, y2) = self.bbox;
        (f64::from(x1 + x2) / 2.0, f64::from(y1 + y2) / 2.0)
    }
}

/// Detection + persistent tracking over one camera's frames.
///
/// Implementations are shared read-only across all tracking workers and
/// must be thread-safe; `camera_id` keys any per-camera tracker state.
pub trait Detector: Send + Sync {
    fn detect_and_track(&self, camera_id: &str, frame: &Frame) -> Result<Vec<Detection>, Error>;
}

#[derive(Clone, Debug)]
pub struct DetectorConfig {
    pub model_path: PathBuf,
    pub confidence_threshold: f32,
    pub person_class_id: i64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        DetectorConfig {
            model_path: "yolov8n.onnx".into(),
            confidence_threshold: 0.25,
            person_class_id: 0,
        }
    }
}

/// Loads the compiled-in detector backend.
#[cfg(feature = "analytics")]
pub fn load(config: &DetectorConfig) -> Result<Arc<dyn Detector>, Error> {
    Ok(yolo::YoloDetector::load(config)?)
}

#[cfg(not(feature = "analytics"))]
pub fn load(_config: &DetectorConfig) -> Result<Arc<dyn Detector>, Error> {
    Ok(Arc::new(StubDetector {
        warned: std::sync::atomic::AtomicBool::new(false),
    }))
}

/// Stands in when no inference backend is compiled.
#[cfg(not(feature = "analytics"))]
struct StubDetector {
    warned: std::sync::atomic::AtomicBool,
}

#[cfg(not(feature = "analytics"))]
impl Detector for StubDetector {
    fn detect_and_track(&self, _camera_id: &str, _frame: &Frame) -> Result<Vec<Detection>, Error> {
        if !self.warned.swap(true, std::sync::atomic::Ordering::SeqCst) {
            tracing::warn!(
                "compiled without --features analytics; person detection reports nothing"
            );
        }
        Ok(Vec::new())
    }
}
