// This file is part of Sightline, a multi-camera person-flow analytics engine.
// Copyright (C) 2025 The Sightline Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! YOLOv8 person detection on ONNX Runtime, with greedy-IoU track ids.
//!
//! The model is the standard ultralytics ONNX export: input `images`
//! `[1,3,640,640]` RGB 0..1, output `output0` `[1, 4+classes, anchors]`.
//! Inference runs under a mutex (one interpreter shared by all workers).
//! Track-id assignment is per camera and intentionally simple: detections
//! are matched to the previous frame's boxes by IoU, unmatched boxes start
//! new tracks, and tracks idle too long are dropped.

use super::{Detection, Detector, DetectorConfig};
use crate::stream::Frame;
use base::{err, Error, ErrorKind, FastHashMap, Mutex, ResultExt as _};
use ndarray::Array4;
use std::sync::Arc;
use tracing::info;

const INPUT_SIZE: u32 = 640;
const NMS_IOU: f32 = 0.45;
const TRACK_MATCH_IOU: f32 = 0.3;
/// Frames a track may miss before its id is retired.
const TRACK_MAX_MISSES: u32 = 30;

pub(super) struct YoloDetector {
    session: Mutex<ort::Session>,
    trackers: Mutex<FastHashMap<String, IouTracker>>,
    config: DetectorConfig,
}

impl YoloDetector {
    pub(super) fn load(config: &DetectorConfig) -> Result<Arc<Self>, Error> {
        let session = ort::Session::builder()
            .err_kind(ErrorKind::Internal)?
            .with_optimization_level(ort::GraphOptimizationLevel::Level3)
            .err_kind(ErrorKind::Internal)?
            .commit_from_file(&config.model_path)
            .map_err(|e| {
                err!(
                    FailedPrecondition,
                    "unable to load model {}: {e}",
                    config.model_path.display()
                )
            })?;
        info!(model = %config.model_path.display(), "detection model loaded");
        Ok(Arc::new(YoloDetector {
            session: Mutex::new(session),
            trackers: Mutex::new(FastHashMap::default()),
            config: config.clone(),
        }))
    }

    /// Scales the frame to the model input and normalizes to `[0,1]` NCHW.
    fn preprocess(frame: &Frame) -> Array4<f32> {
        let img = image::RgbImage::from_raw(frame.width(), frame.height(), frame.data().to_vec())
            .expect("Frame guarantees width*height*3 bytes");
        let resized = image::imageops::resize(
            &img,
            INPUT_SIZE,
            INPUT_SIZE,
            image::imageops::FilterType::Triangle,
        );
        let mut input = Array4::<f32>::zeros((1, 3, INPUT_SIZE as usize, INPUT_SIZE as usize));
        for (x, y, pixel) in resized.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            input[[0, 0, y, x]] = f32::from(pixel[0]) / 255.0;
            input[[0, 1, y, x]] = f32::from(pixel[1]) / 255.0;
            input[[0, 2, y, x]] = f32::from(pixel[2]) / 255.0;
        }
        input
    }
}

impl Detector for YoloDetector {
    fn detect_and_track(&self, camera_id: &str, frame: &Frame) -> Result<Vec<Detection>, Error> {
        let input = Self::preprocess(frame);
        let raw = {
            let session = self.session.lock();
            let outputs = session
                .run(ort::inputs!["images" => input.view()].err_kind(ErrorKind::Internal)?)
                .err_kind(ErrorKind::Internal)?;
            let output = outputs["output0"]
                .try_extract_tensor::<f32>()
                .err_kind(ErrorKind::Internal)?;
            // [1, 4+classes, anchors] -> owned so the session lock can drop.
            output.to_owned()
        };

        let shape = raw.shape();
        let (rows, anchors) = (shape[1], shape[2]);
        let classes = rows - 4;
        let sx = frame.width() as f32 / INPUT_SIZE as f32;
        let sy = frame.height() as f32 / INPUT_SIZE as f32;

        let mut candidates = Vec::new();
        for a in 0..anchors {
            let (mut best_class, mut best_score) = (0usize, 0f32);
            for c in 0..classes {
                let score = raw[[0, 4 + c, a]];
                if score > best_score {
                    (best_class, best_score) = (c, score);
                }
            }
            if best_score < self.config.confidence_threshold {
                continue;
            }
            let (cx, cy) = (raw[[0, 0, a]], raw[[0, 1, a]]);
            let (w, h) = (raw[[0, 2, a]], raw[[0, 3, a]]);
            candidates.push(Detection {
                class_id: best_class as i64,
                confidence: best_score,
                bbox: (
                    (cx - w / 2.0) * sx,
                    (cy - h / 2.0) * sy,
                    (cx + w / 2.0) * sx,
                    (cy + h / 2.0) * sy,
                ),
                track_id: None,
            });
        }
        let mut detections = non_max_suppression(candidates);

        let mut trackers = self.trackers.lock();
        trackers
            .entry(camera_id.to_owned())
            .or_default()
            .assign(&mut detections);
        Ok(detections)
    }
}

fn iou(a: (f32, f32, f32, f32), b: (f32, f32, f32, f32)) -> f32 {
    let ix = (a.2.min(b.2) - a.0.max(b.0)).max(0.0);
    let iy = (a.3.min(b.3) - a.1.max(b.1)).max(0.0);
    let inter = ix * iy;
    let area_a = (a.2 - a.0).max(0.0) * (a.3 - a.1).max(0.0);
    let area_b = (b.2 - b.0).max(0.0) * (b.3 - b.1).max(0.0);
    let union = area_a + area_b - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// Per-class greedy NMS, highest confidence first.
fn non_max_suppression(mut candidates: Vec<Detection>) -> Vec<Detection> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::new();
    for c in candidates {
        if kept
            .iter()
            .all(|k| k.class_id != c.class_id || iou(k.bbox, c.bbox) < NMS_IOU)
        {
            kept.push(c);
        }
    }
    kept
}

#[derive(Default)]
struct IouTracker {
    next_id: i64,
    tracks: Vec<TrackedBox>,
}

struct TrackedBox {
    id: i64,
    bbox: (f32, f32, f32, f32),
    misses: u32,
}

impl IouTracker {
    /// Assigns a stable id to each detection by greedy IoU match against
    /// the previous frame's boxes.
    fn assign(&mut self, detections: &mut [Detection]) {
        let mut taken = vec![false; self.tracks.len()];
        for det in detections.iter_mut() {
            let mut best: Option<(usize, f32)> = None;
            for (i, track) in self.tracks.iter().enumerate() {
                if taken[i] {
                    continue;
                }
                let overlap = iou(det.bbox, track.bbox);
                if overlap >= TRACK_MATCH_IOU && best.is_none_or(|(_, b)| overlap > b) {
                    best = Some((i, overlap));
                }
            }
            match best {
                Some((i, _)) => {
                    taken[i] = true;
                    self.tracks[i].bbox = det.bbox;
                    self.tracks[i].misses = 0;
                    det.track_id = Some(self.tracks[i].id);
                }
                None => {
                    self.next_id += 1;
                    self.tracks.push(TrackedBox {
                        id: self.next_id,
                        bbox: det.bbox,
                        misses: 0,
                    });
                    taken.push(true);
                    det.track_id = Some(self.next_id);
                }
            }
        }
        for (i, track) in self.tracks.iter_mut().enumerate() {
            if !taken.get(i).copied().unwrap_or(true) {
                track.misses += 1;
            }
        }
        self.tracks.retain(|t| t.misses <= TRACK_MAX_MISSES);
    }
}
