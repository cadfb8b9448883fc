// This file is part of Sightline, a multi-camera person-flow analytics engine.
// Copyright (C) 2025 The Sightline Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Track state and the direction-classification math.
//!
//! Everything here is pure: the per-camera worker owns the mutable state
//! and calls in with positions and clocks. Movement is judged from a
//! bounded centroid history; a crossing is committed at most once per
//! track.

use db::EntryDirection;
use jiff::Timestamp;
use std::collections::VecDeque;

/// Centroids retained per track for direction calculation.
pub const POSITION_HISTORY: usize = 10;

/// Minimum positions before attempting direction classification.
pub const MIN_POSITIONS: usize = 3;

/// Below this total movement (in pixels), direction is undetermined.
pub const MIN_MOVEMENT_PX: f64 = 2.0;

/// Default dot-product threshold for entry/exit classification.
pub const DIRECTION_DOT_THRESHOLD: f64 = 0.2;

/// A track is purged once unseen for longer than this.
pub const TRACK_EXPIRY: std::time::Duration = std::time::Duration::from_secs(2);

/// The canvas ROI coordinates are authored in.
pub const CANVAS_WIDTH: f64 = 320.0;
pub const CANVAS_HEIGHT: f64 = 240.0;

/// A committed crossing label.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Crossing {
    Entry,
    Exit,
}

impl Crossing {
    pub fn as_str(self) -> &'static str {
        match self {
            Crossing::Entry => "entry",
            Crossing::Exit => "exit",
        }
    }
}

/// Net movement between the early and late ends of a position history.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Movement {
    pub dx: f64,
    pub dy: f64,
}

impl Movement {
    pub fn unit(&self) -> (f64, f64) {
        let m = (self.dx * self.dx + self.dy * self.dy).sqrt();
        (self.dx / m, self.dy / m)
    }

    /// The coarse horizontal reading recorded on `detection_end` rows.
    pub fn raw_direction_str(&self) -> &'static str {
        if self.dx > 0.0 {
            "left_to_right"
        } else if self.dx < 0.0 {
            "right_to_left"
        } else {
            "unknown"
        }
    }
}

/// Computes the movement vector of a track: the first and last `k`
/// positions (`k = max(1, N/3)`) are averaged and differenced. Movement
/// under [`MIN_MOVEMENT_PX`] is noise and yields `None`.
pub fn movement_vector(positions: &VecDeque<(f64, f64)>) -> Option<Movement> {
    let n = positions.len();
    if n < MIN_POSITIONS {
        return None;
    }
    let k = (n / 3).max(1);
    let avg = |it: &mut dyn Iterator<Item = &(f64, f64)>| {
        let (mut sx, mut sy) = (0.0, 0.0);
        for &(x, y) in it.take(k) {
            sx += x;
            sy += y;
        }
        (sx / k as f64, sy / k as f64)
    };
    let start = avg(&mut positions.iter());
    let end = avg(&mut positions.iter().rev());
    let m = Movement {
        dx: end.0 - start.0,
        dy: end.1 - start.1,
    };
    if (m.dx * m.dx + m.dy * m.dy).sqrt() < MIN_MOVEMENT_PX {
        return None;
    }
    Some(m)
}

/// Classifies movement against the camera's entry direction: positive
/// alignment is an entry, negative an exit, near-perpendicular neither.
/// Thresholds are strict, so a dot product of exactly ±`threshold` is
/// undetermined.
pub fn classify(movement: Movement, entry: EntryDirection, threshold: f64) -> Option<Crossing> {
    let (mx, my) = movement.unit();
    let (ex, ey) = entry.unit();
    let dot = mx * ex + my * ey;
    if dot > threshold {
        Some(Crossing::Entry)
    } else if dot < -threshold {
        Some(Crossing::Exit)
    } else {
        None
    }
}

/// A region of interest in the frame's native pixel space.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RoiRect {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl RoiRect {
    /// Maps stored canvas-space coordinates onto a frame.
    ///
    /// Coordinates scale only when the frame is substantially (>1.5×)
    /// wider than the canvas; they are then clamped to the frame. An
    /// empty result means the ROI doesn't intersect the frame and the
    /// caller falls back to the full frame.
    pub fn from_canvas(roi: &db::RoiConfig, frame_width: u32, frame_height: u32) -> Option<Self> {
        let (fw, fh) = (f64::from(frame_width), f64::from(frame_height));
        let (mut x1, mut y1) = (f64::from(roi.x1), f64::from(roi.y1));
        let (mut x2, mut y2) = (f64::from(roi.x2), f64::from(roi.y2));
        if fw > 1.5 * CANVAS_WIDTH {
            let (sx, sy) = (fw / CANVAS_WIDTH, fh / CANVAS_HEIGHT);
            x1 *= sx;
            y1 *= sy;
            x2 *= sx;
            y2 *= sy;
        }
        let r = RoiRect {
            x1: x1.clamp(0.0, fw),
            y1: y1.clamp(0.0, fh),
            x2: x2.clamp(0.0, fw),
            y2: y2.clamp(0.0, fh),
        };
        if r.crop_bounds().is_none() {
            return None;
        }
        Some(r)
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        self.x1 <= x && x <= self.x2 && self.y1 <= y && y <= self.y2
    }

    /// Integer pixel bounds for cropping; `None` if the rectangle has no
    /// whole pixels.
    pub fn crop_bounds(&self) -> Option<(u32, u32, u32, u32)> {
        let (x1, y1) = (self.x1 as u32, self.y1 as u32);
        let (x2, y2) = (self.x2 as u32, self.y2 as u32);
        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some((x1, y1, x2, y2))
    }
}

/// Ephemeral per-person state within one camera. Owned exclusively by that
/// camera's tracking worker.
#[derive(Debug)]
pub struct Track {
    pub positions: VecDeque<(f64, f64)>,
    pub first_seen: Timestamp,
    pub last_seen: Timestamp,
    pub in_roi: bool,
    /// Set when `in_roi` flipped on the current observation.
    pub roi_status_changed: bool,
    pub committed: Option<Crossing>,
    /// Raw movement at commit time, for the coarse direction string.
    pub committed_movement: Option<Movement>,
    /// The single still captured at first sight; referenced by any
    /// entry/exit event this track later produces.
    pub snapshot_path: Option<String>,
}

impl Track {
    pub fn new(now: Timestamp, position: (f64, f64), in_roi: bool) -> Self {
        let mut positions = VecDeque::with_capacity(POSITION_HISTORY);
        positions.push_back(position);
        Track {
            positions,
            first_seen: now,
            last_seen: now,
            in_roi,
            roi_status_changed: false,
            committed: None,
            committed_movement: None,
            snapshot_path: None,
        }
    }

    /// Records an observation: appends to the bounded history, updates
    /// `last_seen`, and latches whether the ROI flag flipped.
    pub fn observe(&mut self, now: Timestamp, position: (f64, f64), in_roi: bool) {
        if self.positions.len() == POSITION_HISTORY {
            self.positions.pop_front();
        }
        self.positions.push_back(position);
        self.last_seen = now;
        if in_roi != self.in_roi {
            self.roi_status_changed = true;
            self.in_roi = in_roi;
        }
    }

    pub fn direction_logged(&self) -> bool {
        self.committed.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn positions(pts: &[(f64, f64)]) -> VecDeque<(f64, f64)> {
        pts.iter().copied().collect()
    }

    fn ltr() -> EntryDirection {
        "LTR".parse().unwrap()
    }

    #[test]
    fn movement_needs_three_positions() {
        assert_eq!(movement_vector(&positions(&[(0.0, 0.0)])), None);
        assert_eq!(
            movement_vector(&positions(&[(0.0, 0.0), (50.0, 0.0)])),
            None
        );
        assert!(movement_vector(&positions(&[(0.0, 0.0), (25.0, 0.0), (50.0, 0.0)])).is_some());
    }

    #[test]
    fn movement_magnitude_threshold_is_strict() {
        // Exactly 2.0 px of net movement: undetermined.
        let m = movement_vector(&positions(&[(0.0, 0.0), (1.0, 0.0), (2.0, 0.0)]));
        assert_eq!(m, None);
        // Just over: determined.
        let m = movement_vector(&positions(&[(0.0, 0.0), (1.0, 0.0), (2.001, 0.0)])).unwrap();
        assert!(m.dx > 2.0);
    }

    #[test]
    fn movement_averages_first_and_last_thirds() {
        // N=9 -> k=3: S = avg of first 3, E = avg of last 3.
        let pts: Vec<_> = (0..9).map(|i| (f64::from(i) * 10.0, 5.0)).collect();
        let m = movement_vector(&positions(&pts)).unwrap();
        // S = (10, 5), E = (70, 5).
        assert_eq!(m, Movement { dx: 60.0, dy: 0.0 });
    }

    #[test]
    fn classify_thresholds_are_strict() {
        let entry = ltr();
        // (30, 40) has magnitude exactly 50, so its unit x is exactly the
        // f64 nearest 0.6, the same value as the literal. A dot product
        // exactly at the threshold must be undetermined.
        let at = Movement { dx: 30.0, dy: 40.0 };
        assert_eq!(classify(at, entry, 0.6), None);
        assert_eq!(classify(at, entry, 0.59), Some(Crossing::Entry));
        let at = Movement { dx: -30.0, dy: 40.0 };
        assert_eq!(classify(at, entry, 0.6), None);
        assert_eq!(classify(at, entry, 0.59), Some(Crossing::Exit));

        let above = Movement { dx: 30.0, dy: 0.0 };
        assert_eq!(
            classify(above, entry, DIRECTION_DOT_THRESHOLD),
            Some(Crossing::Entry)
        );
        let below = Movement { dx: -30.0, dy: 0.0 };
        assert_eq!(
            classify(below, entry, DIRECTION_DOT_THRESHOLD),
            Some(Crossing::Exit)
        );
        let perpendicular = Movement { dx: 0.0, dy: 50.0 };
        assert_eq!(classify(perpendicular, entry, DIRECTION_DOT_THRESHOLD), None);
    }

    #[test]
    fn classify_free_vector_diagonal() {
        let entry: EntryDirection = "0.7071,0.7071".parse().unwrap();
        let m = Movement { dx: 200.0, dy: 200.0 }; // (100,100) -> (300,300)
        assert_eq!(
            classify(m, entry, DIRECTION_DOT_THRESHOLD),
            Some(Crossing::Entry)
        );
        let m = Movement {
            dx: -200.0,
            dy: -200.0,
        };
        assert_eq!(
            classify(m, entry, DIRECTION_DOT_THRESHOLD),
            Some(Crossing::Exit)
        );
    }

    #[test]
    fn raw_direction_strings() {
        assert_eq!(Movement { dx: 3.0, dy: 9.0 }.raw_direction_str(), "left_to_right");
        assert_eq!(Movement { dx: -3.0, dy: 9.0 }.raw_direction_str(), "right_to_left");
        assert_eq!(Movement { dx: 0.0, dy: 9.0 }.raw_direction_str(), "unknown");
    }

    fn roi(x1: i32, y1: i32, x2: i32, y2: i32) -> db::RoiConfig {
        db::RoiConfig {
            x1,
            y1,
            x2,
            y2,
            entry_direction: "LTR".to_owned(),
        }
    }

    #[test]
    fn roi_scales_only_for_substantially_larger_frames() {
        // 480 wide is exactly 1.5x the canvas: no scaling.
        let r = RoiRect::from_canvas(&roi(10, 10, 100, 100), 480, 360).unwrap();
        assert_eq!(r, RoiRect { x1: 10.0, y1: 10.0, x2: 100.0, y2: 100.0 });
        // 640x480 is 2x: scaled by (2, 2).
        let r = RoiRect::from_canvas(&roi(10, 10, 100, 100), 640, 480).unwrap();
        assert_eq!(r, RoiRect { x1: 20.0, y1: 20.0, x2: 200.0, y2: 200.0 });
        // 320x240 native: untouched.
        let r = RoiRect::from_canvas(&roi(10, 10, 100, 100), 320, 240).unwrap();
        assert_eq!(r.x2, 100.0);
    }

    #[test]
    fn roi_clamps_and_rejects_empty() {
        // Extends past the frame: clamped.
        let r = RoiRect::from_canvas(&roi(200, 200, 400, 400), 320, 240).unwrap();
        assert_eq!(r, RoiRect { x1: 200.0, y1: 200.0, x2: 320.0, y2: 240.0 });
        // Entirely outside: empty after clamping.
        assert_eq!(RoiRect::from_canvas(&roi(400, 10, 500, 100), 320, 240), None);
    }

    #[test]
    fn roi_contains_is_inclusive() {
        let r = RoiRect { x1: 10.0, y1: 10.0, x2: 20.0, y2: 20.0 };
        assert!(r.contains(10.0, 10.0));
        assert!(r.contains(20.0, 20.0));
        assert!(r.contains(15.0, 15.0));
        assert!(!r.contains(9.9, 15.0));
        assert!(!r.contains(15.0, 20.1));
    }

    #[test]
    fn track_history_is_bounded() {
        let now: Timestamp = "2025-04-26T00:00:00Z".parse().unwrap();
        let mut t = Track::new(now, (0.0, 0.0), false);
        for i in 1..20 {
            t.observe(now, (f64::from(i), 0.0), false);
        }
        assert_eq!(t.positions.len(), POSITION_HISTORY);
        assert_eq!(t.positions.front(), Some(&(10.0, 0.0)));
        assert_eq!(t.positions.back(), Some(&(19.0, 0.0)));
    }

    #[test]
    fn track_latches_roi_flip() {
        let now: Timestamp = "2025-04-26T00:00:00Z".parse().unwrap();
        let mut t = Track::new(now, (0.0, 0.0), false);
        t.observe(now, (1.0, 0.0), false);
        assert!(!t.roi_status_changed);
        t.observe(now, (2.0, 0.0), true);
        assert!(t.roi_status_changed);
        assert!(t.in_roi);
    }
}
