// This file is part of Sightline, a multi-camera person-flow analytics engine.
// Copyright (C) 2025 The Sightline Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Shared fakes for tests of the capture/registry/pipeline stack.

use crate::detect::{Detection, Detector};
use crate::stream::{self, Frame, Geometry, Opener, Source, Stream};
use base::{Error, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// An opener whose streams repeat one synthetic frame forever (with a tiny
/// real sleep so started capture threads don't spin hot). Open attempts can
/// be scripted to fail.
pub struct LoopOpener {
    opens: AtomicUsize,
    fail_next: Mutex<usize>,
}

impl LoopOpener {
    pub fn new() -> Arc<Self> {
        Arc::new(LoopOpener {
            opens: AtomicUsize::new(0),
            fail_next: Mutex::new(0),
        })
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn fail_next_opens(&self, n: usize) {
        *self.fail_next.lock() = n;
    }
}

impl Opener for LoopOpener {
    fn open(&self, _source: &Source, _geometry: Geometry) -> Result<Box<dyn Stream>, Error> {
        {
            let mut fail = self.fail_next.lock();
            if *fail > 0 {
                *fail = fail.saturating_sub(1);
                return Err(base::err!(Unavailable, "scripted open failure"));
            }
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(LoopStream))
    }
}

struct LoopStream;

impl Stream for LoopStream {
    fn next_frame(&mut self) -> Result<Option<Frame>, Error> {
        std::thread::sleep(std::time::Duration::from_millis(1));
        Ok(Some(stream::test_frame(8, 8, 128)))
    }

    fn declared_fps(&self) -> Option<f64> {
        None
    }
}

/// A detector that replays scripted per-call detection lists, then reports
/// empty frames.
pub struct ScriptDetector {
    script: Mutex<std::vec::IntoIter<Vec<Detection>>>,
}

impl ScriptDetector {
    pub fn new(script: Vec<Vec<Detection>>) -> Arc<Self> {
        Arc::new(ScriptDetector {
            script: Mutex::new(script.into_iter()),
        })
    }
}

impl Detector for ScriptDetector {
    fn detect_and_track(&self, _camera_id: &str, _frame: &Frame) -> Result<Vec<Detection>, Error> {
        Ok(self.script.lock().next().unwrap_or_default())
    }
}

/// Builds a person detection at a given centroid with a small box around it.
pub fn person_at(track_id: i64, cx: f32, cy: f32) -> Detection {
    Detection {
        class_id: 0,
        confidence: 0.9,
        bbox: (cx - 10.0, cy - 20.0, cx + 10.0, cy + 20.0),
        track_id: Some(track_id),
    }
}
