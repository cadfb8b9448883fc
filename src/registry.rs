// This file is part of Sightline, a multi-camera person-flow analytics engine.
// Copyright (C) 2025 The Sightline Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The camera registry: a named collection of frame sources.
//!
//! The registry exclusively owns its [`FrameSource`]s. Adding a camera with
//! a new id probes the source first (open, read one frame, close, retried a
//! few times); re-adding with an identical source is a no-op so periodic
//! database reloads never cause a frame gap.

use crate::capture::{FrameSource, Tuning};
use crate::stream::{Geometry, Opener, Source};
use base::clock::Clocks;
use base::{bail, err, Error, FastHashMap, Mutex};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const PROBE_ATTEMPTS: usize = 3;
const PROBE_RETRY_PAUSE: Duration = Duration::from_secs(1);

pub struct CameraRegistry {
    opener: Arc<dyn Opener>,
    clocks: Arc<dyn Clocks>,
    tuning: Tuning,
    default_geometry: Geometry,
    by_id: Mutex<FastHashMap<String, Arc<FrameSource>>>,
}

impl CameraRegistry {
    pub fn new(
        opener: Arc<dyn Opener>,
        clocks: Arc<dyn Clocks>,
        tuning: Tuning,
        default_geometry: Geometry,
    ) -> Self {
        CameraRegistry {
            opener,
            clocks,
            tuning,
            default_geometry,
            by_id: Mutex::new(FastHashMap::default()),
        }
    }

    /// Adds (or replaces) a camera.
    ///
    /// * new id: the source is probed first; on success a `FrameSource` is
    ///   installed and, if `enabled`, started.
    /// * same id, same source: no-op; the existing source keeps running.
    /// * same id, different source: the old source is stopped, then the new
    ///   one installed without a probe (it proves itself by streaming).
    pub fn add(
        &self,
        camera_id: &str,
        source_str: &str,
        geometry: Option<Geometry>,
        enabled: bool,
    ) -> Result<(), Error> {
        let source = Source::parse(source_str)?;
        let geometry = geometry.unwrap_or(self.default_geometry);

        let replaced = {
            let mut l = self.by_id.lock();
            match l.get(camera_id) {
                Some(existing) if *existing.source() == source => {
                    info!(camera = camera_id, %source, "camera unchanged; keeping existing source");
                    return Ok(());
                }
                Some(_) => l.remove(camera_id),
                None => None,
            }
        };
        if let Some(old) = replaced {
            warn!(camera = camera_id, old = %old.source(), new = %source, "replacing source");
            old.stop();
        } else {
            self.probe(&source, geometry)?;
        }

        let fs = FrameSource::new(
            camera_id.to_owned(),
            source,
            geometry,
            self.tuning,
            self.opener.clone(),
            self.clocks.clone(),
        );
        if enabled {
            fs.start();
        }
        self.by_id.lock().insert(camera_id.to_owned(), fs);
        info!(camera = camera_id, enabled, "camera added");
        Ok(())
    }

    /// Verifies a source can deliver by opening it, reading one frame, and
    /// closing, with a few retries.
    fn probe(&self, source: &Source, geometry: Geometry) -> Result<(), Error> {
        let mut last_err = None;
        for attempt in 1..=PROBE_ATTEMPTS {
            info!(%source, attempt, max = PROBE_ATTEMPTS, "probing source");
            match self
                .opener
                .open(source, geometry)
                .and_then(|mut s| s.next_frame())
            {
                Ok(_) => return Ok(()),
                Err(e) => {
                    warn!(%source, attempt, err = %e.chain(), "probe failed");
                    last_err = Some(e);
                }
            }
            if attempt < PROBE_ATTEMPTS {
                self.clocks.sleep(PROBE_RETRY_PAUSE);
            }
        }
        Err(err!(
            Unavailable,
            "source {source} failed {PROBE_ATTEMPTS} probe attempts: {}",
            last_err.expect("at least one attempt ran")
        ))
    }

    /// Stops and removes a camera.
    pub fn remove(&self, camera_id: &str) -> Result<(), Error> {
        let removed = self.by_id.lock().remove(camera_id);
        match removed {
            Some(fs) => {
                fs.stop();
                info!(camera = camera_id, "camera removed");
                Ok(())
            }
            None => bail!(NotFound, "no camera {camera_id:?} in registry"),
        }
    }

    pub fn get(&self, camera_id: &str) -> Option<Arc<FrameSource>> {
        self.by_id.lock().get(camera_id).cloned()
    }

    /// All cameras, sorted by id for stable listings.
    pub fn list_all(&self) -> Vec<Arc<FrameSource>> {
        let mut v: Vec<_> = self.by_id.lock().values().cloned().collect();
        v.sort_by(|a, b| a.camera_id().cmp(b.camera_id()));
        v
    }

    /// Cameras currently delivering (or warming up).
    pub fn list_active(&self) -> Vec<Arc<FrameSource>> {
        self.list_all()
            .into_iter()
            .filter(|fs| fs.is_active())
            .collect()
    }

    pub fn start_all(&self) {
        for fs in self.list_all() {
            fs.start();
        }
    }

    pub fn stop_all(&self) {
        for fs in self.list_all() {
            fs.stop();
        }
    }

    pub fn len(&self) -> usize {
        self.by_id.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::LoopOpener;
    use base::clock::SimulatedClocks;

    fn registry(opener: Arc<LoopOpener>) -> CameraRegistry {
        let clocks = Arc::new(SimulatedClocks::new("2025-04-26T00:00:00Z".parse().unwrap()));
        CameraRegistry::new(opener, clocks, Tuning::default(), Geometry::default())
    }

    #[test]
    fn add_is_idempotent_for_same_source() {
        let opener = LoopOpener::new();
        let r = registry(opener.clone());
        r.add("main", "0", None, false).unwrap();
        let first = r.get("main").unwrap();
        // Identical source: no probe, no new FrameSource.
        let opens_after_first = opener.opens();
        r.add("main", "0", None, false).unwrap();
        assert!(Arc::ptr_eq(&first, &r.get("main").unwrap()));
        assert_eq!(opener.opens(), opens_after_first);
        // Numeric strings and device paths coerce to the same device.
        r.add("main", "/dev/video0", None, false).unwrap();
        assert!(Arc::ptr_eq(&first, &r.get("main").unwrap()));
    }

    #[test]
    fn add_replaces_on_different_source() {
        let opener = LoopOpener::new();
        let r = registry(opener.clone());
        r.add("main", "0", None, false).unwrap();
        let first = r.get("main").unwrap();
        r.add("main", "1", None, false).unwrap();
        let second = r.get("main").unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(*second.source(), Source::Device(1));
    }

    #[test]
    fn probe_failure_rejects_add() {
        let opener = LoopOpener::new();
        opener.fail_next_opens(usize::MAX);
        let r = registry(opener.clone());
        let e = r.add("main", "0", None, false).unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::Unavailable);
        assert!(r.get("main").is_none());
        assert!(r.is_empty());
    }

    #[test]
    fn probe_retries_transient_failures() {
        let opener = LoopOpener::new();
        opener.fail_next_opens(2); // two failures, third probe attempt wins
        let r = registry(opener.clone());
        r.add("main", "0", None, false).unwrap();
        assert!(r.get("main").is_some());
    }

    #[test]
    fn remove_and_lists() {
        let opener = LoopOpener::new();
        let r = registry(opener.clone());
        r.add("a", "0", None, false).unwrap();
        r.add("b", "1", None, true).unwrap();
        let ids: Vec<_> = r
            .list_all()
            .iter()
            .map(|f| f.camera_id().to_owned())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);

        // Give the started camera a moment to deliver.
        for _ in 0..100 {
            if !r.list_active().is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        let active: Vec<_> = r
            .list_active()
            .iter()
            .map(|f| f.camera_id().to_owned())
            .collect();
        assert_eq!(active, vec!["b"]);

        r.remove("a").unwrap();
        assert_eq!(r.remove("a").unwrap_err().kind(), base::ErrorKind::NotFound);
        r.stop_all();
    }
}
