// This file is part of Sightline, a multi-camera person-flow analytics engine.
// Copyright (C) 2025 The Sightline Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Utilities for automated testing involving Sightline's persistence layer.
//! Used for tests of both the `sightline-db` crate itself and the
//! `sightline` crate.

use crate::db::{CameraChange, Database};
use crate::snap::SnapshotDir;
use std::sync::Arc;
use tempfile::TempDir;

static INIT: std::sync::Once = std::sync::Once::new();

/// id of the camera created by `TestDb::new` below.
pub const TEST_CAMERA_ID: &str = "main";

/// Performs global initialization for tests: sets up logging. (Note the
/// output can be confusing unless `RUST_TEST_THREADS=1` is set in the
/// program's environment prior to running.)
pub fn init() {
    INIT.call_once(base::tracing_setup::install_for_tests);
}

pub struct TestDb {
    pub db: Arc<Database>,
    pub snapshots: Arc<SnapshotDir>,
    pub tmpdir: TempDir,
}

impl TestDb {
    /// Creates an in-memory test database with one enabled camera
    /// ([`TEST_CAMERA_ID`]) and a snapshot store in a tempdir.
    pub fn new() -> Self {
        init();
        let tmpdir = tempfile::Builder::new()
            .prefix("sightline-test")
            .tempdir()
            .unwrap();
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let db = Arc::new(Database::new(conn).unwrap());
        db.lock()
            .add_camera(
                "2025-04-26T00:00:00Z".parse().unwrap(),
                &CameraChange {
                    camera_id: TEST_CAMERA_ID.to_owned(),
                    source: "0".to_owned(),
                    name: Some("Test camera".to_owned()),
                    width: Some(640),
                    height: Some(480),
                    fps: Some(30),
                    enabled: true,
                },
            )
            .unwrap();
        let snapshots = SnapshotDir::open(&tmpdir.path().join("snapshots")).unwrap();
        TestDb {
            db,
            snapshots,
            tmpdir,
        }
    }
}

impl Default for TestDb {
    fn default() -> Self {
        Self::new()
    }
}
