// This file is part of Sightline, a multi-camera person-flow analytics engine.
// Copyright (C) 2025 The Sightline Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Sightline's persistence layer: the SQLite event store and the on-disk
//! snapshot store.

pub mod db;
pub mod direction;
mod raw;
pub mod snap;
pub mod testutil;
pub mod timefmt;

pub use crate::db::{
    CameraChange, CameraRow, CameraUpdate, Database, DetectionEvent, DetectionEventToInsert,
    EventType, GeneralEvent, HourBucket, LockedDatabase, RoiConfig, Setting,
};
pub use crate::direction::EntryDirection;
pub use crate::snap::SnapshotDir;
