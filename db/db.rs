// This file is part of Sightline, a multi-camera person-flow analytics engine.
// Copyright (C) 2025 The Sightline Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Database access logic for the Sightline SQLite schema.
//!
//! The SQLite schema holds everything except the actual snapshot images (see
//! the `snap` module for those). See `schema.sql` for a detailed description.
//!
//! One process accesses the database at a time, through one connection
//! guarded by [`Database::lock`]. Operations here hold the lock for the
//! duration of a statement or two; callers must not perform long-running
//! work with the guard held. Workers call these methods on their own
//! threads; HTTP handlers call them from async context, which is acceptable
//! because every operation is a point query or small insert.

use crate::direction::EntryDirection;
use crate::raw;
use crate::timefmt;
use base::{bail, Error, ErrorKind, Mutex, MutexGuard, ResultExt as _};
use rusqlite::OptionalExtension as _;
use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use tracing::info;

/// The event types persisted to `detection_events`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EventType {
    Entry,
    Exit,
    DetectionStart,
    DetectionEnd,
    Direction,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Entry => "entry",
            EventType::Exit => "exit",
            EventType::DetectionStart => "detection_start",
            EventType::DetectionEnd => "detection_end",
            EventType::Direction => "direction",
        }
    }
}

impl Default for EventType {
    fn default() -> Self {
        EventType::Direction
    }
}

/// A row of the `cameras` table, with its `camera_config` row if any.
#[derive(Clone, Debug, PartialEq)]
pub struct CameraRow {
    pub camera_id: String,
    pub source: String,
    pub name: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub fps: Option<i64>,
    pub enabled: bool,
    pub created_at: String,
    pub updated_at: String,
    pub roi: Option<RoiConfig>,
}

/// Fields settable when adding (or replacing) a camera.
#[derive(Clone, Debug)]
pub struct CameraChange {
    pub camera_id: String,
    pub source: String,
    pub name: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub fps: Option<i64>,
    pub enabled: bool,
}

/// Partial camera update; `None` fields are left unchanged.
#[derive(Clone, Debug, Default)]
pub struct CameraUpdate {
    pub name: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub fps: Option<i64>,
    pub enabled: Option<bool>,
}

/// A per-camera region of interest, in the 320x240 canvas pixel space.
///
/// `entry_direction` is kept in the exact string form it was written with
/// (it round-trips byte-identically); it always parses as [`EntryDirection`]
/// because writes validate it.
#[derive(Clone, Debug, PartialEq)]
pub struct RoiConfig {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
    pub entry_direction: String,
}

impl RoiConfig {
    pub fn entry_direction(&self) -> EntryDirection {
        self.entry_direction
            .parse()
            .expect("stored entry_direction was validated on write")
    }
}

/// A new row for `detection_events`. The timestamp is assigned at write time.
#[derive(Clone, Debug, Default)]
pub struct DetectionEventToInsert {
    pub event_type: EventType,
    pub direction: Option<String>,
    pub confidence: Option<f64>,
    pub details: Option<String>,
    pub camera_id: Option<String>,
    pub snapshot_path: Option<String>,
}

/// A persisted `detection_events` row. Immutable once written.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct DetectionEvent {
    pub id: i64,
    pub timestamp: String,
    pub event_type: String,
    pub direction: Option<String>,
    pub confidence: Option<f64>,
    pub details: Option<String>,
    pub camera_id: Option<String>,
    pub snapshot_path: Option<String>,
}

/// A row of the general-purpose `events` table.
#[derive(Clone, Debug, serde::Serialize)]
pub struct GeneralEvent {
    pub id: i64,
    pub timestamp: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub data: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Setting {
    pub value: String,
    pub updated_at: String,
}

/// One hour bucket of the hourly-metrics query.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize)]
pub struct HourBucket {
    pub detection_count: i64,
    pub left_to_right: i64,
    pub right_to_left: i64,
    pub unknown: i64,
}

/// Initializes the database schema, creating missing tables and additively
/// healing older ones. Idempotent; run on every open.
pub fn init(conn: &mut rusqlite::Connection) -> Result<(), Error> {
    conn.execute_batch(include_str!("schema.sql"))
        .err_kind(ErrorKind::Internal)?;
    ensure_column(conn, "detection_events", "camera_id", "text")?;
    ensure_column(conn, "detection_events", "snapshot_path", "text")?;
    conn.execute_batch(
        "create index if not exists idx_camera_ts on detection_events (camera_id, timestamp);",
    )
    .err_kind(ErrorKind::Internal)?;
    Ok(())
}

/// Adds `column` to `table` if a probing `select` shows it's missing.
/// Never drops or renames.
fn ensure_column(
    conn: &rusqlite::Connection,
    table: &str,
    column: &str,
    decl: &str,
) -> Result<(), Error> {
    match conn.prepare(&format!("select {column} from {table} limit 1")) {
        Ok(_) => Ok(()),
        Err(_) => {
            info!("adding {column} column to {table} table");
            conn.execute_batch(&format!("alter table {table} add column {column} {decl};"))
                .err_kind(ErrorKind::Internal)?;
            Ok(())
        }
    }
}

pub struct Database {
    inner: Mutex<LockedDatabase>,
}

pub struct LockedDatabase {
    conn: rusqlite::Connection,

    /// The timestamp of the most recent `detection_events` insert. New rows
    /// are clamped to be ≥ this so that id order implies timestamp order
    /// even if the wall clock steps backwards.
    last_event_timestamp: Option<String>,
}

pub struct DatabaseGuard<'a>(MutexGuard<'a, LockedDatabase>);

impl Deref for DatabaseGuard<'_> {
    type Target = LockedDatabase;
    fn deref(&self) -> &LockedDatabase {
        &self.0
    }
}

impl DerefMut for DatabaseGuard<'_> {
    fn deref_mut(&mut self) -> &mut LockedDatabase {
        &mut self.0
    }
}

impl Database {
    /// Wraps an open connection, initializing the schema.
    pub fn new(mut conn: rusqlite::Connection) -> Result<Self, Error> {
        init(&mut conn)?;
        let last_event_timestamp = conn
            .query_row(
                "select timestamp from detection_events order by id desc limit 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .err_kind(ErrorKind::Internal)?;
        Ok(Database {
            inner: Mutex::new(LockedDatabase {
                conn,
                last_event_timestamp,
            }),
        })
    }

    /// Opens (creating if necessary) the database file at `path`.
    pub fn open(path: &Path) -> Result<Self, Error> {
        let conn = rusqlite::Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .err_kind(ErrorKind::Unavailable)?;
        Self::new(conn)
    }

    /// Acquires the process-wide database lock.
    pub fn lock(&self) -> DatabaseGuard<'_> {
        DatabaseGuard(self.inner.lock())
    }
}

impl LockedDatabase {
    /// Appends a `detection_events` row, returning its id.
    ///
    /// Once written the row is immutable. The stored timestamp is `now`
    /// clamped to be ≥ the previously written row's timestamp.
    pub fn log_detection_event(
        &mut self,
        now: jiff::Timestamp,
        ev: &DetectionEventToInsert,
    ) -> Result<i64, Error> {
        let mut ts = timefmt::format(now);
        if let Some(last) = &self.last_event_timestamp {
            if ts < *last {
                ts.clone_from(last);
            }
        }
        let id = raw::insert_detection_event(&self.conn, &ts, ev)?;
        self.last_event_timestamp = Some(ts);
        Ok(id)
    }

    pub fn recent_detection_events(
        &self,
        limit: i64,
        from_date: Option<&str>,
        to_date: Option<&str>,
    ) -> Result<Vec<DetectionEvent>, Error> {
        raw::list_detection_events(&self.conn, limit, from_date, to_date)
    }

    pub fn log_event(
        &mut self,
        now: jiff::Timestamp,
        type_: &str,
        data: Option<&serde_json::Value>,
    ) -> Result<i64, Error> {
        let data = data.map(|d| d.to_string());
        raw::insert_event(&self.conn, &timefmt::format(now), type_, data.as_deref())
    }

    pub fn list_events(
        &self,
        limit: i64,
        from_date: Option<&str>,
        to_date: Option<&str>,
    ) -> Result<Vec<GeneralEvent>, Error> {
        raw::list_events(&self.conn, limit, from_date, to_date)
    }

    pub fn log_system_event(
        &mut self,
        now: jiff::Timestamp,
        level: &str,
        module: &str,
        message: &str,
    ) -> Result<(), Error> {
        raw::insert_system_log(&self.conn, &timefmt::format(now), level, module, message)
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<Setting>, Error> {
        Ok(raw::get_setting(&self.conn, key)?.map(|(value, updated_at)| Setting {
            value,
            updated_at,
        }))
    }

    pub fn set_setting(&mut self, now: jiff::Timestamp, key: &str, value: &str) -> Result<(), Error> {
        raw::set_setting(&self.conn, key, value, &timefmt::format(now))
    }

    /// Saves (upserting) a camera's ROI config, validating coordinates and
    /// the entry-direction descriptor. On rejection, state is unchanged.
    pub fn save_roi(&mut self, camera_id: &str, roi: &RoiConfig) -> Result<(), Error> {
        if roi.x2 <= roi.x1 || roi.y2 <= roi.y1 || roi.x1 < 0 || roi.y1 < 0 {
            bail!(
                InvalidArgument,
                "bad ROI rectangle ({},{})-({},{})",
                roi.x1,
                roi.y1,
                roi.x2,
                roi.y2
            );
        }
        roi.entry_direction.parse::<EntryDirection>()?;
        raw::save_camera_roi(&self.conn, camera_id, roi)
    }

    pub fn get_roi(&self, camera_id: &str) -> Result<Option<RoiConfig>, Error> {
        raw::get_camera_roi(&self.conn, camera_id)
    }

    /// Deletes a camera's ROI config; `Ok(false)` if there was none.
    pub fn delete_roi(&mut self, camera_id: &str) -> Result<bool, Error> {
        raw::delete_camera_roi(&self.conn, camera_id)
    }

    pub fn list_cameras(&self) -> Result<Vec<CameraRow>, Error> {
        raw::list_cameras(&self.conn)
    }

    pub fn get_camera(&self, camera_id: &str) -> Result<Option<CameraRow>, Error> {
        raw::get_camera(&self.conn, camera_id)
    }

    pub fn add_camera(&mut self, now: jiff::Timestamp, change: &CameraChange) -> Result<(), Error> {
        if change.camera_id.is_empty() {
            bail!(InvalidArgument, "camera id must be non-empty");
        }
        raw::upsert_camera(&self.conn, &timefmt::format(now), change)
    }

    /// Applies a partial update; `Ok(false)` if the camera doesn't exist.
    pub fn update_camera(
        &mut self,
        now: jiff::Timestamp,
        camera_id: &str,
        update: &CameraUpdate,
    ) -> Result<bool, Error> {
        raw::update_camera(&self.conn, &timefmt::format(now), camera_id, update)
    }

    /// Removes a camera and its ROI config; `Ok(false)` if it didn't exist.
    pub fn remove_camera(&mut self, camera_id: &str) -> Result<bool, Error> {
        raw::delete_camera(&self.conn, camera_id)
    }

    /// Hourly `detection_end` statistics for the trailing `hours` window,
    /// keyed by hour-bucket string.
    pub fn hourly_metrics(
        &self,
        now: jiff::Timestamp,
        hours: i64,
        camera_id: Option<&str>,
    ) -> Result<BTreeMap<String, HourBucket>, Error> {
        let threshold = now
            .checked_sub(jiff::SignedDuration::from_hours(hours))
            .err_kind(ErrorKind::InvalidArgument)?;
        raw::hourly_metrics(&self.conn, &timefmt::format_hour(threshold), camera_id)
    }

    /// `detection_end` counts per direction over the trailing `days` window.
    /// Keys `left_to_right`, `right_to_left` and `unknown` are always present.
    pub fn direction_counts(
        &self,
        now: jiff::Timestamp,
        days: i64,
        camera_id: Option<&str>,
    ) -> Result<BTreeMap<String, i64>, Error> {
        let threshold = now
            .checked_sub(jiff::SignedDuration::from_hours(days * 24))
            .err_kind(ErrorKind::InvalidArgument)?;
        raw::direction_counts(&self.conn, &timefmt::format_day(threshold), camera_id)
    }

    /// Entry+exit totals per camera over the trailing `hours` window.
    pub fn entry_counts_by_camera(
        &self,
        now: jiff::Timestamp,
        hours: i64,
    ) -> Result<BTreeMap<String, i64>, Error> {
        let cutoff = now
            .checked_sub(jiff::SignedDuration::from_hours(hours))
            .err_kind(ErrorKind::InvalidArgument)?;
        raw::entry_counts_by_camera(&self.conn, &timefmt::format(cutoff))
    }

    /// Hourly entry+exit series per camera over the trailing `hours` window.
    pub fn time_series(
        &self,
        now: jiff::Timestamp,
        hours: i64,
        camera_id: Option<&str>,
    ) -> Result<BTreeMap<String, Vec<(String, i64)>>, Error> {
        let cutoff = now
            .checked_sub(jiff::SignedDuration::from_hours(hours))
            .err_kind(ErrorKind::InvalidArgument)?;
        raw::time_series(&self.conn, &timefmt::format(cutoff), camera_id)
    }
}
