// This file is part of Sightline, a multi-camera person-flow analytics engine.
// Copyright (C) 2025 The Sightline Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Raw database access: SQLite statements which do not touch any cached state.

use crate::db::{
    CameraRow, DetectionEvent, DetectionEventToInsert, GeneralEvent, HourBucket, RoiConfig,
};
use base::{ErrorKind, ResultExt as _};
use rusqlite::{named_params, params, OptionalExtension as _};
use std::collections::BTreeMap;

const INSERT_DETECTION_EVENT_SQL: &str = r#"
    insert into detection_events (timestamp,  event_type,  direction,  confidence,
                                  details,  camera_id,  snapshot_path)
                          values (:timestamp, :event_type, :direction, :confidence,
                                  :details, :camera_id, :snapshot_path)
"#;

const LIST_DETECTION_EVENTS_SQL: &str = r#"
    select
      id,
      timestamp,
      event_type,
      direction,
      confidence,
      details,
      camera_id,
      snapshot_path
    from
      detection_events
    where
      (:from_date is null or datetime(timestamp) >= datetime(:from_date)) and
      (:to_date is null or datetime(timestamp) <= datetime(:to_date))
    order by timestamp desc, id desc
    limit :limit
"#;

const HOURLY_METRICS_SQL: &str = r#"
    select
      strftime('%Y-%m-%d %H:00', timestamp) as hour,
      direction,
      count(*) as count
    from
      detection_events
    where
      strftime('%Y-%m-%d %H:00', timestamp) >= :hour_threshold and
      event_type = 'detection_end' and
      (:camera_id is null or camera_id = :camera_id)
    group by hour, direction
    order by hour
"#;

const DIRECTION_COUNTS_SQL: &str = r#"
    select
      direction,
      count(*) as count
    from
      detection_events
    where
      timestamp >= :date_threshold and
      event_type = 'detection_end' and
      (:camera_id is null or camera_id = :camera_id)
    group by direction
"#;

const ENTRY_COUNTS_BY_CAMERA_SQL: &str = r#"
    select
      camera_id,
      count(*)
    from
      detection_events
    where
      event_type in ('entry', 'exit') and
      timestamp >= :cutoff
    group by camera_id
"#;

const TIME_SERIES_SQL: &str = r#"
    select
      strftime('%Y-%m-%d %H:00', timestamp) as hour,
      camera_id,
      count(*)
    from
      detection_events
    where
      timestamp >= :cutoff and
      event_type in ('entry', 'exit') and
      (:camera_id is null or camera_id = :camera_id)
    group by camera_id, hour
    order by hour
"#;

const LIST_CAMERAS_SQL_PREFIX: &str = r#"
    select
      c.camera_id,
      c.source,
      c.name,
      c.width,
      c.height,
      c.fps,
      c.enabled,
      c.created_at,
      c.updated_at,
      r.roi_x1,
      r.roi_y1,
      r.roi_x2,
      r.roi_y2,
      r.entry_direction
    from
      cameras c left join camera_config r on (c.camera_id = r.camera_id)
"#;

fn camera_from_row(row: &rusqlite::Row) -> Result<CameraRow, rusqlite::Error> {
    let roi = match (
        row.get::<_, Option<i32>>("roi_x1")?,
        row.get::<_, Option<i32>>("roi_y1")?,
        row.get::<_, Option<i32>>("roi_x2")?,
        row.get::<_, Option<i32>>("roi_y2")?,
        row.get::<_, Option<String>>("entry_direction")?,
    ) {
        (Some(x1), Some(y1), Some(x2), Some(y2), Some(entry_direction)) => Some(RoiConfig {
            x1,
            y1,
            x2,
            y2,
            entry_direction,
        }),
        _ => None,
    };
    Ok(CameraRow {
        camera_id: row.get("camera_id")?,
        source: row.get("source")?,
        name: row.get("name")?,
        width: row.get("width")?,
        height: row.get("height")?,
        fps: row.get("fps")?,
        enabled: row.get::<_, i64>("enabled")? != 0,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        roi,
    })
}

pub(crate) fn insert_detection_event(
    conn: &rusqlite::Connection,
    timestamp: &str,
    ev: &DetectionEventToInsert,
) -> Result<i64, base::Error> {
    let mut stmt = conn
        .prepare_cached(INSERT_DETECTION_EVENT_SQL)
        .err_kind(ErrorKind::Internal)?;
    stmt.execute(named_params! {
        ":timestamp": timestamp,
        ":event_type": ev.event_type.as_str(),
        ":direction": &ev.direction,
        ":confidence": &ev.confidence,
        ":details": &ev.details,
        ":camera_id": &ev.camera_id,
        ":snapshot_path": &ev.snapshot_path,
    })
    .err_kind(ErrorKind::Internal)?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn list_detection_events(
    conn: &rusqlite::Connection,
    limit: i64,
    from_date: Option<&str>,
    to_date: Option<&str>,
) -> Result<Vec<DetectionEvent>, base::Error> {
    let mut stmt = conn
        .prepare_cached(LIST_DETECTION_EVENTS_SQL)
        .err_kind(ErrorKind::Internal)?;
    let rows = stmt
        .query_map(
            named_params! {
                ":limit": limit,
                ":from_date": from_date,
                ":to_date": to_date,
            },
            |row| {
                Ok(DetectionEvent {
                    id: row.get("id")?,
                    timestamp: row.get("timestamp")?,
                    event_type: row.get("event_type")?,
                    direction: row.get("direction")?,
                    confidence: row.get("confidence")?,
                    details: row.get("details")?,
                    camera_id: row.get("camera_id")?,
                    snapshot_path: row.get("snapshot_path")?,
                })
            },
        )
        .err_kind(ErrorKind::Internal)?;
    rows.collect::<Result<Vec<_>, _>>()
        .err_kind(ErrorKind::Internal)
}

pub(crate) fn hourly_metrics(
    conn: &rusqlite::Connection,
    hour_threshold: &str,
    camera_id: Option<&str>,
) -> Result<BTreeMap<String, HourBucket>, base::Error> {
    let mut stmt = conn
        .prepare_cached(HOURLY_METRICS_SQL)
        .err_kind(ErrorKind::Internal)?;
    let mut rows = stmt
        .query(named_params! {
            ":hour_threshold": hour_threshold,
            ":camera_id": camera_id,
        })
        .err_kind(ErrorKind::Internal)?;
    let mut out: BTreeMap<String, HourBucket> = BTreeMap::new();
    while let Some(row) = rows.next().err_kind(ErrorKind::Internal)? {
        let hour: String = row.get(0).err_kind(ErrorKind::Internal)?;
        let direction: Option<String> = row.get(1).err_kind(ErrorKind::Internal)?;
        let count: i64 = row.get(2).err_kind(ErrorKind::Internal)?;
        let bucket = out.entry(hour).or_default();
        match direction.as_deref() {
            Some("left_to_right") => bucket.left_to_right += count,
            Some("right_to_left") => bucket.right_to_left += count,
            _ => bucket.unknown += count,
        }
        bucket.detection_count += count;
    }
    Ok(out)
}

pub(crate) fn direction_counts(
    conn: &rusqlite::Connection,
    date_threshold: &str,
    camera_id: Option<&str>,
) -> Result<BTreeMap<String, i64>, base::Error> {
    let mut stmt = conn
        .prepare_cached(DIRECTION_COUNTS_SQL)
        .err_kind(ErrorKind::Internal)?;
    let mut rows = stmt
        .query(named_params! {
            ":date_threshold": date_threshold,
            ":camera_id": camera_id,
        })
        .err_kind(ErrorKind::Internal)?;
    let mut out = BTreeMap::new();
    for d in ["left_to_right", "right_to_left", "unknown"] {
        out.insert(d.to_owned(), 0);
    }
    while let Some(row) = rows.next().err_kind(ErrorKind::Internal)? {
        let direction: Option<String> = row.get(0).err_kind(ErrorKind::Internal)?;
        let count: i64 = row.get(1).err_kind(ErrorKind::Internal)?;
        *out.entry(direction.unwrap_or_else(|| "unknown".to_owned()))
            .or_default() += count;
    }
    Ok(out)
}

pub(crate) fn entry_counts_by_camera(
    conn: &rusqlite::Connection,
    cutoff: &str,
) -> Result<BTreeMap<String, i64>, base::Error> {
    let mut stmt = conn
        .prepare_cached(ENTRY_COUNTS_BY_CAMERA_SQL)
        .err_kind(ErrorKind::Internal)?;
    let mut rows = stmt
        .query(named_params! {":cutoff": cutoff})
        .err_kind(ErrorKind::Internal)?;
    let mut out = BTreeMap::new();
    while let Some(row) = rows.next().err_kind(ErrorKind::Internal)? {
        let camera_id: Option<String> = row.get(0).err_kind(ErrorKind::Internal)?;
        let count: i64 = row.get(1).err_kind(ErrorKind::Internal)?;
        if let Some(camera_id) = camera_id {
            out.insert(camera_id, count);
        }
    }
    Ok(out)
}

/// Per-camera hourly entry+exit counts since `cutoff`, optionally filtered
/// to one camera. Returns `camera_id -> [(hour, count)]` in hour order.
pub(crate) fn time_series(
    conn: &rusqlite::Connection,
    cutoff: &str,
    camera_id: Option<&str>,
) -> Result<BTreeMap<String, Vec<(String, i64)>>, base::Error> {
    let mut stmt = conn
        .prepare_cached(TIME_SERIES_SQL)
        .err_kind(ErrorKind::Internal)?;
    let mut rows = stmt
        .query(named_params! {":cutoff": cutoff, ":camera_id": camera_id})
        .err_kind(ErrorKind::Internal)?;
    let mut out: BTreeMap<String, Vec<(String, i64)>> = BTreeMap::new();
    while let Some(row) = rows.next().err_kind(ErrorKind::Internal)? {
        let hour: String = row.get(0).err_kind(ErrorKind::Internal)?;
        let camera: Option<String> = row.get(1).err_kind(ErrorKind::Internal)?;
        let count: i64 = row.get(2).err_kind(ErrorKind::Internal)?;
        if let Some(camera) = camera {
            out.entry(camera).or_default().push((hour, count));
        }
    }
    Ok(out)
}

pub(crate) fn insert_event(
    conn: &rusqlite::Connection,
    timestamp: &str,
    type_: &str,
    data: Option<&str>,
) -> Result<i64, base::Error> {
    let mut stmt = conn
        .prepare_cached("insert into events (timestamp, type, data) values (?1, ?2, ?3)")
        .err_kind(ErrorKind::Internal)?;
    stmt.execute(params![timestamp, type_, data])
        .err_kind(ErrorKind::Internal)?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn list_events(
    conn: &rusqlite::Connection,
    limit: i64,
    from_date: Option<&str>,
    to_date: Option<&str>,
) -> Result<Vec<GeneralEvent>, base::Error> {
    let mut stmt = conn
        .prepare_cached(
            r#"
            select id, timestamp, type, data from events
            where
              (:from_date is null or datetime(timestamp) >= datetime(:from_date)) and
              (:to_date is null or datetime(timestamp) <= datetime(:to_date))
            order by timestamp desc, id desc
            limit :limit
            "#,
        )
        .err_kind(ErrorKind::Internal)?;
    let rows = stmt
        .query_map(
            named_params! {
                ":limit": limit,
                ":from_date": from_date,
                ":to_date": to_date,
            },
            |row| {
                Ok(GeneralEvent {
                    id: row.get("id")?,
                    timestamp: row.get("timestamp")?,
                    type_: row.get("type")?,
                    data: row.get("data")?,
                })
            },
        )
        .err_kind(ErrorKind::Internal)?;
    rows.collect::<Result<Vec<_>, _>>()
        .err_kind(ErrorKind::Internal)
}

pub(crate) fn insert_system_log(
    conn: &rusqlite::Connection,
    timestamp: &str,
    level: &str,
    module: &str,
    message: &str,
) -> Result<(), base::Error> {
    let mut stmt = conn
        .prepare_cached(
            "insert into system_logs (timestamp, level, module, message) values (?1, ?2, ?3, ?4)",
        )
        .err_kind(ErrorKind::Internal)?;
    stmt.execute(params![timestamp, level, module, message])
        .err_kind(ErrorKind::Internal)?;
    Ok(())
}

pub(crate) fn get_setting(
    conn: &rusqlite::Connection,
    key: &str,
) -> Result<Option<(String, String)>, base::Error> {
    conn.query_row(
        "select value, updated_at from settings where key = ?1",
        params![key],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()
    .err_kind(ErrorKind::Internal)
}

pub(crate) fn set_setting(
    conn: &rusqlite::Connection,
    key: &str,
    value: &str,
    updated_at: &str,
) -> Result<(), base::Error> {
    conn.execute(
        "insert or replace into settings (key, value, updated_at) values (?1, ?2, ?3)",
        params![key, value, updated_at],
    )
    .err_kind(ErrorKind::Internal)?;
    Ok(())
}

pub(crate) fn get_camera_roi(
    conn: &rusqlite::Connection,
    camera_id: &str,
) -> Result<Option<RoiConfig>, base::Error> {
    conn.query_row(
        r#"
        select roi_x1, roi_y1, roi_x2, roi_y2, entry_direction
        from camera_config where camera_id = ?1
        "#,
        params![camera_id],
        |row| {
            Ok(RoiConfig {
                x1: row.get(0)?,
                y1: row.get(1)?,
                x2: row.get(2)?,
                y2: row.get(3)?,
                entry_direction: row.get(4)?,
            })
        },
    )
    .optional()
    .err_kind(ErrorKind::Internal)
}

pub(crate) fn save_camera_roi(
    conn: &rusqlite::Connection,
    camera_id: &str,
    roi: &RoiConfig,
) -> Result<(), base::Error> {
    conn.execute(
        r#"
        insert or replace into camera_config
          (camera_id, roi_x1, roi_y1, roi_x2, roi_y2, entry_direction)
          values (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
        params![
            camera_id,
            roi.x1,
            roi.y1,
            roi.x2,
            roi.y2,
            roi.entry_direction
        ],
    )
    .err_kind(ErrorKind::Internal)?;
    Ok(())
}

pub(crate) fn delete_camera_roi(
    conn: &rusqlite::Connection,
    camera_id: &str,
) -> Result<bool, base::Error> {
    let n = conn
        .execute(
            "delete from camera_config where camera_id = ?1",
            params![camera_id],
        )
        .err_kind(ErrorKind::Internal)?;
    Ok(n > 0)
}

pub(crate) fn list_cameras(conn: &rusqlite::Connection) -> Result<Vec<CameraRow>, base::Error> {
    let mut stmt = conn
        .prepare_cached(&format!("{LIST_CAMERAS_SQL_PREFIX} order by c.camera_id"))
        .err_kind(ErrorKind::Internal)?;
    let rows = stmt
        .query_map([], camera_from_row)
        .err_kind(ErrorKind::Internal)?;
    rows.collect::<Result<Vec<_>, _>>()
        .err_kind(ErrorKind::Internal)
}

pub(crate) fn get_camera(
    conn: &rusqlite::Connection,
    camera_id: &str,
) -> Result<Option<CameraRow>, base::Error> {
    let mut stmt = conn
        .prepare_cached(&format!("{LIST_CAMERAS_SQL_PREFIX} where c.camera_id = ?1"))
        .err_kind(ErrorKind::Internal)?;
    stmt.query_row(params![camera_id], camera_from_row)
        .optional()
        .err_kind(ErrorKind::Internal)
}

pub(crate) fn update_camera(
    conn: &rusqlite::Connection,
    now: &str,
    camera_id: &str,
    u: &crate::db::CameraUpdate,
) -> Result<bool, base::Error> {
    let n = conn
        .execute(
            r#"
            update cameras set
              name = coalesce(?2, name),
              width = coalesce(?3, width),
              height = coalesce(?4, height),
              fps = coalesce(?5, fps),
              enabled = coalesce(?6, enabled),
              updated_at = ?7
            where camera_id = ?1
            "#,
            params![
                camera_id,
                u.name,
                u.width,
                u.height,
                u.fps,
                u.enabled.map(|e| e as i64),
                now,
            ],
        )
        .err_kind(ErrorKind::Internal)?;
    Ok(n > 0)
}

pub(crate) fn upsert_camera(
    conn: &rusqlite::Connection,
    now: &str,
    c: &crate::db::CameraChange,
) -> Result<(), base::Error> {
    conn.execute(
        r#"
        insert into cameras (camera_id, source, name, width, height, fps, enabled,
                             created_at, updated_at)
          values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
          on conflict (camera_id) do update set
            source = excluded.source,
            name = excluded.name,
            width = excluded.width,
            height = excluded.height,
            fps = excluded.fps,
            enabled = excluded.enabled,
            updated_at = excluded.updated_at
        "#,
        params![
            c.camera_id,
            c.source,
            c.name,
            c.width,
            c.height,
            c.fps,
            c.enabled as i64,
            now,
        ],
    )
    .err_kind(ErrorKind::Internal)?;
    Ok(())
}

pub(crate) fn delete_camera(
    conn: &rusqlite::Connection,
    camera_id: &str,
) -> Result<bool, base::Error> {
    let n = conn
        .execute("delete from cameras where camera_id = ?1", params![camera_id])
        .err_kind(ErrorKind::Internal)?;
    delete_camera_roi(conn, camera_id)?;
    Ok(n > 0)
}
