// This file is part of Sightline, a multi-camera person-flow analytics engine.
// Copyright (C) 2025 The Sightline Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! JSON types for the HTTP interface.

use crate::capture::SourceStatus;
use crate::pipeline::{CameraStatus, FootfallTotals};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// `GET /api/status`.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub cameras: BTreeMap<String, CameraStatusJson>,
    pub dashboard: FootfallTotals,
}

#[derive(Debug, Serialize)]
pub struct CameraStatusJson {
    #[serde(flatten)]
    pub detection: CameraStatus,
    pub source: Option<SourceStatus>,
}

/// One row of `GET /api/cameras`.
#[derive(Debug, Serialize)]
pub struct CameraJson {
    pub camera_id: String,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fps: Option<i64>,
    pub enabled: bool,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roi: Option<RoiJson>,
    /// Live source state; absent when the camera isn't in the registry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SourceStatus>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RoiJson {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
    pub entry_direction: String,
}

impl From<db::RoiConfig> for RoiJson {
    fn from(r: db::RoiConfig) -> Self {
        RoiJson {
            x1: r.x1,
            y1: r.y1,
            x2: r.x2,
            y2: r.y2,
            entry_direction: r.entry_direction,
        }
    }
}

impl From<RoiJson> for db::RoiConfig {
    fn from(r: RoiJson) -> Self {
        db::RoiConfig {
            x1: r.x1,
            y1: r.y1,
            x2: r.x2,
            y2: r.y2,
            entry_direction: r.entry_direction,
        }
    }
}

/// `POST /api/cameras` body.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PostCamera {
    pub id: String,
    pub source: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub width: Option<i64>,
    #[serde(default)]
    pub height: Option<i64>,
    #[serde(default)]
    pub fps: Option<i64>,
    /// New cameras default to enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// `PUT /api/cameras/<id>` body; omitted fields are unchanged.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PutCamera {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub width: Option<i64>,
    #[serde(default)]
    pub height: Option<i64>,
    #[serde(default)]
    pub fps: Option<i64>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

/// `GET /api/snapshots/<id>`.
#[derive(Debug, Serialize)]
pub struct SnapshotsResponse {
    pub camera_id: String,
    /// Newest first.
    pub snapshots: Vec<String>,
}
