// This file is part of Sightline, a multi-camera person-flow analytics engine.
// Copyright (C) 2025 The Sightline Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Decodes request paths.

/// A decoded request path.
#[derive(Debug, Eq, PartialEq)]
pub(super) enum Path {
    TopLevel,                      // "/api/"
    Status,                        // "/api/status"
    Cameras,                       // "/api/cameras"
    Camera(String),                // "/api/cameras/<id>"
    CameraRoi(String),             // "/api/cameras/<id>/roi"
    CameraRoiClear(String),        // "/api/cameras/<id>/roi/clear"
    Events,                        // "/api/events"
    RecentDetections,              // "/api/detections/recent"
    Metrics,                       // "/api/metrics"
    MetricsSummary,                // "/api/metrics/summary"
    MetricsDaily,                  // "/api/metrics/daily"
    AnalyticsCompare,              // "/api/analytics/compare"
    AnalyticsTimeSeries,           // "/api/analytics/time-series"
    AnalyticsHeatmap(String),      // "/api/analytics/heatmap/<id>"
    Snapshots(String),             // "/api/snapshots/<id>"
    SnapshotImage(String, String), // "/api/snapshot-image/<id>/<file>"
    VideoFeed(String),             // "/video_feed/<id>"
    NotFound,
}

impl Path {
    /// Decodes a request path, notably not including any request
    /// parameters.
    ///
    /// Suspicious snapshot-image paths are decoded as-is; rejecting them
    /// (with 403 rather than 404) is the snapshot store's call.
    pub(super) fn decode(path: &str) -> Self {
        if let Some(camera) = path.strip_prefix("/video_feed/") {
            if camera.is_empty() || camera.contains('/') {
                return Path::NotFound;
            }
            return Path::VideoFeed(camera.to_owned());
        }
        let path = match path.strip_prefix("/api/") {
            Some(p) => p,
            None => return Path::NotFound,
        };
        match path {
            "" => return Path::TopLevel,
            "status" => return Path::Status,
            "cameras" => return Path::Cameras,
            "events" => return Path::Events,
            "detections/recent" => return Path::RecentDetections,
            "metrics" => return Path::Metrics,
            "metrics/summary" => return Path::MetricsSummary,
            "metrics/daily" => return Path::MetricsDaily,
            "analytics/compare" => return Path::AnalyticsCompare,
            "analytics/time-series" => return Path::AnalyticsTimeSeries,
            _ => {}
        }
        if let Some(path) = path.strip_prefix("cameras/") {
            let (camera, rest) = match path.split_once('/') {
                Some((c, r)) => (c, Some(r)),
                None => (path, None),
            };
            if camera.is_empty() {
                return Path::NotFound;
            }
            let camera = camera.to_owned();
            return match rest {
                None => Path::Camera(camera),
                Some("roi") => Path::CameraRoi(camera),
                Some("roi/clear") => Path::CameraRoiClear(camera),
                Some(_) => Path::NotFound,
            };
        }
        if let Some(camera) = path.strip_prefix("analytics/heatmap/") {
            if camera.is_empty() || camera.contains('/') {
                return Path::NotFound;
            }
            return Path::AnalyticsHeatmap(camera.to_owned());
        }
        if let Some(camera) = path.strip_prefix("snapshots/") {
            if camera.is_empty() || camera.contains('/') {
                return Path::NotFound;
            }
            return Path::Snapshots(camera.to_owned());
        }
        if let Some(path) = path.strip_prefix("snapshot-image/") {
            let (camera, file) = match path.split_once('/') {
                Some(pair) => pair,
                None => return Path::NotFound,
            };
            if camera.is_empty() || file.is_empty() {
                return Path::NotFound;
            }
            return Path::SnapshotImage(camera.to_owned(), file.to_owned());
        }
        Path::NotFound
    }
}

#[cfg(test)]
mod tests {
    use super::Path;

    #[test]
    fn paths() {
        assert_eq!(Path::decode("/foo"), Path::NotFound);
        assert_eq!(Path::decode("/api/"), Path::TopLevel);
        assert_eq!(Path::decode("/api/status"), Path::Status);
        assert_eq!(Path::decode("/api/cameras"), Path::Cameras);
        assert_eq!(
            Path::decode("/api/cameras/back door"),
            Path::Camera("back door".to_owned())
        );
        assert_eq!(
            Path::decode("/api/cameras/main/roi"),
            Path::CameraRoi("main".to_owned())
        );
        assert_eq!(
            Path::decode("/api/cameras/main/roi/clear"),
            Path::CameraRoiClear("main".to_owned())
        );
        assert_eq!(Path::decode("/api/cameras/main/junk"), Path::NotFound);
        assert_eq!(Path::decode("/api/cameras/"), Path::NotFound);
        assert_eq!(Path::decode("/api/events"), Path::Events);
        assert_eq!(
            Path::decode("/api/detections/recent"),
            Path::RecentDetections
        );
        assert_eq!(Path::decode("/api/metrics"), Path::Metrics);
        assert_eq!(Path::decode("/api/metrics/summary"), Path::MetricsSummary);
        assert_eq!(Path::decode("/api/metrics/daily"), Path::MetricsDaily);
        assert_eq!(
            Path::decode("/api/analytics/compare"),
            Path::AnalyticsCompare
        );
        assert_eq!(
            Path::decode("/api/analytics/time-series"),
            Path::AnalyticsTimeSeries
        );
        assert_eq!(
            Path::decode("/api/analytics/heatmap/main"),
            Path::AnalyticsHeatmap("main".to_owned())
        );
        assert_eq!(
            Path::decode("/api/snapshots/main"),
            Path::Snapshots("main".to_owned())
        );
        assert_eq!(
            Path::decode("/api/snapshot-image/main/snapshot_1.jpg"),
            Path::SnapshotImage("main".to_owned(), "snapshot_1.jpg".to_owned())
        );
        // Traversal attempts decode (the store rejects them with 403).
        assert_eq!(
            Path::decode("/api/snapshot-image/main/../../etc/passwd"),
            Path::SnapshotImage("main".to_owned(), "../../etc/passwd".to_owned())
        );
        assert_eq!(
            Path::decode("/video_feed/main"),
            Path::VideoFeed("main".to_owned())
        );
        assert_eq!(Path::decode("/video_feed/"), Path::NotFound);
        assert_eq!(Path::decode("/api/junk"), Path::NotFound);
    }
}
