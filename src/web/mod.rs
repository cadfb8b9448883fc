// This file is part of Sightline, a multi-camera person-flow analytics engine.
// Copyright (C) 2025 The Sightline Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The HTTP interface.
//!
//! A single hyper service dispatches on decoded paths (`path.rs`). All
//! state is injected: the event store, the camera registry, the worker set,
//! the status board, and the aggregator. Handlers hold the database lock
//! only for point queries; the one long-lived response is the MJPEG
//! preview, which reads the freshest-frame buffer on a ~20 fps timer.

mod path;

use self::path::Path;
use crate::capture::State;
use crate::json;
use crate::metrics::{Aggregator, TimeRange};
use crate::pipeline::{StatusBoard, WorkerSet};
use crate::registry::CameraRegistry;
use crate::stream::Geometry;
use base::clock::Clocks;
use base::{err, Error, ErrorKind};
use bytes::Bytes;
use db::{CameraChange, CameraUpdate, Database, SnapshotDir};
use futures::StreamExt as _;
use http::header::{self, HeaderValue};
use http::{Method, Request, Response, StatusCode};
use hyper::Body;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// An HTTP error response.
///
/// A thin wrapper over the hyper response type allowing automatic
/// conversion from `base::Error` (kind → status code).
struct HttpError(Response<Body>);

impl From<Response<Body>> for HttpError {
    fn from(response: Response<Body>) -> Self {
        HttpError(response)
    }
}

impl From<Error> for HttpError {
    fn from(err: Error) -> Self {
        HttpError(from_base_error(err))
    }
}

fn plain_response<B: Into<Body>>(status: StatusCode, body: B) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))
        .body(body.into())
        .expect("hardcoded head should be valid")
}

fn not_found<B: Into<Body>>(body: B) -> HttpError {
    HttpError(plain_response(StatusCode::NOT_FOUND, body))
}

fn bad_req<B: Into<Body>>(body: B) -> HttpError {
    HttpError(plain_response(StatusCode::BAD_REQUEST, body))
}

fn from_base_error(err: Error) -> Response<Body> {
    use ErrorKind::*;
    let status_code = match err.kind() {
        Unauthenticated => StatusCode::UNAUTHORIZED,
        PermissionDenied => StatusCode::FORBIDDEN,
        InvalidArgument | FailedPrecondition => StatusCode::BAD_REQUEST,
        NotFound => StatusCode::NOT_FOUND,
        Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    plain_response(status_code, err.to_string())
}

type ResponseResult = Result<Response<Body>, HttpError>;

fn serve_json<T: serde::Serialize>(out: &T) -> ResponseResult {
    let body = serde_json::to_vec(out)
        .map_err(|e| HttpError(plain_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())))?;
    Ok(Response::builder()
        .header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        )
        .body(body.into())
        .expect("hardcoded head should be valid"))
}

/// Extracts an `application/json` POST/PUT body from a request.
async fn extract_json_body<T: serde::de::DeserializeOwned>(
    req: &mut Request<Body>,
) -> Result<T, HttpError> {
    let correct_mime_type = match req.headers().get(header::CONTENT_TYPE) {
        Some(t) if t == "application/json" => true,
        Some(t) if t == "application/json; charset=UTF-8" => true,
        _ => false,
    };
    if !correct_mime_type {
        return Err(bad_req("expected application/json request body"));
    }
    let b = std::mem::replace(req.body_mut(), Body::empty());
    let bytes = hyper::body::to_bytes(b)
        .await
        .map_err(|e| bad_req(format!("unable to read request body: {e}")))?;
    serde_json::from_slice(&bytes).map_err(|e| bad_req(format!("bad request body: {e}")))
}

fn query_params(req: &Request<Body>) -> BTreeMap<String, String> {
    req.uri()
        .query()
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default()
}

/// Expands `from`/`to` ISO dates to day-boundary timestamps.
fn date_bounds(params: &BTreeMap<String, String>) -> (Option<String>, Option<String>) {
    let from = params.get("from").map(|d| format!("{d} 00:00:00"));
    let to = params.get("to").map(|d| format!("{d} 23:59:59"));
    (from, to)
}

fn parse_range(params: &BTreeMap<String, String>) -> Result<TimeRange, Error> {
    match params.get("timeRange") {
        Some(r) => r.parse(),
        None => Ok(TimeRange::Hours(24)),
    }
}

fn parse_limit(params: &BTreeMap<String, String>) -> i64 {
    params
        .get("limit")
        .and_then(|l| l.parse().ok())
        .unwrap_or(100)
        .clamp(1, 1000)
}

pub struct Config {
    pub db: Arc<Database>,
    pub registry: Arc<CameraRegistry>,
    pub workers: Arc<WorkerSet>,
    pub status: Arc<StatusBoard>,
    pub aggregator: Arc<Aggregator>,
    pub snapshots: Arc<SnapshotDir>,
    pub clocks: Arc<dyn Clocks>,
}

pub struct Service {
    db: Arc<Database>,
    registry: Arc<CameraRegistry>,
    workers: Arc<WorkerSet>,
    status: Arc<StatusBoard>,
    aggregator: Arc<Aggregator>,
    snapshots: Arc<SnapshotDir>,
    clocks: Arc<dyn Clocks>,
}

impl Service {
    pub fn new(config: Config) -> Self {
        Service {
            db: config.db,
            registry: config.registry,
            workers: config.workers,
            status: config.status,
            aggregator: config.aggregator,
            snapshots: config.snapshots,
            clocks: config.clocks,
        }
    }

    pub async fn serve(
        self: Arc<Self>,
        req: Request<Body>,
    ) -> Result<Response<Body>, std::convert::Infallible> {
        let response = self
            .serve_inner(req)
            .await
            .unwrap_or_else(|HttpError(response)| response);
        Ok(response)
    }

    async fn serve_inner(self: Arc<Self>, mut req: Request<Body>) -> ResponseResult {
        let path = Path::decode(req.uri().path());
        // `http::Method` constants aren't matchable patterns; dispatch on
        // the method name.
        let method = req.method().clone();
        match (method.as_str(), path) {
            ("GET", Path::TopLevel) => serve_json(&serde_json::json!({
                "service": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            })),
            ("GET", Path::Status) => self.get_status(),
            ("GET", Path::Cameras) => self.get_cameras(),
            ("POST", Path::Cameras) => {
                let body: json::PostCamera = extract_json_body(&mut req).await?;
                self.post_camera(body).await
            }
            ("GET", Path::Camera(id)) => self.get_camera(&id),
            ("PUT", Path::Camera(id)) => {
                let body: json::PutCamera = extract_json_body(&mut req).await?;
                self.put_camera(&id, body)
            }
            ("DELETE", Path::Camera(id)) => self.delete_camera(&id),
            ("POST", Path::CameraRoi(id)) => {
                let body: json::RoiJson = extract_json_body(&mut req).await?;
                self.post_roi(&id, body)
            }
            ("POST", Path::CameraRoiClear(id)) => self.post_roi_clear(&id),
            ("GET", Path::Events) => self.get_events(&req),
            ("GET", Path::RecentDetections) => self.get_recent_detections(&req),
            ("GET", Path::Metrics) => self.get_metrics(&req),
            ("GET", Path::MetricsSummary) => self.get_metrics_summary(&req),
            ("GET", Path::MetricsDaily) => self.get_metrics_daily(&req),
            ("GET", Path::AnalyticsCompare) => self.get_analytics_compare(&req),
            ("GET", Path::AnalyticsTimeSeries) => self.get_analytics_time_series(&req),
            ("GET", Path::AnalyticsHeatmap(id)) => {
                serve_json(&self.aggregator.heatmap(&id, 10, 10))
            }
            ("GET", Path::Snapshots(id)) => self.get_snapshots(&id),
            ("GET", Path::SnapshotImage(id, file)) => self.get_snapshot_image(&id, &file),
            ("GET", Path::VideoFeed(id)) => self.get_video_feed(&id),
            (_, Path::NotFound) => Err(not_found("path not understood")),
            _ => Err(HttpError(plain_response(
                StatusCode::METHOD_NOT_ALLOWED,
                "method not allowed on this path",
            ))),
        }
    }

    fn get_status(&self) -> ResponseResult {
        let mut cameras = BTreeMap::new();
        for fs in self.registry.list_all() {
            cameras.insert(
                fs.camera_id().to_owned(),
                json::CameraStatusJson {
                    detection: self.status.get(fs.camera_id()),
                    source: Some(fs.status()),
                },
            );
        }
        // Workers can exist for cameras the registry no longer holds.
        for (camera_id, detection) in self.status.all() {
            cameras
                .entry(camera_id)
                .or_insert(json::CameraStatusJson {
                    detection,
                    source: None,
                });
        }
        serve_json(&json::StatusResponse {
            cameras,
            dashboard: self.status.totals(),
        })
    }

    fn camera_to_json(&self, c: db::CameraRow) -> json::CameraJson {
        let status = self.registry.get(&c.camera_id).map(|fs| fs.status());
        json::CameraJson {
            camera_id: c.camera_id,
            source: c.source,
            name: c.name,
            width: c.width,
            height: c.height,
            fps: c.fps,
            enabled: c.enabled,
            created_at: c.created_at,
            updated_at: c.updated_at,
            roi: c.roi.map(Into::into),
            status,
        }
    }

    fn get_cameras(&self) -> ResponseResult {
        let rows = self.db.lock().list_cameras()?;
        let cameras: Vec<_> = rows.into_iter().map(|c| self.camera_to_json(c)).collect();
        serve_json(&cameras)
    }

    fn get_camera(&self, id: &str) -> ResponseResult {
        let row = self
            .db
            .lock()
            .get_camera(id)?
            .ok_or_else(|| not_found(format!("no camera {id:?}")))?;
        serve_json(&self.camera_to_json(row))
    }

    async fn post_camera(self: Arc<Self>, body: json::PostCamera) -> ResponseResult {
        if !db::snap::is_safe_component(&body.id) {
            return Err(bad_req("camera id must be a plain, non-empty name"));
        }
        let geometry = match (body.width, body.height) {
            (Some(w), Some(h)) => Some(Geometry {
                width: w as u32,
                height: h as u32,
                fps: body.fps.unwrap_or(30) as u32,
            }),
            _ => None,
        };
        // The probe can block for seconds; keep it off the request threads.
        let this = self.clone();
        let (id, source, enabled) = (body.id.clone(), body.source.clone(), body.enabled);
        tokio::task::spawn_blocking(move || this.registry.add(&id, &source, geometry, enabled))
            .await
            .map_err(|e| err!(Internal, "probe task panicked: {e}"))??;

        self.db.lock().add_camera(
            self.clocks.realtime(),
            &CameraChange {
                camera_id: body.id.clone(),
                source: body.source.clone(),
                name: body.name.clone(),
                width: body.width,
                height: body.height,
                fps: body.fps,
                enabled: body.enabled,
            },
        )?;
        if body.enabled {
            if let Some(fs) = self.registry.get(&body.id) {
                self.workers.spawn(&body.id, fs)?;
            }
        }
        self.get_camera(&body.id)
    }

    fn put_camera(&self, id: &str, body: json::PutCamera) -> ResponseResult {
        let update = CameraUpdate {
            name: body.name,
            width: body.width,
            height: body.height,
            fps: body.fps,
            enabled: body.enabled,
        };
        if !self.db.lock().update_camera(self.clocks.realtime(), id, &update)? {
            return Err(not_found(format!("no camera {id:?}")));
        }
        match body.enabled {
            Some(true) => {
                if let Some(fs) = self.registry.get(id) {
                    fs.start();
                    self.workers.spawn(id, fs)?;
                }
            }
            Some(false) => {
                self.workers.remove(id);
                if let Some(fs) = self.registry.get(id) {
                    fs.stop();
                }
            }
            None => {}
        }
        self.get_camera(id)
    }

    fn delete_camera(&self, id: &str) -> ResponseResult {
        self.workers.remove(id);
        if let Err(e) = self.registry.remove(id) {
            // Not being in the registry is fine; the row may still exist.
            if e.kind() != ErrorKind::NotFound {
                return Err(e.into());
            }
        }
        if !self.db.lock().remove_camera(id)? {
            return Err(not_found(format!("no camera {id:?}")));
        }
        serve_json(&serde_json::json!({ "status": "removed", "camera_id": id }))
    }

    fn post_roi(&self, id: &str, body: json::RoiJson) -> ResponseResult {
        if self.db.lock().get_camera(id)?.is_none() {
            return Err(not_found(format!("no camera {id:?}")));
        }
        self.db.lock().save_roi(id, &body.into())?;
        self.workers.reload_roi(id)?;
        self.get_camera(id)
    }

    fn post_roi_clear(&self, id: &str) -> ResponseResult {
        let existed = self.db.lock().delete_roi(id)?;
        self.workers.reload_roi(id)?;
        serve_json(&serde_json::json!({ "status": "cleared", "existed": existed }))
    }

    fn get_events(&self, req: &Request<Body>) -> ResponseResult {
        let params = query_params(req);
        let (from, to) = date_bounds(&params);
        let events =
            self.db
                .lock()
                .list_events(parse_limit(&params), from.as_deref(), to.as_deref())?;
        serve_json(&events)
    }

    fn get_recent_detections(&self, req: &Request<Body>) -> ResponseResult {
        let params = query_params(req);
        let (from, to) = date_bounds(&params);
        let events = self.db.lock().recent_detection_events(
            parse_limit(&params),
            from.as_deref(),
            to.as_deref(),
        )?;
        serve_json(&events)
    }

    fn get_metrics(&self, req: &Request<Body>) -> ResponseResult {
        let params = query_params(req);
        let range = parse_range(&params)?;
        let camera = params.get("camera").map(String::as_str);
        let metrics = self
            .db
            .lock()
            .hourly_metrics(self.clocks.realtime(), range.hours(), camera)?;
        serve_json(&metrics)
    }

    fn get_metrics_summary(&self, req: &Request<Body>) -> ResponseResult {
        let params = query_params(req);
        let range = parse_range(&params)?;
        let camera = params.get("camera").map(String::as_str);
        serve_json(&self.aggregator.summary(range, camera)?)
    }

    fn get_metrics_daily(&self, req: &Request<Body>) -> ResponseResult {
        let params = query_params(req);
        let range = parse_range(&params)?;
        let camera = params.get("camera").map(String::as_str);
        serve_json(&self.aggregator.daily(range, camera)?)
    }

    fn known_cameras(&self) -> Vec<String> {
        self.registry
            .list_all()
            .iter()
            .map(|fs| fs.camera_id().to_owned())
            .collect()
    }

    fn get_analytics_compare(&self, req: &Request<Body>) -> ResponseResult {
        let params = query_params(req);
        let range = parse_range(&params)?;
        serve_json(&self.aggregator.camera_counts(range, &self.known_cameras())?)
    }

    fn get_analytics_time_series(&self, req: &Request<Body>) -> ResponseResult {
        let params = query_params(req);
        let range = parse_range(&params)?;
        let camera = params.get("camera").map(String::as_str);
        serve_json(&self
            .aggregator
            .time_series(camera, range, &self.known_cameras())?)
    }

    fn get_snapshots(&self, id: &str) -> ResponseResult {
        let snapshots = self.snapshots.list_recent(id, 20)?;
        serve_json(&json::SnapshotsResponse {
            camera_id: id.to_owned(),
            snapshots,
        })
    }

    fn get_snapshot_image(&self, id: &str, file: &str) -> ResponseResult {
        let path = self.snapshots.resolve(id, file)?;
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(not_found("no such snapshot"));
            }
            Err(e) => {
                return Err(Error::wrap(ErrorKind::Unavailable, e).into());
            }
        };
        Ok(Response::builder()
            .header(header::CONTENT_TYPE, HeaderValue::from_static("image/jpeg"))
            .body(bytes.into())
            .expect("hardcoded head should be valid"))
    }

    /// MJPEG live preview: JPEG-encoded freshest frames in a
    /// `multipart/x-mixed-replace` stream, capped around 20 fps.
    fn get_video_feed(&self, id: &str) -> ResponseResult {
        let Some(fs) = self.registry.get(id) else {
            return Err(not_found(format!("no camera {id:?}")));
        };
        if fs.status().state == State::Failed {
            return Err(HttpError(plain_response(
                StatusCode::GONE,
                "camera has failed",
            )));
        }
        let stream = futures::stream::unfold(fs, |fs| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if !fs.is_active() {
                return None;
            }
            let part = match fs.latest() {
                Some(frame) => match encode_jpeg_part(&frame) {
                    Ok(part) => part,
                    Err(e) => {
                        warn!(camera = %fs.camera_id(), err = %e.chain(), "mjpeg encode failed");
                        return None;
                    }
                },
                // Nothing yet; an empty chunk keeps the connection alive.
                None => Bytes::new(),
            };
            Some((Ok::<_, std::convert::Infallible>(part), fs))
        });
        Ok(Response::builder()
            .header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("multipart/x-mixed-replace; boundary=frame"),
            )
            .body(Body::wrap_stream(stream.boxed()))
            .expect("hardcoded head should be valid"))
    }
}

fn encode_jpeg_part(frame: &crate::stream::Frame) -> Result<Bytes, Error> {
    let mut jpeg = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, 75);
    encoder
        .encode(
            frame.data(),
            frame.width(),
            frame.height(),
            image::ExtendedColorType::Rgb8,
        )
        .map_err(|e| err!(Internal, "jpeg encode failed: {e}"))?;
    let mut part = Vec::with_capacity(jpeg.len() + 128);
    part.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: ");
    part.extend_from_slice(jpeg.len().to_string().as_bytes());
    part.extend_from_slice(b"\r\n\r\n");
    part.extend_from_slice(&jpeg);
    part.extend_from_slice(b"\r\n");
    Ok(Bytes::from(part))
}
