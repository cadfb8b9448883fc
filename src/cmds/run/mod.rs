// This file is part of Sightline, a multi-camera person-flow analytics engine.
// Copyright (C) 2025 The Sightline Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Subcommand to run the service: capture, tracking, retention, and HTTP.

use crate::capture::Tuning;
use crate::detect::{self, DetectorConfig};
use crate::loadmon::{self, LoadMonitor};
use crate::metrics::Aggregator;
use crate::notify::EventBus;
use crate::pipeline::{self, StatusBoard, WorkerConfig, WorkerSet};
use crate::registry::CameraRegistry;
use crate::stream::{self, Geometry};
use crate::web;
use base::clock::{Clocks, RealClocks};
use base::{err, Error, ErrorKind, ResultExt as _};
use bpaf::Bpaf;
use db::snap;
use db::{CameraChange, Database, SnapshotDir};
use hyper::service::{make_service_fn, service_fn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use self::config::ConfigFile;

pub mod config;

/// Runs the person-presence service.
#[derive(Bpaf, Debug)]
#[bpaf(command("run"))]
pub struct Args {
    /// Path to the configuration file.
    #[bpaf(argument("PATH"), fallback("/etc/sightline.toml".into()))]
    config: PathBuf,
}

/// Reads the configuration, treating a missing file as all-defaults (so a
/// bare installation still comes up on the default camera).
pub(crate) fn read_config(path: &Path) -> Result<ConfigFile, Error> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            eprintln!("config {} not found; using defaults", path.display());
            return Ok(ConfigFile::default());
        }
        Err(e) => {
            return Err(err!(Unavailable, "unable to read {}: {e}", path.display()));
        }
    };
    toml::from_str(&raw)
        .map_err(|e| err!(InvalidArgument, "unable to parse {}: {e}", path.display()))
}

pub fn run(args: Args) -> Result<i32, Error> {
    let config = read_config(&args.config)?;
    let default_filter = config
        .logging
        .level
        .as_deref()
        .or(config.api.debug.then_some("debug"));
    base::tracing_setup::install_with_default(default_filter);
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .err_kind(ErrorKind::Internal)?;
    let r = rt.block_on(async_run(&config));

    // tokio normally waits for all spawned tasks to complete, but:
    // * in the graceful shutdown path, we wait for specific tasks with
    //   logging.
    // * in the immediate shutdown path, we don't want to wait.
    rt.shutdown_background();
    r
}

async fn async_run(config: &ConfigFile) -> Result<i32, Error> {
    let (shutdown_tx, shutdown_rx) = base::shutdown::channel();
    let mut shutdown_tx = Some(shutdown_tx);

    tokio::pin! {
        let int = signal(SignalKind::interrupt()).err_kind(ErrorKind::Internal)?;
        let term = signal(SignalKind::terminate()).err_kind(ErrorKind::Internal)?;
        let inner = inner(config, shutdown_rx);
    }

    tokio::select! {
        _ = int.recv() => {
            info!("received SIGINT; shutting down gracefully. \
                   Send another SIGINT or SIGTERM to shut down immediately.");
            shutdown_tx.take();
        },
        _ = term.recv() => {
            info!("received SIGTERM; shutting down gracefully. \
                   Send another SIGINT or SIGTERM to shut down immediately.");
            shutdown_tx.take();
        },
        result = &mut inner => return result,
    }

    tokio::select! {
        _ = int.recv() => Err(err!(Cancelled, "immediate shutdown due to second signal (SIGINT)")),
        _ = term.recv() => Err(err!(Cancelled, "immediate shutdown due to second signal (SIGTERM)")),
        result = &mut inner => result,
    }
}

async fn inner(config: &ConfigFile, shutdown_rx: base::shutdown::Receiver) -> Result<i32, Error> {
    let clocks: Arc<dyn Clocks> = Arc::new(RealClocks {});
    let (_db_lock, conn) = super::open_conn(&config.database.path, super::OpenMode::ReadWrite)?;
    let db = Arc::new(Database::new(conn)?);
    info!("database is loaded");

    let snapshots = SnapshotDir::open(&config.snapshots.root)?;
    let opener = match stream::real_opener() {
        Ok(o) => o,
        Err(e) => {
            warn!(err = %e.chain(), "no capture backend; sources will fail to open");
            Arc::new(stream::NullOpener)
        }
    };
    let detector = detect::load(&DetectorConfig {
        model_path: config.detection.model_path.clone(),
        confidence_threshold: config.detection.confidence_threshold,
        person_class_id: config.detection.person_class_id,
    })?;

    let default_geometry = Geometry {
        width: config.camera.width,
        height: config.camera.height,
        fps: config.camera.fps,
    };
    let registry = Arc::new(CameraRegistry::new(
        opener,
        clocks.clone(),
        Tuning::default(),
        default_geometry,
    ));
    let status = StatusBoard::new();
    let load = LoadMonitor::new();
    let bus = EventBus::new(clocks.clone());
    let env = pipeline::Environment {
        db: db.clone(),
        snapshots: snapshots.clone(),
        detector,
        notifier: bus.clone(),
        load: load.clone(),
        status: status.clone(),
        clocks: clocks.clone(),
        shutdown_rx: shutdown_rx.clone(),
    };
    let workers = WorkerSet::new(
        env,
        WorkerConfig {
            idle_fps: config.detection.idle_fps,
            active_fps: config.detection.active_fps,
            person_class_id: config.detection.person_class_id,
            direction_threshold: config.detection.direction_threshold,
        },
    );

    // Load cameras from the store, bootstrapping the default one on a
    // fresh database.
    let mut rows = db.lock().list_cameras()?;
    if rows.is_empty() {
        info!(
            source = %config.camera.device_id,
            "no cameras registered; adding default camera main"
        );
        db.lock().add_camera(
            clocks.realtime(),
            &CameraChange {
                camera_id: "main".to_owned(),
                source: config.camera.device_id.clone(),
                name: Some("Camera main".to_owned()),
                width: Some(i64::from(config.camera.width)),
                height: Some(i64::from(config.camera.height)),
                fps: Some(i64::from(config.camera.fps)),
                enabled: true,
            },
        )?;
        rows = db.lock().list_cameras()?;
    }
    let camera_count = rows.len();
    // Source probes can block for seconds apiece; keep them off the
    // runtime threads.
    tokio::task::spawn_blocking({
        let (registry, workers) = (registry.clone(), workers.clone());
        move || {
            for row in rows {
                let geometry = match (row.width, row.height) {
                    (Some(w), Some(h)) => Some(Geometry {
                        width: w as u32,
                        height: h as u32,
                        fps: row.fps.unwrap_or(30) as u32,
                    }),
                    _ => None,
                };
                if let Err(e) = registry.add(&row.camera_id, &row.source, geometry, row.enabled) {
                    warn!(
                        camera = %row.camera_id,
                        err = %e.chain(),
                        "camera failed to open; listed as inactive"
                    );
                    continue;
                }
                if row.enabled {
                    if let Some(fs) = registry.get(&row.camera_id) {
                        if let Err(e) = workers.spawn(&row.camera_id, fs) {
                            warn!(camera = %row.camera_id, err = %e.chain(), "worker spawn failed");
                        }
                    }
                }
            }
        }
    })
    .await
    .map_err(|e| err!(Internal, "camera load task panicked: {e}"))?;
    info!(cameras = camera_count, "cameras are loaded");

    let sweeper = snap::start_sweeper(
        snapshots.clone(),
        config.snapshots.max_files,
        Duration::from_secs(config.snapshots.cleanup_interval),
        shutdown_rx.clone(),
    );
    let sampler = loadmon::start_sampler(load, shutdown_rx.clone());

    {
        let now = clocks.realtime();
        let mut l = db.lock();
        l.log_system_event(now, "INFO", "run", "startup complete")?;
        l.log_event(now, "startup", Some(&serde_json::json!({ "cameras": camera_count })))?;
    }

    // The HTTP interface.
    let aggregator = Aggregator::new(db.clone(), clocks.clone(), config.api.demo_fill);
    let svc = Arc::new(web::Service::new(web::Config {
        db: db.clone(),
        registry: registry.clone(),
        workers: workers.clone(),
        status,
        aggregator,
        snapshots,
        clocks: clocks.clone(),
    }));
    let make_svc = make_service_fn(move |_conn| {
        futures::future::ok::<_, std::convert::Infallible>(service_fn({
            let svc = Arc::clone(&svc);
            move |req| Arc::clone(&svc).serve(req)
        }))
    });
    let addr: std::net::SocketAddr = format!("{}:{}", config.api.host, config.api.port)
        .parse()
        .map_err(|e| err!(InvalidArgument, "bad api.host/api.port: {e}"))?;
    let server = hyper::Server::try_bind(&addr)
        .map_err(|e| err!(Unavailable, "unable to bind to {addr}: {e}"))?
        .tcp_nodelay(true)
        .serve(make_svc);
    let server = server.with_graceful_shutdown(shutdown_rx.future());
    let web_handle = tokio::spawn(server);

    info!(%addr, "ready to serve HTTP requests");
    shutdown_rx.as_future().await;

    // Orderly shutdown: workers first, then frame sources, then the
    // store's daemons, then the store itself.
    info!("shutting down workers and frame sources");
    tokio::task::spawn_blocking({
        let (registry, workers) = (registry.clone(), workers.clone());
        move || {
            workers.stop_all();
            registry.stop_all();
            let _ = sweeper.join();
            let _ = sampler.join();
        }
    })
    .await
    .map_err(|e| err!(Internal, "shutdown task panicked: {e}"))?;

    {
        let now = clocks.realtime();
        let mut l = db.lock();
        let _ = l.log_system_event(now, "INFO", "run", "shutdown complete");
        let _ = l.log_event(now, "shutdown", None);
    }

    info!("waiting for HTTP requests to finish");
    web_handle
        .await
        .map_err(|e| err!(Internal, "web task panicked: {e}"))?
        .map_err(|e| err!(Internal, "web server failed: {e}"))?;

    info!("exiting");
    Ok(0)
}
