// This file is part of Sightline, a multi-camera person-flow analytics engine.
// Copyright (C) 2025 The Sightline Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! System-load sampling for the workers' adaptive rate control.
//!
//! A 1 Hz daemon samples overall CPU%; workers multiply their processing
//! interval by a factor derived from the recent average, shedding load from
//! secondary cameras first. The camera named `main` is the priority camera
//! and is slowed the least.

use base::{shutdown, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);
const SAMPLE_WINDOW: usize = 30;

/// Samples required before the factor departs from 1.0.
const MIN_SAMPLES: usize = 5;

/// The camera id treated as the priority camera.
pub const PRIORITY_CAMERA: &str = "main";

#[derive(Default)]
pub struct LoadMonitor {
    samples: Mutex<VecDeque<f32>>,
}

impl LoadMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(LoadMonitor::default())
    }

    pub fn record_sample(&self, cpu_percent: f32) {
        let mut samples = self.samples.lock();
        if samples.len() == SAMPLE_WINDOW {
            samples.pop_front();
        }
        samples.push_back(cpu_percent);
        if cpu_percent > 90.0 {
            warn!(cpu_percent, "high CPU usage");
        }
    }

    /// Average CPU% over the window; `None` until enough samples exist.
    pub fn average_cpu(&self) -> Option<f32> {
        let samples = self.samples.lock();
        if samples.len() < MIN_SAMPLES {
            return None;
        }
        Some(samples.iter().sum::<f32>() / samples.len() as f32)
    }

    /// The per-iteration interval multiplier for a camera.
    pub fn interval_factor(&self, camera_id: &str) -> f64 {
        let Some(avg) = self.average_cpu() else {
            return 1.0;
        };
        let main = camera_id == PRIORITY_CAMERA;
        if avg > 80.0 {
            if main {
                1.2
            } else {
                2.0
            }
        } else if avg > 60.0 {
            if main {
                1.1
            } else {
                1.5
            }
        } else {
            1.0
        }
    }
}

/// Starts the 1 Hz sampler daemon.
pub fn start_sampler(
    monitor: Arc<LoadMonitor>,
    shutdown_rx: shutdown::Receiver,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("cpu-sampler".to_owned())
        .spawn(move || {
            let mut system = sysinfo::System::new();
            // The first refresh only establishes a baseline.
            system.refresh_cpu_usage();
            info!("cpu sampler running");
            while shutdown_rx.wait_for(SAMPLE_INTERVAL).is_ok() {
                system.refresh_cpu_usage();
                monitor.record_sample(system.global_cpu_usage());
            }
            info!("cpu sampler exiting");
        })
        .expect("can't create thread")
}
