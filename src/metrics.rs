// This file is part of Sightline, a multi-camera person-flow analytics engine.
// Copyright (C) 2025 The Sightline Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Stateless analytics over the event store.
//!
//! Everything here is a query-and-shape layer: counts and series come from
//! `detection_events`, never from worker memory. The optional demo fill
//! fabricates deterministic per-camera values for cameras with no events in
//! the window, so a fresh install still renders charts; it is a UI
//! concession, gated off by default and never included in totals.

use base::clock::Clocks;
use base::{err, Error};
use db::{Database, HourBucket};
use itertools::Itertools as _;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

/// A `{n}h` / `{n}d` query range.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TimeRange {
    Hours(i64),
    Days(i64),
}

impl TimeRange {
    pub fn hours(self) -> i64 {
        match self {
            TimeRange::Hours(h) => h,
            TimeRange::Days(d) => d * 24,
        }
    }

    fn days_f64(self) -> f64 {
        self.hours() as f64 / 24.0
    }
}

impl FromStr for TimeRange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let (digits, make) = if let Some(d) = s.strip_suffix('h') {
            (d, TimeRange::Hours as fn(i64) -> TimeRange)
        } else if let Some(d) = s.strip_suffix('d') {
            (d, TimeRange::Days as fn(i64) -> TimeRange)
        } else {
            return Err(err!(InvalidArgument, "bad time range unit {s:?}"));
        };
        let n: i64 = digits
            .parse()
            .map_err(|_| err!(InvalidArgument, "bad time range {s:?}"))?;
        if n <= 0 {
            return Err(err!(InvalidArgument, "time range {s:?} must be positive"));
        }
        Ok(make(n))
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct HourPoint {
    pub hour: String,
    pub count: i64,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub total_detections: i64,
    pub avg_per_day: f64,
    /// `"HH:00 - HH+1:00"` of the busiest hour bucket, if any.
    pub peak_hour: Option<String>,
    pub peak_count: i64,
}

pub struct Aggregator {
    db: Arc<Database>,
    clocks: Arc<dyn Clocks>,
    demo_fill: bool,
}

impl Aggregator {
    pub fn new(db: Arc<Database>, clocks: Arc<dyn Clocks>, demo_fill: bool) -> Arc<Self> {
        Arc::new(Aggregator {
            db,
            clocks,
            demo_fill,
        })
    }

    /// Entry+exit totals per camera over the window. `known_cameras` (the
    /// registry's view) get demo values when they have no events and demo
    /// fill is on.
    pub fn camera_counts(
        &self,
        range: TimeRange,
        known_cameras: &[String],
    ) -> Result<BTreeMap<String, i64>, Error> {
        let now = self.clocks.realtime();
        let mut counts = self.db.lock().entry_counts_by_camera(now, range.hours())?;
        if self.demo_fill {
            for camera in known_cameras {
                counts
                    .entry(camera.clone())
                    .or_insert_with(|| demo_count(camera));
            }
        }
        Ok(counts)
    }

    /// Per-camera hourly entry+exit series over the window.
    pub fn time_series(
        &self,
        camera_id: Option<&str>,
        range: TimeRange,
        known_cameras: &[String],
    ) -> Result<BTreeMap<String, Vec<HourPoint>>, Error> {
        let now = self.clocks.realtime();
        let raw = self.db.lock().time_series(now, range.hours(), camera_id)?;
        let mut series: BTreeMap<String, Vec<HourPoint>> = raw
            .into_iter()
            .map(|(camera, points)| {
                let points = points
                    .into_iter()
                    .map(|(hour, count)| HourPoint { hour, count })
                    .collect();
                (camera, points)
            })
            .collect();
        if self.demo_fill {
            let pad: Vec<&String> = match camera_id {
                Some(id) => known_cameras.iter().filter(|c| c.as_str() == id).collect(),
                None => known_cameras.iter().collect(),
            };
            for camera in pad {
                series
                    .entry(camera.clone())
                    .or_insert_with(|| demo_series(camera, now, range.hours()));
            }
        }
        Ok(series)
    }

    /// The dashboard summary over a window: footfall totals plus the peak
    /// `detection_end` hour.
    pub fn summary(&self, range: TimeRange, camera_id: Option<&str>) -> Result<Summary, Error> {
        let now = self.clocks.realtime();
        let l = self.db.lock();
        let total_detections: i64 = l
            .time_series(now, range.hours(), camera_id)?
            .values()
            .flat_map(|points| points.iter().map(|(_, c)| c))
            .sum();
        let hourly = l.hourly_metrics(now, range.hours(), camera_id)?;
        drop(l);
        let peak = hourly
            .iter()
            .max_by_key(|(hour, bucket)| (bucket.detection_count, std::cmp::Reverse(hour.as_str())));
        let (peak_hour, peak_count) = match peak {
            Some((hour, bucket)) => (Some(format_peak_hour(hour)?), bucket.detection_count),
            None => (None, 0),
        };
        Ok(Summary {
            total_detections,
            avg_per_day: total_detections as f64 / range.days_f64(),
            peak_hour,
            peak_count,
        })
    }

    /// Hourly metrics rolled up by calendar day.
    pub fn daily(
        &self,
        range: TimeRange,
        camera_id: Option<&str>,
    ) -> Result<BTreeMap<String, HourBucket>, Error> {
        let now = self.clocks.realtime();
        let hourly = self.db.lock().hourly_metrics(now, range.hours(), camera_id)?;
        let mut daily: BTreeMap<String, HourBucket> = BTreeMap::new();
        for (day, group) in &hourly.iter().chunk_by(|(hour, _)| hour[..10].to_owned()) {
            let bucket = daily.entry(day).or_default();
            for (_, b) in group {
                bucket.detection_count += b.detection_count;
                bucket.left_to_right += b.left_to_right;
                bucket.right_to_left += b.right_to_left;
                bucket.unknown += b.unknown;
            }
        }
        Ok(daily)
    }

    /// Spatial density placeholder: a sparse grid with a few deterministic
    /// hot spots per camera.
    pub fn heatmap(&self, camera_id: &str, width: usize, height: usize) -> Vec<Vec<i64>> {
        let mut grid = vec![vec![0i64; width]; height];
        if width == 0 || height == 0 {
            return grid;
        }
        let mut rng = DetRng::new(camera_seed(camera_id));
        let spots = rng.in_range(3, 6);
        for _ in 0..spots {
            let x = rng.in_range(0, width as i64 - 1) as usize;
            let y = rng.in_range(0, height as i64 - 1) as usize;
            let value = rng.in_range(1, 10);
            grid[y][x] = value;
            for dy in -1i64..=1 {
                for dx in -1i64..=1 {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let (nx, ny) = (x as i64 + dx, y as i64 + dy);
                    if (0..width as i64).contains(&nx) && (0..height as i64).contains(&ny) {
                        let cell = &mut grid[ny as usize][nx as usize];
                        *cell = (*cell).max(value / 2);
                    }
                }
            }
        }
        grid
    }
}

fn format_peak_hour(bucket: &str) -> Result<String, Error> {
    // Bucket keys look like `2025-04-26 13:00`.
    let hour: u32 = bucket
        .get(11..13)
        .and_then(|h| h.parse().ok())
        .ok_or_else(|| err!(Internal, "malformed hour bucket {bucket:?}"))?;
    Ok(format!("{hour:02}:00 - {:02}:00", (hour + 1) % 24))
}

/// Deterministic per-camera pseudo-randomness, so demo values are stable
/// across calls and restarts.
struct DetRng(u64);

impl DetRng {
    fn new(seed: u64) -> Self {
        DetRng(splitmix64(seed))
    }

    fn next(&mut self) -> u64 {
        self.0 = splitmix64(self.0);
        self.0
    }

    /// Uniform-ish in `lo..=hi`.
    fn in_range(&mut self, lo: i64, hi: i64) -> i64 {
        lo + (self.next() % (hi - lo + 1) as u64) as i64
    }
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e3779b97f4a7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d049bb133111eb);
    x ^ (x >> 31)
}

fn camera_seed(camera_id: &str) -> u64 {
    // FNV-1a.
    let mut h = 0xcbf29ce484222325u64;
    for b in camera_id.bytes() {
        h = (h ^ u64::from(b)).wrapping_mul(0x100000001b3);
    }
    h
}

fn demo_count(camera_id: &str) -> i64 {
    DetRng::new(camera_seed(camera_id)).in_range(5, 15)
}

fn demo_series(camera_id: &str, now: jiff::Timestamp, hours: i64) -> Vec<HourPoint> {
    let mut points = Vec::with_capacity(hours as usize);
    for i in (1..=hours).rev() {
        let t = now
            .checked_sub(jiff::SignedDuration::from_hours(i))
            .unwrap_or(now);
        let mut rng = DetRng::new(camera_seed(camera_id) ^ i as u64);
        points.push(HourPoint {
            hour: db::timefmt::format_hour(t),
            count: rng.in_range(1, 10),
        });
    }
    points
}
