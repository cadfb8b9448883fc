// This file is part of Sightline, a multi-camera person-flow analytics engine.
// Copyright (C) 2025 The Sightline Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Per-camera frame acquisition.
//!
//! A [`FrameSource`] owns one producer thread which opens the source,
//! decodes frames, and overwrites the freshest-frame mailbox. Readers take
//! cheap copies without ever blocking the producer. The producer is meant to
//! be long-lived; it tolerates warm-up flakiness, reconnects on failure
//! bursts with a fixed back-off, loops video files at their declared rate,
//! and gives up only after exhausting its reconnection budget.

use crate::stream::{Frame, Geometry, Opener, Source};
use base::clock::Clocks;
use base::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Lifecycle state, visible through [`FrameSource::status`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Idle,
    Opening,
    WarmUp,
    Streaming,
    Reconnecting,
    Failed,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct SourceStatus {
    pub state: State,
    /// Frames delivered over the last measurement window.
    pub effective_fps: f64,
}

/// Knobs of the acquisition state machine, with the production defaults.
#[derive(Copy, Clone, Debug)]
pub struct Tuning {
    /// Window after opening a USB device during which read failures are
    /// silently tolerated.
    pub warm_up: Duration,
    /// Fixed pause between open attempts.
    pub retry_delay: Duration,
    /// Open attempts per connection round before giving up.
    pub max_retries: usize,
    /// Read-failure burst size that triggers a reconnect (post warm-up).
    pub max_consecutive_failures: usize,
    /// Total failed connection rounds before the source is marked Failed.
    pub max_reconnection_attempts: usize,
    /// How long `stop` waits for the producer thread to drain.
    pub stop_grace: Duration,
}

impl Default for Tuning {
    fn default() -> Self {
        Tuning {
            warm_up: Duration::from_secs(10),
            retry_delay: Duration::from_secs(3),
            max_retries: 10,
            max_consecutive_failures: 50,
            max_reconnection_attempts: 15,
            stop_grace: Duration::from_secs(2),
        }
    }
}

/// Pause between read attempts when no frame is available.
const READ_RETRY_PAUSE: Duration = Duration::from_millis(100);

/// Largest single sleep while pacing a file, to stay responsive to `stop`.
const PACE_SLICE: Duration = Duration::from_millis(10);

struct Status {
    state: State,
    effective_fps: f64,
}

pub struct FrameSource {
    camera_id: String,
    source: Source,
    geometry: Geometry,
    tuning: Tuning,
    opener: Arc<dyn Opener>,
    clocks: Arc<dyn Clocks>,

    /// The freshest-frame mailbox: the producer overwrites, readers clone.
    latest: Mutex<Option<Frame>>,

    status: Mutex<Status>,
    frames_total: AtomicU64,
    run: AtomicBool,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

/// What ended one open-stream session.
enum SessionEnd {
    Stop,
    /// Clean end of a file; reopen without it counting against anything.
    Eof,
    /// Too many consecutive read failures; reconnect.
    FailureBurst,
}

impl FrameSource {
    pub fn new(
        camera_id: String,
        source: Source,
        geometry: Geometry,
        tuning: Tuning,
        opener: Arc<dyn Opener>,
        clocks: Arc<dyn Clocks>,
    ) -> Arc<Self> {
        Arc::new(FrameSource {
            camera_id,
            source,
            geometry,
            tuning,
            opener,
            clocks,
            latest: Mutex::new(None),
            status: Mutex::new(Status {
                state: State::Idle,
                effective_fps: 0.0,
            }),
            frames_total: AtomicU64::new(0),
            run: AtomicBool::new(false),
            handle: Mutex::new(None),
        })
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    /// Starts the producer thread. A no-op if already running.
    pub fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock();
        if self.run.swap(true, Ordering::SeqCst) {
            warn!(camera = %self.camera_id, "capture already running");
            return;
        }
        self.set_state(State::Opening);
        let this = self.clone();
        *handle = Some(
            thread::Builder::new()
                .name(format!("capture-{}", self.camera_id))
                .spawn(move || {
                    this.run_loop();
                    info!(camera = %this.camera_id, "capture thread exiting");
                })
                .expect("can't create thread"),
        );
    }

    /// Signals the producer to stop and waits up to the configured grace
    /// period. A thread that doesn't drain in time is abandoned with a
    /// warning (acceptable: this happens only at process exit).
    pub fn stop(&self) {
        self.run.store(false, Ordering::SeqCst);
        let handle = { self.handle.lock().take() };
        let Some(handle) = handle else { return };
        let deadline = std::time::Instant::now() + self.tuning.stop_grace;
        while !handle.is_finished() {
            if std::time::Instant::now() >= deadline {
                warn!(camera = %self.camera_id, "capture thread did not stop in time; abandoning");
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        let _ = handle.join();
        if self.state() != State::Failed {
            self.set_state(State::Idle);
        }
    }

    /// Returns a copy of the most recent frame, if any. Never blocks the
    /// producer for longer than the mailbox swap.
    pub fn latest(&self) -> Option<Frame> {
        self.latest.lock().clone()
    }

    pub fn is_active(&self) -> bool {
        self.run.load(Ordering::SeqCst)
            && matches!(self.state(), State::WarmUp | State::Streaming)
    }

    pub fn status(&self) -> SourceStatus {
        let s = self.status.lock();
        SourceStatus {
            state: s.state,
            effective_fps: s.effective_fps,
        }
    }

    fn state(&self) -> State {
        self.status.lock().state
    }

    fn set_state(&self, state: State) {
        self.status.lock().state = state;
    }

    fn running(&self) -> bool {
        self.run.load(Ordering::SeqCst)
    }

    /// Sleeps for `total` in small slices, returning false if stopped.
    fn interruptible_sleep(&self, total: Duration) -> bool {
        let deadline = self.clocks.monotonic() + total;
        loop {
            if !self.running() {
                return false;
            }
            let now = self.clocks.monotonic();
            if now >= deadline {
                return true;
            }
            self.clocks.sleep(READ_RETRY_PAUSE.min(deadline - now));
        }
    }

    fn run_loop(&self) {
        let mut reconnection_attempts = 0;
        let mut retry_count = 0;
        while self.running() {
            self.set_state(State::Opening);
            info!(camera = %self.camera_id, source = %self.source, "opening source");
            let stream = match self.opener.open(&self.source, self.geometry) {
                Ok(s) => s,
                Err(e) => {
                    reconnection_attempts += 1;
                    retry_count += 1;
                    if reconnection_attempts >= self.tuning.max_reconnection_attempts
                        || retry_count >= self.tuning.max_retries
                    {
                        error!(
                            camera = %self.camera_id,
                            source = %self.source,
                            attempts = reconnection_attempts,
                            err = %e.chain(),
                            "giving up on source"
                        );
                        self.set_state(State::Failed);
                        return;
                    }
                    warn!(
                        camera = %self.camera_id,
                        attempt = retry_count,
                        max = self.tuning.max_retries,
                        err = %e.chain(),
                        "open failed; retrying"
                    );
                    self.set_state(State::Reconnecting);
                    if !self.interruptible_sleep(self.tuning.retry_delay) {
                        return;
                    }
                    continue;
                }
            };
            retry_count = 0;
            match self.run_stream(stream) {
                SessionEnd::Stop => return,
                SessionEnd::Eof => {
                    // Looping a file is not a failure.
                    debug!(camera = %self.camera_id, "end of stream; reopening");
                }
                SessionEnd::FailureBurst => {
                    reconnection_attempts += 1;
                    if reconnection_attempts >= self.tuning.max_reconnection_attempts {
                        error!(
                            camera = %self.camera_id,
                            attempts = reconnection_attempts,
                            "exceeded reconnection budget; giving up"
                        );
                        self.set_state(State::Failed);
                        return;
                    }
                    self.set_state(State::Reconnecting);
                    if !self.interruptible_sleep(self.tuning.retry_delay) {
                        return;
                    }
                }
            }
        }
    }

    /// Reads one open stream until stop, EOF, or a failure burst.
    fn run_stream(&self, mut stream: Box<dyn crate::stream::Stream>) -> SessionEnd {
        let warm_up_until = if self.source.needs_warm_up() {
            info!(
                camera = %self.camera_id,
                secs = self.tuning.warm_up.as_secs(),
                "warm-up window started"
            );
            self.set_state(State::WarmUp);
            Some(self.clocks.monotonic() + self.tuning.warm_up)
        } else {
            self.set_state(State::Streaming);
            None
        };
        let mut in_warm_up = warm_up_until.is_some();
        let mut consecutive_failures = 0usize;
        let mut last_frame_at = self.clocks.monotonic();
        let mut window_start = self.clocks.monotonic();
        let mut window_frames = 0u32;

        loop {
            if !self.running() {
                return SessionEnd::Stop;
            }
            if in_warm_up && warm_up_until.is_some_and(|t| self.clocks.monotonic() >= t) {
                in_warm_up = false;
                self.set_state(State::Streaming);
                info!(camera = %self.camera_id, "warm-up complete");
            }
            if self.source.is_file() {
                let fps = stream
                    .declared_fps()
                    .unwrap_or(self.geometry.fps.max(1) as f64);
                if !self.pace(&mut last_frame_at, fps) {
                    return SessionEnd::Stop;
                }
            }
            match stream.next_frame() {
                Ok(Some(frame)) => {
                    if consecutive_failures > 0 {
                        info!(
                            camera = %self.camera_id,
                            after = consecutive_failures,
                            "read recovered"
                        );
                        consecutive_failures = 0;
                    }
                    *self.latest.lock() = Some(frame);
                    self.frames_total.fetch_add(1, Ordering::Relaxed);
                    window_frames += 1;
                    let elapsed = self.clocks.monotonic() - window_start;
                    if elapsed >= Duration::from_secs(1) {
                        self.status.lock().effective_fps =
                            window_frames as f64 / elapsed.as_secs_f64();
                        window_start = self.clocks.monotonic();
                        window_frames = 0;
                    }
                }
                Ok(None) => return SessionEnd::Eof,
                Err(e) => {
                    if in_warm_up {
                        // Expected driver flakiness; not even counted.
                        debug!(camera = %self.camera_id, err = %e.chain(), "read failed in warm-up");
                    } else {
                        consecutive_failures += 1;
                        warn!(
                            camera = %self.camera_id,
                            failures = consecutive_failures,
                            max = self.tuning.max_consecutive_failures,
                            err = %e.chain(),
                            "failed to read frame"
                        );
                        if consecutive_failures > self.tuning.max_consecutive_failures {
                            return SessionEnd::FailureBurst;
                        }
                    }
                    if !self.interruptible_sleep(READ_RETRY_PAUSE) {
                        return SessionEnd::Stop;
                    }
                }
            }
        }
    }

    /// Holds file playback to `fps`, sleeping in slices of at most
    /// [`PACE_SLICE`] so `stop` stays responsive. Returns false if stopped.
    fn pace(&self, last_frame_at: &mut Duration, fps: f64) -> bool {
        let interval = Duration::from_secs_f64(1.0 / fps.max(0.001));
        loop {
            if !self.running() {
                return false;
            }
            let now = self.clocks.monotonic();
            let elapsed = now.saturating_sub(*last_frame_at);
            if elapsed >= interval {
                break;
            }
            self.clocks.sleep(PACE_SLICE.min(interval - elapsed));
        }
        *last_frame_at = self.clocks.monotonic();
        true
    }

    #[cfg(test)]
    fn frames_total(&self) -> u64 {
        self.frames_total.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{self, Stream};
    use base::clock::SimulatedClocks;

    fn clocks() -> Arc<SimulatedClocks> {
        Arc::new(SimulatedClocks::new("2025-04-26T00:00:00Z".parse().unwrap()))
    }

    /// One scripted read outcome.
    enum Step {
        Frame(u8),
        Fail,
        Eof,
    }

    /// A stream that replays a script. When the script runs out it clears
    /// the source's run flag (so the capture loop winds down on its own)
    /// and then reports failures.
    struct ScriptStream {
        steps: std::vec::IntoIter<Step>,
        fps: Option<f64>,
        stop_on_exhausted: Arc<FrameSource>,
    }

    impl Stream for ScriptStream {
        fn next_frame(&mut self) -> Result<Option<Frame>, base::Error> {
            match self.steps.next() {
                Some(Step::Frame(luma)) => Ok(Some(stream::test_frame(8, 8, luma))),
                Some(Step::Fail) => Err(base::err!(Unavailable, "scripted failure")),
                Some(Step::Eof) => Ok(None),
                None => {
                    self.stop_on_exhausted.run.store(false, Ordering::SeqCst);
                    Err(base::err!(Unavailable, "script exhausted"))
                }
            }
        }

        fn declared_fps(&self) -> Option<f64> {
            self.fps
        }
    }

    struct ScriptOpener {
        streams: Mutex<Vec<(Vec<Step>, Option<f64>)>>,
        open_failures_first: Mutex<usize>,
        /// Set once the source under test exists; see `fixture`.
        stop_target: Mutex<Option<Arc<FrameSource>>>,
    }

    impl crate::stream::Opener for ScriptOpener {
        fn open(
            &self,
            _source: &Source,
            _geometry: Geometry,
        ) -> Result<Box<dyn Stream>, base::Error> {
            let target = self
                .stop_target
                .lock()
                .clone()
                .expect("fixture sets stop_target before the loop runs");
            {
                let mut failures = self.open_failures_first.lock();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(base::err!(Unavailable, "scripted open failure"));
                }
            }
            let mut streams = self.streams.lock();
            if streams.is_empty() {
                target.run.store(false, Ordering::SeqCst);
                return Err(base::err!(Unavailable, "no more scripted streams"));
            }
            let (steps, fps) = streams.remove(0);
            Ok(Box::new(ScriptStream {
                steps: steps.into_iter(),
                fps,
                stop_on_exhausted: target,
            }))
        }
    }

    /// Builds a `FrameSource` over a scripted opener and arms its run flag;
    /// tests then drive `run_loop` synchronously on simulated clocks.
    fn fixture(
        source: &str,
        tuning: Tuning,
        open_failures_first: usize,
        streams: Vec<(Vec<Step>, Option<f64>)>,
    ) -> (Arc<FrameSource>, Arc<SimulatedClocks>) {
        let clocks = clocks();
        let opener = Arc::new(ScriptOpener {
            streams: Mutex::new(streams),
            open_failures_first: Mutex::new(open_failures_first),
            stop_target: Mutex::new(None),
        });
        let src = FrameSource::new(
            "cam".to_owned(),
            Source::parse(source).unwrap(),
            Geometry::default(),
            tuning,
            opener.clone(),
            clocks.clone(),
        );
        *opener.stop_target.lock() = Some(src.clone());
        src.run.store(true, Ordering::SeqCst);
        (src, clocks)
    }

    #[test]
    fn frames_flow_and_mailbox_keeps_freshest() {
        let tuning = Tuning {
            max_consecutive_failures: 2,
            ..Tuning::default()
        };
        let (src, _clocks) = fixture(
            "rtsp://cam.local/main",
            tuning,
            0,
            vec![(vec![Step::Frame(1), Step::Frame(2), Step::Frame(3)], None)],
        );
        src.run_loop();
        assert_eq!(src.frames_total(), 3);
        // Only the most recent frame is retained.
        assert_eq!(src.latest().unwrap().data()[0], 3);
    }

    #[test]
    fn file_eof_reopens_without_failure() {
        let tuning = Tuning {
            max_reconnection_attempts: 1, // any counted failure would be fatal
            ..Tuning::default()
        };
        let (src, _clocks) = fixture(
            "videos/hall.mp4",
            tuning,
            0,
            vec![
                (vec![Step::Frame(1), Step::Eof], Some(25.0)),
                (vec![Step::Frame(2), Step::Eof], Some(25.0)),
                (vec![Step::Frame(3)], Some(25.0)),
            ],
        );
        src.run_loop();
        // All three sessions delivered; EOF never tripped the budget.
        assert_eq!(src.frames_total(), 3);
        assert_ne!(src.state(), State::Failed);
    }

    #[test]
    fn open_failures_exhaust_to_failed() {
        let tuning = Tuning {
            retry_delay: Duration::from_millis(100),
            max_retries: 3,
            ..Tuning::default()
        };
        let (src, _clocks) = fixture("rtsp://cam.local/main", tuning, 99, vec![]);
        src.run_loop();
        assert_eq!(src.state(), State::Failed);
        assert_eq!(src.frames_total(), 0);
        assert!(!src.is_active());
    }

    #[test]
    fn warm_up_tolerates_failures() {
        let tuning = Tuning {
            warm_up: Duration::from_secs(1),
            max_consecutive_failures: 3,
            max_reconnection_attempts: 1, // a counted burst would be fatal
            ..Tuning::default()
        };
        // Five straight failures would exceed the burst threshold if they
        // counted, but they land inside the warm-up window.
        let steps = vec![
            Step::Fail,
            Step::Fail,
            Step::Fail,
            Step::Fail,
            Step::Fail,
            Step::Frame(7),
        ];
        let (src, _clocks) = fixture("0", tuning, 0, vec![(steps, None)]);
        src.run_loop();
        assert_eq!(src.frames_total(), 1);
        assert_ne!(src.state(), State::Failed);
    }

    #[test]
    fn failure_burst_reconnects() {
        let tuning = Tuning {
            retry_delay: Duration::from_millis(100),
            max_consecutive_failures: 2,
            ..Tuning::default()
        };
        let (src, _clocks) = fixture(
            "rtsp://cam.local/main",
            tuning,
            0,
            vec![
                (
                    vec![Step::Frame(1), Step::Fail, Step::Fail, Step::Fail],
                    None,
                ),
                (vec![Step::Frame(2)], None),
            ],
        );
        src.run_loop();
        // The second stream was opened after the burst.
        assert_eq!(src.frames_total(), 2);
        assert_eq!(src.latest().unwrap().data()[0], 2);
    }

    #[test]
    fn start_and_stop_drain() {
        let opener = Arc::new(ScriptOpener {
            streams: Mutex::new(vec![(
                (0..50_000).map(|i| Step::Frame(i as u8)).collect(),
                None,
            )]),
            open_failures_first: Mutex::new(0),
            stop_target: Mutex::new(None),
        });
        let src = FrameSource::new(
            "cam".to_owned(),
            Source::parse("rtsp://cam.local/main").unwrap(),
            Geometry::default(),
            Tuning::default(),
            opener.clone(),
            Arc::new(base::clock::RealClocks {}),
        );
        *opener.stop_target.lock() = Some(src.clone());
        src.start();
        std::thread::sleep(Duration::from_millis(20));
        assert!(src.latest().is_some());
        src.stop();
        assert!(!src.is_active());
        // Stopping again is harmless.
        src.stop();
    }

    #[test]
    fn file_pacing_honors_declared_fps() {
        let tuning = Tuning::default();
        let (src, clocks) = fixture(
            "videos/hall.mp4",
            tuning,
            0,
            vec![(
                vec![Step::Frame(1), Step::Frame(2), Step::Frame(3), Step::Frame(4)],
                Some(10.0),
            )],
        );
        let before = clocks.monotonic();
        src.run_loop();
        let elapsed = clocks.monotonic() - before;
        // Three inter-frame delays at 10 fps: at least 300 ms of simulated
        // time must have passed.
        assert!(elapsed >= Duration::from_millis(300), "{elapsed:?}");
    }
}
