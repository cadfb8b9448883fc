// This file is part of Sightline, a multi-camera person-flow analytics engine.
// Copyright (C) 2025 The Sightline Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Clock interface and implementations for testability.
//!
//! Everything in the crate tree that reads the time or sleeps does so
//! through [`Clocks`], so tests can run time-dependent logic (track expiry,
//! warm-up windows, retention sweeps) instantly on [`SimulatedClocks`].

use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::warn;

use crate::Mutex;

/// Abstract interface to the system clocks. This is for testability.
pub trait Clocks: Send + Sync + 'static {
    /// Gets the current wall-clock time.
    fn realtime(&self) -> jiff::Timestamp;

    /// Gets the time elapsed on a monotonic clock since an unspecified epoch.
    ///
    /// On Linux, this uses `CLOCK_BOOTTIME`, which includes suspended time.
    /// On other systems, it uses `CLOCK_MONOTONIC`.
    fn monotonic(&self) -> Duration;

    /// Causes the current thread to sleep for the specified time.
    fn sleep(&self, how_long: Duration);
}

#[derive(Copy, Clone, Default)]
pub struct RealClocks {}

impl RealClocks {
    fn get(&self, clock: nix::time::ClockId) -> Duration {
        // `clock_gettime` on a supported clock only fails in a broken
        // environment; `main` checks for that at startup.
        let ts = nix::time::clock_gettime(clock).expect("clock_gettime failed");
        Duration::new(ts.tv_sec() as u64, ts.tv_nsec() as u32)
    }
}

impl Clocks for RealClocks {
    fn realtime(&self) -> jiff::Timestamp {
        jiff::Timestamp::now()
    }

    #[cfg(target_os = "linux")]
    fn monotonic(&self) -> Duration {
        self.get(nix::time::ClockId::CLOCK_BOOTTIME)
    }

    #[cfg(not(target_os = "linux"))]
    fn monotonic(&self) -> Duration {
        self.get(nix::time::ClockId::CLOCK_MONOTONIC)
    }

    fn sleep(&self, how_long: Duration) {
        thread::sleep(how_long)
    }
}

/// Logs a warning if the `TimerGuard` lives "too long", using the label
/// created by a supplied function.
pub struct TimerGuard<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> {
    clocks: &'a C,
    label_f: Option<F>,
    start: Duration,
}

impl<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> TimerGuard<'a, C, S, F> {
    pub fn new(clocks: &'a C, label_f: F) -> Self {
        TimerGuard {
            clocks,
            label_f: Some(label_f),
            start: clocks.monotonic(),
        }
    }
}

impl<'a, C, S, F> Drop for TimerGuard<'a, C, S, F>
where
    C: Clocks + ?Sized,
    S: AsRef<str>,
    F: FnOnce() -> S + 'a,
{
    fn drop(&mut self) {
        let elapsed = self.clocks.monotonic().saturating_sub(self.start);
        if elapsed.as_secs() >= 1 {
            let label_f = self.label_f.take().expect("label_f is set until drop");
            warn!("{} took {:?}!", label_f().as_ref(), elapsed);
        }
    }
}

/// Simulated clock for testing.
#[derive(Clone)]
pub struct SimulatedClocks(Arc<SimulatedClocksInner>);

struct SimulatedClocksInner {
    boot: jiff::Timestamp,
    uptime: Mutex<Duration>,
}

impl SimulatedClocks {
    pub fn new(boot: jiff::Timestamp) -> Self {
        SimulatedClocks(Arc::new(SimulatedClocksInner {
            boot,
            uptime: Mutex::new(Duration::ZERO),
        }))
    }
}

impl Clocks for SimulatedClocks {
    fn realtime(&self) -> jiff::Timestamp {
        let uptime = *self.0.uptime.lock();
        self.0
            .boot
            .checked_add(jiff::SignedDuration::try_from(uptime).expect("uptime fits"))
            .expect("simulated time overflow")
    }

    fn monotonic(&self) -> Duration {
        *self.0.uptime.lock()
    }

    /// Advances the clock by the specified amount without actually sleeping.
    fn sleep(&self, how_long: Duration) {
        let mut l = self.0.uptime.lock();
        *l += how_long;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_advances_without_blocking() {
        let boot: jiff::Timestamp = "2025-04-26T00:00:00Z".parse().unwrap();
        let c = SimulatedClocks::new(boot);
        assert_eq!(c.monotonic(), Duration::ZERO);
        c.sleep(Duration::from_secs(90));
        assert_eq!(c.monotonic(), Duration::from_secs(90));
        assert_eq!(
            c.realtime().to_string(),
            "2025-04-26T00:01:30Z".to_string()
        );
    }
}
