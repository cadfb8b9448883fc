// This file is part of Sightline, a multi-camera person-flow analytics engine.
// Copyright (C) 2025 The Sightline Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Timestamp formatting for the event store.
//!
//! All persisted timestamps are UTC in `YYYY-MM-DD HH:MM:SS` form, chosen so
//! that string lexicographic order equals temporal order and SQLite's
//! `strftime`/`datetime` functions accept them directly.

use jiff::Timestamp;

/// Formats `ts` as a store timestamp, truncating sub-second precision.
pub fn format(ts: Timestamp) -> String {
    ts.strftime("%Y-%m-%d %H:%M:%S").to_string()
}

/// Formats the hour bucket containing `ts`, e.g. `2025-04-26 13:00`.
pub fn format_hour(ts: Timestamp) -> String {
    ts.strftime("%Y-%m-%d %H:00").to_string()
}

/// Formats the day bucket containing `ts`, e.g. `2025-04-26`.
pub fn format_day(ts: Timestamp) -> String {
    ts.strftime("%Y-%m-%d").to_string()
}

/// Timestamp of the snapshot filename form, `YYYYMMDD_HHMMSS_ffffff` (UTC,
/// microseconds).
pub fn format_snapshot(ts: Timestamp) -> String {
    let micros = ts.subsec_nanosecond().unsigned_abs() / 1_000;
    format!("{}_{micros:06}", ts.strftime("%Y%m%d_%H%M%S"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> Timestamp {
        s.parse().unwrap()
    }

    #[test]
    fn store_format() {
        assert_eq!(
            format(ts("2025-04-26T01:02:03.999Z")),
            "2025-04-26 01:02:03"
        );
        assert_eq!(format_hour(ts("2025-04-26T01:02:03Z")), "2025-04-26 01:00");
        assert_eq!(format_day(ts("2025-04-26T01:02:03Z")), "2025-04-26");
    }

    #[test]
    fn lexicographic_order_is_temporal_order() {
        let a = format(ts("2025-04-26T09:59:59Z"));
        let b = format(ts("2025-04-26T10:00:00Z"));
        let c = format(ts("2025-12-01T00:00:00Z"));
        assert!(a < b && b < c);
    }

    #[test]
    fn snapshot_format() {
        assert_eq!(
            format_snapshot(ts("2025-04-26T01:02:03.004005Z")),
            "20250426_010203_004005"
        );
    }
}
