// This file is part of Sightline, a multi-camera person-flow analytics engine.
// Copyright (C) 2025 The Sightline Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The outbound notification port.
//!
//! Workers publish through [`Notifier`] and never know who is listening.
//! [`EventBus`] is the in-process implementation: subscribers register a
//! callback which is retained while it returns `true`, so the HTTP adapter
//! or a push channel can attach and detach freely. Delivery is best-effort,
//! fire-and-forget.

use base::clock::Clocks;
use base::Mutex;
use std::sync::Arc;
use tracing::debug;

pub trait Notifier: Send + Sync {
    /// Publishes one event. A `timestamp` field is injected into object
    /// payloads if absent.
    fn emit(&self, event_type: &str, payload: serde_json::Value);
}

/// Discards everything; for wiring without any notification channel.
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn emit(&self, _event_type: &str, _payload: serde_json::Value) {}
}

type Subscriber = Box<dyn FnMut(&str, &serde_json::Value) -> bool + Send>;

pub struct EventBus {
    clocks: Arc<dyn Clocks>,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl EventBus {
    pub fn new(clocks: Arc<dyn Clocks>) -> Arc<Self> {
        Arc::new(EventBus {
            clocks,
            subscribers: Mutex::new(Vec::new()),
        })
    }

    /// Registers a callback, retained while it returns `true`.
    pub fn subscribe<F: FnMut(&str, &serde_json::Value) -> bool + Send + 'static>(&self, f: F) {
        self.subscribers.lock().push(Box::new(f));
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl Notifier for EventBus {
    fn emit(&self, event_type: &str, mut payload: serde_json::Value) {
        if let Some(map) = payload.as_object_mut() {
            map.entry("timestamp")
                .or_insert_with(|| db::timefmt::format(self.clocks.realtime()).into());
        }
        debug!(event_type, %payload, "event");
        let mut subscribers = self.subscribers.lock();
        subscribers.retain_mut(|s| s(event_type, &payload));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::clock::SimulatedClocks;
    use serde_json::json;

    fn bus() -> Arc<EventBus> {
        let clocks = Arc::new(SimulatedClocks::new("2025-04-26T10:00:00Z".parse().unwrap()));
        EventBus::new(clocks)
    }

    #[test]
    fn injects_timestamp_when_absent() {
        let bus = bus();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        bus.subscribe(move |t, p| {
            seen2.lock().push((t.to_owned(), p.clone()));
            true
        });
        bus.emit("entry", json!({"camera": "main", "track_id": 7}));
        bus.emit(
            "exit",
            json!({"camera": "main", "timestamp": "2020-01-01 00:00:00"}),
        );
        let seen = seen.lock();
        assert_eq!(seen[0].1["timestamp"], "2025-04-26 10:00:00");
        assert_eq!(seen[0].1["camera"], "main");
        // An existing timestamp is preserved.
        assert_eq!(seen[1].1["timestamp"], "2020-01-01 00:00:00");
    }

    #[test]
    fn subscribers_detach_by_returning_false() {
        let bus = bus();
        let calls = Arc::new(Mutex::new(0));
        let calls2 = calls.clone();
        bus.subscribe(move |_, _| {
            *calls2.lock() += 1;
            false
        });
        bus.subscribe(|_, _| true);
        bus.emit("entry", json!({}));
        bus.emit("entry", json!({}));
        assert_eq!(*calls.lock(), 1);
        assert_eq!(bus.subscriber_count(), 1);
    }
}
