//! Service metrics.
//!
//! Counters and gauges are kept as atomics for cheap snapshots (health
//! reporting, tests) and mirrored to the `metrics` facade with a `cc_`
//! prefix for the Prometheus exporter installed in `main`.

use metrics::{counter, gauge};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared counters for the consultation controller.
#[derive(Debug, Default)]
pub struct CoreMetrics {
    /// Currently active rooms.
    rooms: AtomicUsize,
    /// Currently active participant sessions.
    sessions: AtomicUsize,
    /// Negotiation frames forwarded since start.
    relays_forwarded: AtomicU64,
    /// Relay frames dropped because the target was absent.
    relays_dropped: AtomicU64,
    /// Admissions denied since start.
    admissions_denied: AtomicU64,
}

/// Point-in-time view of the gauges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub rooms: usize,
    pub sessions: usize,
}

impl CoreMetrics {
    /// Create a new shared metrics handle.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A room was created.
    pub fn room_opened(&self) {
        let count = self.rooms.fetch_add(1, Ordering::Relaxed) + 1;
        gauge!("cc_rooms_active").set(usize_to_f64(count));
    }

    /// A room was torn down.
    pub fn room_closed(&self) {
        let count = self
            .rooms
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            })
            .unwrap_or(0)
            .saturating_sub(1);
        gauge!("cc_rooms_active").set(usize_to_f64(count));
    }

    /// A participant session was admitted.
    pub fn session_opened(&self) {
        let count = self.sessions.fetch_add(1, Ordering::Relaxed) + 1;
        gauge!("cc_sessions_active").set(usize_to_f64(count));
    }

    /// A participant session ended.
    pub fn session_closed(&self) {
        let count = self
            .sessions
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            })
            .unwrap_or(0)
            .saturating_sub(1);
        gauge!("cc_sessions_active").set(usize_to_f64(count));
    }

    /// A negotiation frame was forwarded to its target.
    pub fn relay_forwarded(&self, kind: &'static str) {
        self.relays_forwarded.fetch_add(1, Ordering::Relaxed);
        counter!("cc_relays_forwarded_total", "kind" => kind).increment(1);
    }

    /// A negotiation frame was dropped (target absent).
    pub fn relay_dropped(&self) {
        self.relays_dropped.fetch_add(1, Ordering::Relaxed);
        counter!("cc_relays_dropped_total").increment(1);
    }

    /// An admission was denied.
    pub fn admission_denied(&self, reason: &'static str) {
        self.admissions_denied.fetch_add(1, Ordering::Relaxed);
        counter!("cc_admissions_denied_total", "reason" => reason).increment(1);
    }

    /// Snapshot the gauges.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            rooms: self.rooms.load(Ordering::Relaxed),
            sessions: self.sessions.load(Ordering::Relaxed),
        }
    }

    /// Total relayed frames (diagnostics).
    #[must_use]
    pub fn relays_forwarded(&self) -> u64 {
        self.relays_forwarded.load(Ordering::Relaxed)
    }

    /// Total dropped relay frames (diagnostics).
    #[must_use]
    pub fn relays_dropped(&self) -> u64 {
        self.relays_dropped.load(Ordering::Relaxed)
    }
}

/// Gauge values stay far below 2^52; the cast is lossless in practice.
#[allow(clippy::cast_precision_loss)]
fn usize_to_f64(value: usize) -> f64 {
    value as f64
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_room_gauge_tracks_open_close() {
        let metrics = CoreMetrics::new();

        metrics.room_opened();
        metrics.room_opened();
        assert_eq!(metrics.snapshot().rooms, 2);

        metrics.room_closed();
        assert_eq!(metrics.snapshot().rooms, 1);
    }

    #[test]
    fn test_room_close_saturates_at_zero() {
        let metrics = CoreMetrics::new();
        metrics.room_closed();
        assert_eq!(metrics.snapshot().rooms, 0);
    }

    #[test]
    fn test_relay_counters() {
        let metrics = CoreMetrics::new();

        metrics.relay_forwarded("primary");
        metrics.relay_forwarded("screen-share");
        metrics.relay_dropped();

        assert_eq!(metrics.relays_forwarded(), 2);
        assert_eq!(metrics.relays_dropped(), 1);
    }
}
