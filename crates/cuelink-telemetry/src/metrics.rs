use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// In-memory counter. Monotonically increasing.
#[derive(Debug, Default)]
struct Counter {
    value: AtomicU64,
}

impl Counter {
    fn increment(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }
    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// In-memory gauge holding the last observed value.
#[derive(Debug, Default)]
struct Gauge {
    // f64 bits
    value: AtomicU64,
}

impl Gauge {
    fn set(&self, v: f64) {
        self.value.store(v.to_bits(), Ordering::Relaxed);
    }
    fn get(&self) -> f64 {
        f64::from_bits(self.value.load(Ordering::Relaxed))
    }
}

/// Point-in-time copy of [`ClientMetrics`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub reconnects: u64,
    pub envelopes_received: u64,
    pub malformed_dropped: u64,
    pub metadata_pushed: u64,
    pub metadata_evicted: u64,
    pub metadata_emitted: u64,
    pub health_transitions: u64,
    pub commands_sent: u64,
    pub commands_failed: u64,
    pub fps_ewma: f64,
    /// Share of pushed metadata samples evicted before emission, `0.0..=1.0`.
    pub metadata_drop_rate: f64,
}

/// Counters for one client runtime. Shared by `Arc` between components.
#[derive(Debug, Default)]
pub struct ClientMetrics {
    reconnects: Counter,
    envelopes_received: Counter,
    malformed_dropped: Counter,
    metadata_pushed: Counter,
    metadata_evicted: Counter,
    metadata_emitted: Counter,
    health_transitions: Counter,
    commands_sent: Counter,
    commands_failed: Counter,
    fps_ewma: Gauge,
}

impl ClientMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_reconnect(&self) {
        self.reconnects.increment(1);
    }

    pub fn record_envelope(&self) {
        self.envelopes_received.increment(1);
    }

    pub fn record_malformed(&self) {
        self.malformed_dropped.increment(1);
    }

    pub fn record_metadata_pushed(&self) {
        self.metadata_pushed.increment(1);
    }

    pub fn record_metadata_evicted(&self, n: u64) {
        self.metadata_evicted.increment(n);
    }

    pub fn record_metadata_emitted(&self) {
        self.metadata_emitted.increment(1);
    }

    pub fn record_health_transition(&self) {
        self.health_transitions.increment(1);
    }

    pub fn record_command_sent(&self) {
        self.commands_sent.increment(1);
    }

    pub fn record_command_failed(&self) {
        self.commands_failed.increment(1);
    }

    pub fn set_fps_ewma(&self, fps: f64) {
        self.fps_ewma.set(fps);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let pushed = self.metadata_pushed.get();
        let evicted = self.metadata_evicted.get();
        let metadata_drop_rate = if pushed == 0 {
            0.0
        } else {
            (evicted as f64 / pushed as f64).min(1.0)
        };
        MetricsSnapshot {
            reconnects: self.reconnects.get(),
            envelopes_received: self.envelopes_received.get(),
            malformed_dropped: self.malformed_dropped.get(),
            metadata_pushed: pushed,
            metadata_evicted: evicted,
            metadata_emitted: self.metadata_emitted.get(),
            health_transitions: self.health_transitions.get(),
            commands_sent: self.commands_sent.get(),
            commands_failed: self.commands_failed.get(),
            fps_ewma: self.fps_ewma.get(),
            metadata_drop_rate,
        }
    }
}
