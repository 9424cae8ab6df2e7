//! Bounded, time-throttled sink for high-frequency telemetry.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use cuelink_core::{Clock, Scheduler, Subscribers, Subscription, TimerHandle};

/// How a window of buffered samples collapses to one emitted payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplingStrategy {
    /// The most recent sample.
    #[default]
    Latest,
    /// Reserved for numeric aggregation; currently identical to `Latest`.
    Average,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BufferConfig {
    pub max_size: usize,
    pub throttle: Duration,
    pub strategy: SamplingStrategy,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            throttle: Duration::from_millis(1000),
            strategy: SamplingStrategy::Latest,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TelemetrySample<T> {
    pub captured_at: i64,
    pub payload: T,
}

struct Window<T> {
    samples: VecDeque<TelemetrySample<T>>,
    last_emit: i64,
    evicted: u64,
}

pub struct TelemetryBuffer<T> {
    config: BufferConfig,
    clock: Arc<dyn Clock>,
    window: Mutex<Window<T>>,
    subscribers: Subscribers<T>,
    ticker: Mutex<Option<TimerHandle>>,
}

impl<T: Clone + Send + Sync + 'static> TelemetryBuffer<T> {
    pub fn new(config: BufferConfig, clock: Arc<dyn Clock>) -> Arc<Self> {
        let capacity = config.max_size.min(1024);
        Arc::new(Self {
            config,
            clock,
            window: Mutex::new(Window {
                samples: VecDeque::with_capacity(capacity),
                last_emit: 0,
                evicted: 0,
            }),
            subscribers: Subscribers::new(),
            ticker: Mutex::new(None),
        })
    }

    /// Start the emission loop, checking every half throttle interval.
    pub fn start(self: &Arc<Self>, scheduler: &dyn Scheduler) {
        let period = (self.config.throttle / 2).max(Duration::from_millis(1));
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = scheduler.every(
            period,
            Box::new(move || {
                if let Some(buffer) = weak.upgrade() {
                    buffer.tick();
                }
            }),
        );
        *self.ticker.lock() = Some(handle);
    }

    /// Append a sample, evicting the oldest while over capacity. Returns the
    /// number of samples evicted.
    pub fn push(&self, payload: T) -> usize {
        let captured_at = self.clock.now_ms();
        let mut window = self.window.lock();
        window.samples.push_back(TelemetrySample {
            captured_at,
            payload,
        });
        let mut evicted = 0;
        while window.samples.len() > self.config.max_size {
            window.samples.pop_front();
            evicted += 1;
        }
        window.evicted += evicted as u64;
        evicted
    }

    /// One pass of the emission loop. Returns whether a payload was emitted.
    pub fn tick(&self) -> bool {
        let now = self.clock.now_ms();
        let throttle_ms = self.config.throttle.as_millis() as i64;
        let sampled = {
            let mut window = self.window.lock();
            if now - window.last_emit < throttle_ms || window.samples.is_empty() {
                return false;
            }
            let sampled = sample(self.config.strategy, &window.samples);
            window.samples.clear();
            window.last_emit = now;
            sampled
        };
        match sampled {
            Some(payload) => {
                trace!("emitting throttled sample");
                self.subscribers.emit(&payload);
                true
            }
            None => false,
        }
    }

    pub fn subscribe(&self, handler: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        self.subscribers.subscribe(handler)
    }

    pub fn clear(&self) {
        self.window.lock().samples.clear();
    }

    pub fn size(&self) -> usize {
        self.window.lock().samples.len()
    }

    /// Samples evicted for capacity since creation.
    pub fn evicted(&self) -> u64 {
        self.window.lock().evicted
    }

    pub fn samples(&self) -> Vec<TelemetrySample<T>> {
        self.window.lock().samples.iter().cloned().collect()
    }

    /// Stop the emission loop, drop buffered samples and subscribers.
    pub fn destroy(&self) {
        if let Some(ticker) = self.ticker.lock().take() {
            ticker.cancel();
        }
        self.clear();
        self.subscribers.clear();
    }
}

fn sample<T: Clone>(strategy: SamplingStrategy, samples: &VecDeque<TelemetrySample<T>>) -> Option<T> {
    match strategy {
        SamplingStrategy::Latest | SamplingStrategy::Average => {
            samples.back().map(|s| s.payload.clone())
        }
    }
}
